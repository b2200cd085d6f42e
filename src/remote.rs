//! Remote command execution on the laser host.
//!
//! One authenticated SSH connection is held for the whole run. Each sample
//! fires the laser by exec-ing the CNC driver on the remote side from a
//! short-lived thread; the orchestrator never waits on that thread, because
//! the only observable consequence of the trigger is light arriving at the
//! meter on the local serial port.
//!
//! Only root can operate the GPIO pins on the remote host, so the default
//! login is root. Callers must not start a new trigger before the previous
//! sample's capture has finished; the connection is reused sequentially.

use std::net::TcpStream;
use std::thread::{self, JoinHandle};

use log::{debug, info};
use ssh2::{Channel, Session};

use crate::errors::{CollectorError, Result};

/// Default SSH port on the laser host.
const SSH_PORT: u16 = 22;

/// CNC driver binary on the remote host.
pub const DEFAULT_DRIVER: &str = "/home/ubuntu/Development/cups_driver/src/CNC/cups_driver";

/// Directory of per-duty laser configuration files on the remote host.
pub const DEFAULT_CONFIG_DIR: &str = "/home/ubuntu/Development/cups_driver/src/CNC/CNC/Configs/";

/// Laser on-time in seconds, passed verbatim to the driver.
pub const DEFAULT_FIRE_SECS: &str = "0.0150";

// ============================================================================
// Trigger Command
// ============================================================================

/// Map a duty cycle to its pre-existing configuration file name.
///
/// Rejects values outside [20, 80] before any file name is formed; the
/// remote config set only covers that range.
pub fn config_for_duty(duty: u8) -> Result<String> {
    if !(20..=80).contains(&duty) {
        return Err(CollectorError::InvalidDuty(duty));
    }
    Ok(format!("0{}_test.json", duty))
}

/// Check a duty-cycle range up front, so bad bounds fail before any
/// hardware is touched or a run directory is created.
pub fn validate_duty_range(min: u8, max: u8) -> Result<()> {
    config_for_duty(min)?;
    config_for_duty(max)?;
    Ok(())
}

/// Builder for the remote laser-firing command line.
///
/// Arguments are assembled as an explicit vector and only joined at the exec
/// boundary; nothing user-controlled is spliced into the string beyond the
/// range-checked duty value.
#[derive(Debug, Clone)]
pub struct TriggerCommand {
    pub driver: String,
    pub config_dir: String,
    pub fire_secs: String,
}

impl Default for TriggerCommand {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            fire_secs: DEFAULT_FIRE_SECS.to_string(),
        }
    }
}

impl TriggerCommand {
    /// Argument vector for one firing at the given duty cycle.
    pub fn argv(&self, duty: u8) -> Result<Vec<String>> {
        let config = config_for_duty(duty)?;
        Ok(vec![
            self.driver.clone(),
            "-j".to_string(),
            format!("{}{}", self.config_dir, config),
            "--fire-laser".to_string(),
            format!("\"{}\"", self.fire_secs),
        ])
    }

    /// The exact command line exec-ed on the remote shell.
    pub fn for_duty(&self, duty: u8) -> Result<String> {
        Ok(self.argv(duty)?.join(" "))
    }
}

// ============================================================================
// RemoteSession
// ============================================================================

/// One authenticated SSH connection to the host that fires the laser.
///
/// `Session` is internally reference counted, so clones share the same
/// underlying connection; successive [`CommandTask`]s reuse it sequentially.
#[derive(Clone)]
pub struct RemoteSession {
    session: Session,
    host: String,
    user: String,
}

impl RemoteSession {
    /// Connect and authenticate with a password.
    ///
    /// Network, protocol, and authentication failures are distinct and all
    /// fatal: credentials are not expected to become valid mid-run.
    pub fn connect(host: &str, user: &str, password: &str) -> Result<Self> {
        let tcp = TcpStream::connect((host, SSH_PORT)).map_err(|e| CollectorError::Connection {
            host: host.to_string(),
            detail: e.to_string(),
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        session
            .userauth_password(user, password)
            .map_err(|_| CollectorError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            })?;
        if !session.authenticated() {
            return Err(CollectorError::Auth {
                user: user.to_string(),
                host: host.to_string(),
            });
        }

        info!("ssh connection established: {}@{}", user, host);
        Ok(Self {
            session,
            host: host.to_string(),
            user: user.to_string(),
        })
    }

    /// Exec one command on the existing connection without waiting for it.
    ///
    /// The returned channel multiplexes the command's stdin, stdout, and
    /// stderr; dropping it releases the channel but not the connection.
    pub fn execute(&self, command: &str) -> Result<Channel> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        debug!("exec on {}@{}: {}", self.user, self.host, command);
        Ok(channel)
    }
}

// ============================================================================
// CommandTask
// ============================================================================

/// One remote command running on its own thread.
///
/// Fire-and-forget: the orchestrator drops the task after starting its serial
/// read, so the thread's only obligations are to exec the command and hand
/// the channel to the callback. Threads never outlive the process and the
/// connection stays owned by the [`RemoteSession`].
pub struct CommandTask {
    handle: JoinHandle<()>,
}

impl CommandTask {
    /// Launch `command` on `session` and deliver the exec result to
    /// `callback` from the spawned thread.
    pub fn spawn<F>(session: RemoteSession, command: String, callback: F) -> Result<Self>
    where
        F: FnOnce(Result<Channel>) + Send + 'static,
    {
        Self::spawn_with(move || callback(session.execute(&command)))
    }

    fn spawn_with(work: impl FnOnce() + Send + 'static) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("remote-trigger".to_string())
            .spawn(work)
            .map_err(CollectorError::Io)?;
        Ok(Self { handle })
    }

    /// Whether the task's thread has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
