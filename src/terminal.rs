//! Serial TTY reader for the light meter device.
//!
//! The meter streams newline-delimited JSON over an FTDI-style USB serial
//! adapter. Before the first read the tty line discipline must be forced into
//! raw mode (8 data bits, no echo, no signal interpretation, no line
//! buffering); on Linux that is an `stty` invocation which requires root, so
//! non-root processes go through `sudo` with the credential piped on stdin.
//!
//! Line-discipline state is all-or-nothing: a half-applied flag set is unsafe
//! to read from, so any configuration failure is fatal and never retried.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info};
use serialport::SerialPort;

use crate::errors::{CollectorError, Result};

/// Upper bound on each stty/sudo invocation.
const STTY_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval while waiting for the stty helper to exit.
const STTY_POLL: Duration = Duration::from_millis(50);

/// Per-read timeout on the underlying port. Callers gate reads on
/// `bytes_available()`, so this only bounds a stall in the middle of a line.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Raw-mode flag set applied after the `sane` reset. Mirrors the settings an
/// ATmega32U4 CDC-ACM endpoint needs: no post-processing, no echo, no
/// canonical buffering, no flow control.
const RAW_MODE_FLAGS: &[&str] = &[
    "ignbrk", "-brkint", "-imaxbel", "-opost", "-onlcr", "-isig", "-icanon", "-iexten", "-echo",
    "-echoe", "-echok", "-echoctl", "-echoke", "noflsh", "-ixon", "-crtscts",
];

// ============================================================================
// Privileged Configuration
// ============================================================================

/// Narrow seam over the privileged `stty` invocation so tests can substitute
/// a recorder instead of escalating for real.
pub trait PrivilegedConfigurator {
    /// Run `stty` against `tty` with the given trailing arguments.
    fn run_stty(&self, tty: &str, args: &[&str]) -> Result<()>;
}

/// Production configurator: `sudo -k -p '' -S stty -F <tty> ...` with the
/// credential written to stdin, or plain `stty` when already root.
pub struct SudoStty {
    credential: String,
}

impl SudoStty {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
        }
    }

    fn needs_sudo(&self) -> bool {
        !nix::unistd::Uid::effective().is_root()
    }
}

impl PrivilegedConfigurator for SudoStty {
    fn run_stty(&self, tty: &str, args: &[&str]) -> Result<()> {
        let elevated = self.needs_sudo();
        let mut command = if elevated {
            let mut c = Command::new("sudo");
            c.args(["-k", "-p", "", "-S", "stty", "-F", tty]);
            c
        } else {
            let mut c = Command::new("stty");
            c.args(["-F", tty]);
            c
        };
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("running stty on {}: {:?} (sudo={})", tty, args, elevated);
        let mut child = command.spawn().map_err(|e| CollectorError::Configure {
            tty: tty.to_string(),
            detail: e.to_string(),
        })?;

        if elevated {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(self.credential.as_bytes());
                let _ = stdin.write_all(b"\n");
            }
        } else {
            drop(child.stdin.take());
        }

        let deadline = Instant::now() + STTY_TIMEOUT;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CollectorError::Timeout(format!(
                        "stty did not finish within {:?} on {}",
                        STTY_TIMEOUT, tty
                    )));
                }
                None => std::thread::sleep(STTY_POLL),
            }
        };

        if !status.success() {
            let mut errors = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut errors);
            }
            return Err(CollectorError::Configure {
                tty: tty.to_string(),
                detail: errors.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Reset the tty to a sane baseline, then apply the full raw-mode flag set.
///
/// Two sequential invocations on purpose: `sane` clears whatever a previous
/// process left behind before the raw flags go on. Either step failing leaves
/// the line discipline in an unknown state, which is fatal for the run.
pub fn configure_line_discipline(
    tty: &str,
    baud: u32,
    configurator: &dyn PrivilegedConfigurator,
) -> Result<()> {
    configurator.run_stty(tty, &["sane"])?;

    let baud_text = baud.to_string();
    let mut args: Vec<&str> = vec!["cs8", &baud_text];
    args.extend_from_slice(RAW_MODE_FLAGS);
    configurator.run_stty(tty, &args)?;

    info!("line discipline configured: tty={}, baud={}", tty, baud);
    Ok(())
}

// ============================================================================
// ReadTerminal
// ============================================================================

/// Line-oriented input source the acquisition loop reads from.
///
/// [`ReadTerminal`] is the production implementation; tests substitute a
/// scripted source so the capture loop can be exercised without a device.
pub trait LineSource {
    /// Open the underlying device handle. Idempotent.
    fn open(&mut self) -> Result<()>;
    /// Number of buffered input bytes available without blocking.
    fn bytes_available(&mut self) -> Result<u32>;
    /// Read one newline-terminated record, decoded as (lossy) UTF-8.
    ///
    /// Returns `Ok(None)` if no full line arrived in time; bytes read so far
    /// stay pending for the next call.
    fn read_line(&mut self) -> Result<Option<String>>;
    /// Discard everything currently buffered.
    fn drain(&mut self) -> Result<()>;
    /// Release the device handle. Idempotent.
    fn close(&mut self);
}

/// Line-oriented reader over one serial device.
///
/// Owns the device handle for the lifetime of the run. Partial lines are
/// carried in an internal buffer across reads so a mid-line port timeout
/// never loses bytes.
pub struct ReadTerminal {
    tty: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
    pending: Vec<u8>,
}

impl ReadTerminal {
    /// Open the device and drain any stale bytes buffered before this
    /// process attached.
    pub fn new(tty: &str, baud: u32) -> Result<Self> {
        let mut terminal = Self {
            tty: tty.to_string(),
            baud,
            port: None,
            pending: Vec::new(),
        };
        terminal.open()?;
        terminal.drain()?;
        Ok(terminal)
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            CollectorError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port is not open",
            ))
        })
    }
}

impl LineSource for ReadTerminal {
    fn open(&mut self) -> Result<()> {
        if self.port.is_none() {
            let port = serialport::new(&self.tty, self.baud)
                .timeout(PORT_READ_TIMEOUT)
                .open()?;
            debug!("serial port opened: {}", self.tty);
            self.port = Some(port);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<u32> {
        let pending = self.pending.len() as u32;
        let waiting = self.port_mut()?.bytes_to_read()?;
        Ok(pending + waiting)
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let mut buf = [0u8; 256];
            match self.port_mut()?.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Discards driver-buffered bytes as well as the local partial line.
    fn drain(&mut self) -> Result<()> {
        self.pending.clear();
        let mut discarded = 0usize;
        loop {
            let waiting = self.port_mut()?.bytes_to_read()?;
            if waiting == 0 {
                break;
            }
            let mut buf = [0u8; 256];
            match self.port_mut()?.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        if discarded > 0 {
            debug!("drained {} stale bytes from {}", discarded, self.tty);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial port closed: {}", self.tty);
        }
    }
}
