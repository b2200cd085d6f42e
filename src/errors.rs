use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },
    #[error("connection to {host} failed: {detail}")]
    Connection { host: String, detail: String },
    #[error("line discipline configuration failed on {tty}: {detail}")]
    Configure { tty: String, detail: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid duty cycle {0}: must be an integer between 20 and 80 inclusive")]
    InvalidDuty(u8),
}

pub type Result<T> = std::result::Result<T, CollectorError>;
