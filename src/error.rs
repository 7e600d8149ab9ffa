//! Error types for the endpoint stack
//!
//! Every public operation in this crate reports one of the variants below;
//! the set is closed and shared by caches, comms, endpoints and containers.
//!
//! # Recovery expectations
//!
//! - **`Timeout`**: a configured socket timeout elapsed. Retryable; raw comm
//!   receive loops swallow these internally.
//! - **`Io`**: transport-level failure. TCP client comms reconnect on their
//!   own; everything else reports upward.
//! - **`NoEntry` / `NoSpace`**: normal cache outcomes, not failures. A
//!   `NoSpace` carries the size the caller's buffer must have.
//! - **`NotRunning`**: the component was not started (or already stopped).
//! - **`FileNotFound` / `InvalidJson` / `InvalidConfig`**: configuration
//!   problems. Fix the config files and reopen.

use thiserror::Error;

/// Errors that can occur anywhere in the endpoint stack
///
/// See module-level documentation for recovery expectations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("buffer too small: {required} bytes required")]
    NoSpace { required: usize },

    #[error("resource busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("no entry")]
    NoEntry,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not running")]
    NotRunning,

    #[error("unsupported operation")]
    Unsupported,

    #[error("invalid PDU key: {0}")]
    InvalidPduKey(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidJson(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
