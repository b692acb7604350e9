//! Crate-wide error taxonomy.
//!
//! Hand-rolled rather than pulling in `thiserror`: a single enum, a manual
//! `Display`, and `From` conversions at the boundaries where foreign errors
//! enter the engine.

use std::fmt::{self, Display};
use std::io;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Distinguishes retry-worthy backend failures from ones that are not.
#[derive(Debug)]
pub enum BackendErrorKind {
    /// Worth retrying with backoff (e.g. a connection blip).
    Transient,
    /// Retries exhausted, or the backend reported a condition that retrying
    /// cannot fix.
    Fatal,
}

/// The engine's error taxonomy (design §7).
#[derive(Debug)]
pub enum Error {
    /// A path, oid, or tid that should have existed did not.
    NotFound(String),
    /// Checksum mismatch, record length inconsistent with file bounds, or
    /// index/file disagreement.
    Corruption(String),
    /// Underlying blob file system failure.
    Backend { kind: BackendErrorKind, message: String },
    /// Invalid configuration detected at open.
    Config(String),
    /// Operation cancelled, timed out, or a channel queue was full.
    Concurrency(String),
    /// Operation invoked while the store handle was in the wrong state.
    State(String),
}

impl Error {
    pub fn not_found(what: impl Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn corruption(what: impl Display) -> Self {
        Error::Corruption(what.to_string())
    }

    pub fn transient(what: impl Display) -> Self {
        Error::Backend { kind: BackendErrorKind::Transient, message: what.to_string() }
    }

    pub fn fatal(what: impl Display) -> Self {
        Error::Backend { kind: BackendErrorKind::Fatal, message: what.to_string() }
    }

    pub fn config(what: impl Display) -> Self {
        Error::Config(what.to_string())
    }

    pub fn concurrency(what: impl Display) -> Self {
        Error::Concurrency(what.to_string())
    }

    pub fn state(what: impl Display) -> Self {
        Error::State(what.to_string())
    }

    /// True for `Backend { kind: Transient, .. }`, the only kind the BFS
    /// retry wrapper should act on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Backend { kind: BackendErrorKind::Transient, .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::Corruption(what) => write!(f, "corruption: {what}"),
            Error::Backend { kind: BackendErrorKind::Transient, message } => {
                write!(f, "transient backend error: {message}")
            }
            Error::Backend { kind: BackendErrorKind::Fatal, message } => {
                write!(f, "backend error: {message}")
            }
            Error::Config(what) => write!(f, "invalid configuration: {what}"),
            Error::Concurrency(what) => write!(f, "concurrency error: {what}"),
            Error::State(what) => write!(f, "invalid store state: {what}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                Error::transient(err)
            }
            _ => Error::fatal(err),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert!(matches!(Error::from(io_err), Error::NotFound(_)));
    }

    #[test]
    fn io_timeout_maps_to_transient_backend() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let err = Error::from(io_err);
        assert!(err.is_transient());
    }

    #[test]
    fn display_is_human_readable() {
        let err = Error::corruption("bad crc");
        assert_eq!(err.to_string(), "corruption: bad crc");
    }
}
