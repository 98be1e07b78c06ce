//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle the different
//! kinds of errors that can occur, from link failures to log-file problems.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: Open or read failure at the transport level. Wraps a [`ConnError`]
//!   whose [`ConnErrorKind`] tells the poller whether the failure is structural (the link is
//!   gone) or transient (timeout, CRC mismatch, exception response).
//! - **`Decode`** / **`Parse`**: A single malformed frame. The sample is dropped and polling
//!   continues.
//! - **`Io`**: Log file creation or write failure. Reported once; acquisition continues.
//! - **`InvalidState`**: An operation was requested in a state that forbids it.
//! - **`Config`** / **`Configuration`**: Configuration parsing and validation failures.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types with `?`.

use crate::session::{ConnectionState, RecordingState};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnErrorKind {
    /// The link could not be opened.
    Open,
    /// No complete response arrived within the read timeout.
    Timeout,
    /// The peer answered with something unusable (CRC mismatch, exception, bad frame).
    Protocol,
    /// The link is gone: handle closed, device unplugged, end of stream.
    Closed,
}

impl std::fmt::Display for ConnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnErrorKind::Open => "open",
            ConnErrorKind::Timeout => "timeout",
            ConnErrorKind::Protocol => "protocol",
            ConnErrorKind::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Transport-level failure, recoverable by reconnecting.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error on '{endpoint}': {message}")]
pub struct ConnError {
    /// What went wrong.
    pub kind: ConnErrorKind,
    /// Port name or other endpoint description.
    pub endpoint: String,
    /// Human-readable detail.
    pub message: String,
}

impl ConnError {
    /// Create a new connection error.
    pub fn new(
        kind: ConnErrorKind,
        endpoint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Structural errors end the poll loop immediately, regardless of the failure budget.
    pub fn is_structural(&self) -> bool {
        self.kind == ConnErrorKind::Closed
    }

    /// Map an I/O error from the link onto a connection error.
    ///
    /// Broken pipes, resets and end-of-stream mean the device went away.
    pub fn from_io(endpoint: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotFound
            | ErrorKind::PermissionDenied => ConnErrorKind::Closed,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnErrorKind::Timeout,
            _ => ConnErrorKind::Protocol,
        };
        Self::new(kind, endpoint, err.to_string())
    }
}

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Transport open or read failure.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnError),

    /// A frame arrived but was not valid text.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A text token could not be parsed as a number.
    #[error("Parse error: cannot read '{token}' as a number: {reason}")]
    Parse {
        /// The offending token.
        token: String,
        /// Parser message.
        reason: String,
    },

    /// Log file creation or write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requested in a state that forbids it.
    #[error("Cannot {operation} while {connection:?}/{recording:?}")]
    InvalidState {
        /// Operation that was refused.
        operation: &'static str,
        /// Connection state at the time of the request.
        connection: ConnectionState,
        /// Recording state at the time of the request.
        recording: RecordingState,
    },

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are semantically wrong.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A transport was requested that this build does not include.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The session controller task has stopped.
    #[error("Session controller is not running")]
    ControllerUnavailable,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Io(err.into())
    }
}

impl DaqError {
    /// True for errors caused by a single bad frame, which never fault the connection.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, DaqError::Decode(_) | DaqError::Parse { .. })
    }
}
