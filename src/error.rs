//! Error types for relayrace.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::cancel::CancellationReason;

/// Result type alias for relayrace operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relayrace.
#[derive(Error, Debug)]
pub enum Error {
    // Outcome errors surfaced to the application
    #[error("operation cancelled: {0}")]
    Cancelled(CancellationReason),

    #[error("unable to reach any server")]
    NoReachableServer,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("critical failure: {0}")]
    Critical(String),

    // Catalog errors
    #[error("invalid server entry: {0}")]
    InvalidServerEntry(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Helper process errors
    #[error("process error: {0}")]
    Process(String),

    // Configuration file errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Check if the error reflects a raised cancellation reason.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Check if the same operation may be retried, with the same or a refreshed catalog.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoReachableServer | Error::Process(_) | Error::Io(_)
        )
    }

    /// Check if the error must be shown as a hard failure.
    ///
    /// Cancellation never produces error UI and an empty race is presented as
    /// "will retry", so only local setup faults qualify.
    pub fn requires_attention(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationFailed(_)
                | Error::Critical(_)
                | Error::Config(_)
                | Error::InvalidConfig(_)
                | Error::Storage(_)
        )
    }

    /// The raised reason, if this is a cancellation.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        match self {
            Error::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Error context for debugging.
#[derive(Debug)]
pub struct ErrorContext {
    pub server: Option<String>,
    pub transport: Option<String>,
    pub operation: String,
    pub timestamp: std::time::Instant,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            server: None,
            transport: None,
            operation: operation.into(),
            timestamp: std::time::Instant::now(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation={}", self.operation)?;
        if let Some(ref server) = self.server {
            write!(f, ", server={server}")?;
        }
        if let Some(ref transport) = self.transport {
            write!(f, ", transport={transport}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Cancelled(CancellationReason::USER_DISCONNECT).is_cancelled());
        assert!(!Error::Cancelled(CancellationReason::CANCEL).is_retryable());
        assert!(!Error::Cancelled(CancellationReason::CANCEL).requires_attention());

        assert!(Error::NoReachableServer.is_retryable());
        assert!(!Error::NoReachableServer.requires_attention());

        assert!(Error::ConfigurationFailed("no key".into()).requires_attention());
        assert!(!Error::ConfigurationFailed("no key".into()).is_retryable());
        assert!(Error::Critical("oom".into()).requires_attention());
    }

    #[test]
    fn test_cancellation_reason() {
        let err = Error::Cancelled(CancellationReason::PROCESS_EXIT);
        assert_eq!(err.cancellation_reason(), Some(CancellationReason::PROCESS_EXIT));
        assert_eq!(Error::NoReachableServer.cancellation_reason(), None);
    }

    #[test]
    fn test_error_context_display() {
        let ctx = ErrorContext::new("connect")
            .with_server("192.0.2.1")
            .with_transport("OSSH");
        assert_eq!(ctx.to_string(), "operation=connect, server=192.0.2.1, transport=OSSH");
    }
}
