//! Error types for the translation memory store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::LanguageDirection;
use std::io;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the translation memory store
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (ledger, bucket, segment or manifest)
    ///
    /// Corruption is fatal: the affected structure must be rebuilt from
    /// the upstream stream.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Caller supplied an invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Query or ingestion for a language direction the store does not serve
    #[error("Unsupported language direction: {0}")]
    UnsupportedDirection(LanguageDirection),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background work queue is full
    #[error("Background queue is full")]
    Backpressure,

    /// The store has been closed
    #[error("Store is closed")]
    Closed,
}

impl Error {
    /// Build a `Corruption` error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Build an `InvalidInput` error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Build a `Config` error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only plain I/O failures qualify. Interrupted/would-block style errors
    /// and generic OS errors are retried; data errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::InvalidData
                    | io::ErrorKind::InvalidInput
                    | io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::UnexpectedEof
            ),
            Error::Backpressure => true,
            _ => false,
        }
    }

    /// Whether this error means on-disk state can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;

    #[test]
    fn test_error_display_io() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::corruption("CRC check failed");
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("CRC check failed"));
    }

    #[test]
    fn test_error_display_direction() {
        let dir = LanguageDirection::new(Language::new("en"), Language::new("xx"));
        let err = Error::UnsupportedDirection(dir);
        assert!(err.to_string().contains("en:xx"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        let busy = Error::Io(io::Error::new(io::ErrorKind::Interrupted, "eintr"));
        assert!(busy.is_transient());

        let bad = Error::Io(io::Error::new(io::ErrorKind::InvalidData, "bad"));
        assert!(!bad.is_transient());

        assert!(!Error::corruption("x").is_transient());
        assert!(!Error::Closed.is_transient());
        assert!(Error::Backpressure.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::corruption("x").is_fatal());
        assert!(!Error::invalid_input("x").is_fatal());
    }
}
