//! Error types returned by the storage adapter.

use thiserror::Error;

use crate::bucket::StoreError;

/// Errors that can occur in adapter operations
#[derive(Debug, Error)]
pub enum Error {
    /// No files record matches the identifier
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The identifier does not decode to a native key
    #[error("invalid blob identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The underlying store failed; propagated as-is
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// Reading an upload source or writing a download target failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored content does not match its files record
    #[error("blob {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    /// Rejected adapter configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn corrupt(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the domain "blob absent" signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_mentions_identifier() {
        let err = Error::not_found("abc.txt");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("abc.txt"));
    }

    #[test]
    fn store_errors_convert() {
        let err: Error = StoreError::Conflict.into();
        assert!(matches!(err, Error::StoreUnavailable(StoreError::Conflict)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn io_errors_convert() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
