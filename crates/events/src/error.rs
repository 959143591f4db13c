//! Event Channel Error Types

use derive_more::{Display, Error};

/// An event channel error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for event channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// The message broker could not be reached or rejected the request.
    #[display("event transport error")]
    Transport,
    /// No stream is configured to capture the subject; the message was dropped.
    #[display("no stream accepts subject: {_0}")]
    NoStream(#[error(not(source))] String),
    #[display("stream not found: {_0}")]
    StreamNotFound(#[error(not(source))] String),
    #[display("consumer not found: {_0}")]
    ConsumerNotFound(#[error(not(source))] String),
    #[display("invalid subject: {_0:?}")]
    InvalidSubject(#[error(not(source))] String),
    #[display("subject {subject} already belongs to stream {stream}")]
    SubjectOverlap { subject: String, stream: String },
    /// A stored value could not be converted back into its model.
    #[display("invalid event log data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ErrorKind::NoStream("books.delete".to_string()).to_string(), "no stream accepts subject: books.delete");
        let overlap = ErrorKind::SubjectOverlap { subject: "books.*".to_string(), stream: "BOOKS".to_string() };
        assert_eq!(overlap.to_string(), "subject books.* already belongs to stream BOOKS");
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Database.is_retryable());
        assert!(ErrorKind::Transport.is_retryable());
        assert!(!ErrorKind::NoStream("x".to_string()).is_retryable());
        assert!(!ErrorKind::InvalidSubject("".to_string()).is_retryable());
    }
}
