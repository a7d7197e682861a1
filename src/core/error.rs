//! Error types for the card synchronizer
//!
//! `SyncError` covers everything the protocol client and the orchestrator can
//! report. Per-item failures (`RemoteFileNotFound`, `RemoteFileInvalid`) are
//! absorbed inside the copy loop; connection-class and card-identity errors
//! abort the whole phase. `Canceled` is not a failure and is reported as a
//! stopped cycle.

use thiserror::Error;

/// Main error type for the synchronizer
#[derive(Error, Debug)]
pub enum SyncError {
    /// The card answered but refused the request (HTTP 400/401/500). Retryable.
    #[error("Unable to connect to the card: {0}")]
    ConnectionUnable(String),

    /// The wireless link dropped while a transfer was in flight
    #[error("Connection to the card was lost")]
    ConnectionLost,

    /// The card did not answer within the request timeout
    #[error("The card did not respond in time")]
    Timeout,

    /// The file is no longer on the card (HTTP 404)
    #[error("File not found on the card: {0}")]
    RemoteFileNotFound(String),

    /// The file's size on the wire disagrees with the listing
    #[error("File on the card is invalid: {0}")]
    RemoteFileInvalid(String),

    /// The card did not confirm deletion of a copied file
    #[error("Failed to delete '{0}' from the card")]
    RemoteFileDeletionFailed(String),

    /// A different card is now being served under the same address
    #[error("The card has been changed")]
    CardChanged,

    /// Delete-on-copy was requested but the card's upload endpoint is off
    #[error("Deleting files requires the card's upload function to be enabled")]
    CardUploadDisabled,

    /// The cycle was stopped by the user
    #[error("Operation canceled")]
    Canceled,

    /// Another check or copy cycle is already running
    #[error("Another check or copy is in progress")]
    Busy,

    /// Any other HTTP status or a malformed response body
    #[error("Card protocol error: {0}")]
    Protocol(String),

    /// Local disk I/O error
    #[error("IO error: {0}")]
    Io(String),

    /// Anything not categorised above, with the cause preserved
    #[error("Unexpected error: {context}")]
    Unexpected {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SyncError {
    /// Wrap an uncategorised error, keeping it as the source
    pub fn unexpected<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SyncError::Unexpected {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Only a refused request may be retried, and only before streaming starts
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::ConnectionUnable(_))
    }

    /// Errors caused by the wireless link rather than by the card's content
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionUnable(_) | SyncError::ConnectionLost | SyncError::Timeout
        )
    }

    /// Errors the copy loop handles for a single file and then moves on
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteFileNotFound(_) | SyncError::RemoteFileInvalid(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, SyncError::Canceled)
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_disjoint() {
        let unable = SyncError::ConnectionUnable("HTTP 500".to_string());
        assert!(unable.is_retryable());
        assert!(unable.is_connection_class());
        assert!(!unable.is_per_item());

        let lost = SyncError::ConnectionLost;
        assert!(!lost.is_retryable());
        assert!(lost.is_connection_class());

        let missing = SyncError::RemoteFileNotFound("/DCIM/A.JPG".to_string());
        assert!(missing.is_per_item());
        assert!(!missing.is_connection_class());

        assert!(SyncError::Canceled.is_canceled());
        assert!(!SyncError::Canceled.is_connection_class());
        assert!(!SyncError::Timeout.is_canceled());
    }

    #[test]
    fn test_unexpected_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = SyncError::unexpected("writing file", io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("disk on fire"));
        assert!(err.to_string().contains("writing file"));
    }
}
