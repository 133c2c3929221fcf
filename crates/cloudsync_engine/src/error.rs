//! Error types for the sync engine.

use cloudsync_protocol::{RemoteError, ZoneId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Only terminal failures reach this type: retryable remote errors and
/// expired cursors are absorbed by the fetchers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The remote store reported a failure that cannot be recovered
    /// automatically.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Reading or writing persisted sync state failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted sync state could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A local collaborator failed to apply or push changes.
    #[error("collaborator for zone {zone} failed: {message}")]
    Apply {
        /// Zone owned by the failing collaborator.
        zone: ZoneId,
        /// Failure description.
        message: String,
    },

    /// Two collaborators claim the same zone or record type.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// The configured retry cap was reached.
    #[error("gave up after {attempts} retries, last error: {last}")]
    RetriesExhausted {
        /// Number of retries attempted.
        attempts: u32,
        /// Error that caused the final retry.
        last: RemoteError,
    },

    /// The engine was shut down while the operation was in flight.
    #[error("sync cancelled")]
    Cancelled,

    /// Unexpected engine or transport behaviour.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a collaborator failure for a zone.
    pub fn apply(zone: &ZoneId, message: impl Into<String>) -> Self {
        Self::Apply {
            zone: zone.clone(),
            message: message.into(),
        }
    }

    /// Returns true if a later trigger may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RetriesExhausted { .. } => true,
            SyncError::Remote(remote) => matches!(
                remote,
                RemoteError::ZoneNotFound | RemoteError::UserDeletedZone
            ),
            SyncError::Apply { .. } => true,
            _ => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        Self::Remote(error)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}
