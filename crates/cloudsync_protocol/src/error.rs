//! Errors reported by a remote store transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// A failure reported by the remote store for one operation.
///
/// Transports translate their native failures into this enum. Each
/// operation surfaces at most one terminal `RemoteError`; batch operations
/// that fail per item report a [`RemoteError::PartialFailure`] wrapping the
/// item-level errors.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The device has no network connectivity.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The connection dropped while the request was in flight.
    #[error("network failure")]
    NetworkFailure,

    /// The request did not complete within the transport's timeout.
    #[error("request timed out")]
    RequestTimedOut,

    /// The service is temporarily unavailable.
    #[error("service unavailable")]
    ServiceUnavailable {
        /// Delay suggested by the service before retrying.
        retry_after: Option<Duration>,
    },

    /// The client is sending requests too quickly.
    #[error("request rate limited")]
    RequestRateLimited {
        /// Delay suggested by the service before retrying.
        retry_after: Option<Duration>,
    },

    /// The zone is busy handling another request.
    #[error("zone busy")]
    ZoneBusy {
        /// Delay suggested by the service before retrying.
        retry_after: Option<Duration>,
    },

    /// The supplied change token is too old or was invalidated.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// The zone does not exist on the remote side.
    #[error("zone not found")]
    ZoneNotFound,

    /// The user deleted the zone from another device or the settings UI.
    #[error("zone deleted by user")]
    UserDeletedZone,

    /// Some items of a batch failed.
    #[error("partial failure ({} item errors)", items.len())]
    PartialFailure {
        /// Item-level errors.
        items: Vec<PartialFailureItem>,
    },

    /// The user's remote storage quota is exhausted.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// No authenticated account is available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The account is not permitted to perform the operation.
    #[error("permission failure")]
    PermissionFailure,

    /// The server rejected the request as malformed.
    #[error("server rejected request: {0}")]
    ServerRejectedRequest(String),

    /// Any other failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Creates a partial failure from `(item, error)` pairs.
    pub fn partial<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (S, RemoteError)>,
        S: Into<String>,
    {
        Self::PartialFailure {
            items: items
                .into_iter()
                .map(|(item, error)| PartialFailureItem {
                    item: item.into(),
                    error,
                })
                .collect(),
        }
    }

    /// Returns the retry delay suggested by the service, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::ServiceUnavailable { retry_after }
            | RemoteError::RequestRateLimited { retry_after }
            | RemoteError::ZoneBusy { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One item-level error inside a [`RemoteError::PartialFailure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFailureItem {
    /// Identifier of the failed item (zone, record or subscription id).
    pub item: String,
    /// The item's error.
    pub error: RemoteError,
}
