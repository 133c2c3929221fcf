//! Classification of remote failures.
//!
//! Every remote operation ends with an optional [`RemoteError`]. The
//! fetchers never inspect those errors directly; they ask the
//! [`Classifier`] what to do and act on the [`FetchOutcome`]:
//!
//! | Error | Outcome |
//! |---|---|
//! | none | `Success` |
//! | network unavailable / failure, timeout | `Retry(default delay)` |
//! | service unavailable, rate limited, zone busy | `Retry(suggested or default delay)` |
//! | change token expired | `Recoverable(CursorExpired)` |
//! | zone not found, zone deleted by user | `Recoverable(Other)` |
//! | partial failure | most severe item error |
//! | anything else | `Fatal` |

use crate::config::RetryConfig;
use cloudsync_protocol::RemoteError;
use std::time::Duration;

/// Why a failure is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The stored cursor is no longer valid; discard it and refetch.
    CursorExpired,
    /// Recoverable by other means (for example re-creating a zone).
    Other,
}

/// What to do after a remote operation finished.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The operation succeeded.
    Success,
    /// Retry the operation after the delay.
    Retry(Duration),
    /// Recover locally, then continue.
    Recoverable {
        /// Kind of recovery needed.
        reason: RecoveryReason,
        /// The underlying error.
        error: RemoteError,
    },
    /// Give up and report the error.
    Fatal(RemoteError),
}

impl FetchOutcome {
    /// Returns true for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success)
    }

    /// Ranks outcomes for partial-failure unwrapping; higher is worse.
    fn severity(&self) -> (u8, Duration) {
        match self {
            FetchOutcome::Success => (0, Duration::ZERO),
            FetchOutcome::Retry(delay) => (1, *delay),
            FetchOutcome::Recoverable {
                reason: RecoveryReason::CursorExpired,
                ..
            } => (2, Duration::ZERO),
            FetchOutcome::Recoverable {
                reason: RecoveryReason::Other,
                ..
            } => (3, Duration::ZERO),
            FetchOutcome::Fatal(_) => (4, Duration::ZERO),
        }
    }
}

/// Maps remote errors to [`FetchOutcome`]s.
///
/// Pure and deterministic; the only input besides the error is the
/// default retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    default_delay: Duration,
}

impl Classifier {
    /// Creates a classifier using `default_delay` when the service does not
    /// suggest one.
    pub fn new(default_delay: Duration) -> Self {
        Self { default_delay }
    }

    /// Creates a classifier from the retry configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.default_delay)
    }

    /// Classifies the terminal error of an operation.
    pub fn classify(&self, error: Option<&RemoteError>) -> FetchOutcome {
        match error {
            None => FetchOutcome::Success,
            Some(error) => self.classify_error(error),
        }
    }

    fn classify_error(&self, error: &RemoteError) -> FetchOutcome {
        match error {
            RemoteError::NetworkUnavailable
            | RemoteError::NetworkFailure
            | RemoteError::RequestTimedOut => FetchOutcome::Retry(self.default_delay),

            RemoteError::ServiceUnavailable { retry_after }
            | RemoteError::RequestRateLimited { retry_after }
            | RemoteError::ZoneBusy { retry_after } => {
                FetchOutcome::Retry(retry_after.unwrap_or(self.default_delay))
            }

            RemoteError::ChangeTokenExpired => FetchOutcome::Recoverable {
                reason: RecoveryReason::CursorExpired,
                error: error.clone(),
            },

            RemoteError::ZoneNotFound | RemoteError::UserDeletedZone => {
                FetchOutcome::Recoverable {
                    reason: RecoveryReason::Other,
                    error: error.clone(),
                }
            }

            RemoteError::PartialFailure { items } => items
                .iter()
                .map(|item| self.classify_error(&item.error))
                .max_by_key(FetchOutcome::severity)
                .unwrap_or_else(|| FetchOutcome::Fatal(error.clone())),

            RemoteError::QuotaExceeded
            | RemoteError::NotAuthenticated
            | RemoteError::PermissionFailure
            | RemoteError::ServerRejectedRequest(_)
            | RemoteError::Internal(_) => FetchOutcome::Fatal(error.clone()),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Classifies with the default retry delay.
pub fn classify(error: Option<&RemoteError>) -> FetchOutcome {
    Classifier::default().classify(error)
}
