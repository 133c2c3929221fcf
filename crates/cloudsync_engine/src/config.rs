//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::{QualityOfService, RemoteError};
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the remote database, used in logs.
    pub database_name: String,
    /// Priority requested on every transport operation.
    pub quality_of_service: QualityOfService,
    /// Window used to coalesce remote-change notifications.
    pub notification_window: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            quality_of_service: QualityOfService::UserInitiated,
            notification_window: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the requested quality of service.
    pub fn with_quality_of_service(mut self, quality_of_service: QualityOfService) -> Self {
        self.quality_of_service = quality_of_service;
        self
    }

    /// Sets the notification coalescing window.
    pub fn with_notification_window(mut self, window: Duration) -> Self {
        self.notification_window = window;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("private")
    }
}

/// Configuration for retry behavior.
///
/// Retry delays come from the remote service when it suggests one;
/// `default_delay` is used otherwise.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay used when the service does not suggest one.
    pub default_delay: Duration,
    /// Maximum number of consecutive automatic retries per operation.
    /// `None` retries for as long as the service keeps asking.
    pub max_consecutive_retries: Option<u32>,
}

impl RetryConfig {
    /// Creates a retry configuration with the given default delay and no cap.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            max_consecutive_retries: None,
        }
    }

    /// Sets the default delay.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Caps the number of consecutive automatic retries.
    pub fn with_max_consecutive_retries(mut self, max: u32) -> Self {
        self.max_consecutive_retries = Some(max);
        self
    }

    /// Starts counting retries for one operation.
    pub(crate) fn budget(&self) -> RetryBudget {
        RetryBudget {
            limit: self.max_consecutive_retries,
            spent: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

/// Counts the automatic retries of one operation against the configured cap.
#[derive(Debug)]
pub(crate) struct RetryBudget {
    limit: Option<u32>,
    spent: u32,
}

impl RetryBudget {
    /// Records one more retry caused by `cause`.
    pub(crate) fn spend(&mut self, cause: &RemoteError) -> SyncResult<()> {
        self.spent += 1;
        match self.limit {
            Some(limit) if self.spent > limit => Err(SyncError::RetriesExhausted {
                attempts: self.spent,
                last: cause.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("shared")
            .with_quality_of_service(QualityOfService::Utility)
            .with_notification_window(Duration::from_millis(500))
            .with_retry(RetryConfig::default().with_max_consecutive_retries(4));

        assert_eq!(config.database_name, "shared");
        assert_eq!(config.quality_of_service, QualityOfService::Utility);
        assert_eq!(config.notification_window, Duration::from_millis(500));
        assert_eq!(config.retry.max_consecutive_retries, Some(4));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.quality_of_service, QualityOfService::UserInitiated);
        assert_eq!(config.notification_window, Duration::from_secs(2));
        assert_eq!(config.retry.default_delay, Duration::from_secs(3));
        assert_eq!(config.retry.max_consecutive_retries, None);
    }

    #[test]
    fn unbounded_budget_never_runs_out() {
        let mut budget = RetryConfig::default().budget();
        for _ in 0..1000 {
            budget.spend(&RemoteError::NetworkFailure).unwrap();
        }
    }

    #[test]
    fn capped_budget_reports_last_cause() {
        let mut budget = RetryConfig::default()
            .with_max_consecutive_retries(2)
            .budget();
        budget.spend(&RemoteError::NetworkFailure).unwrap();
        budget.spend(&RemoteError::NetworkFailure).unwrap();

        let err = budget.spend(&RemoteError::ZoneBusy { retry_after: None }).unwrap_err();
        match err {
            SyncError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, RemoteError::ZoneBusy { retry_after: None });
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
