//! Database-level change fetching.

use crate::classify::{FetchOutcome, RecoveryReason};
use crate::context::{SyncContext, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::transport::CloudTransport;
use crate::zone::{FetchSummary, ZoneChangeFetcher};
use cloudsync_protocol::{DatabaseChangeEvent, DatabaseChangesRequest, RemoteError, ZoneId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How one database-level attempt ended.
enum Attempt {
    /// The database token is current; `changed` zones reported changes.
    Done { changed: usize },
    /// Try again after the delay.
    Retry { delay: Duration, cause: RemoteError },
    /// The token expired and was cleared; start over immediately.
    Restart { cause: RemoteError },
}

/// Top-level reconciliation step.
///
/// Asks the remote store which zones changed since the database token,
/// advances that token, and hands over to the [`ZoneChangeFetcher`].
pub(crate) struct DatabaseChangeFetcher<T> {
    ctx: Arc<SyncContext<T>>,
}

impl<T: CloudTransport> DatabaseChangeFetcher<T> {
    pub(crate) fn new(ctx: Arc<SyncContext<T>>) -> Self {
        Self { ctx }
    }

    /// Runs a full fetch cycle and returns once it reached a terminal
    /// outcome.
    ///
    /// Retryable failures and expired tokens are absorbed here; the caller
    /// only ever sees the final result.
    pub(crate) async fn fetch(&self) -> SyncResult<FetchSummary> {
        let ctx = &self.ctx;
        let mut budget = ctx.config.retry.budget();

        let changed = loop {
            ctx.liveness.check()?;
            match self.attempt().await? {
                Attempt::Done { changed } => break changed,
                Attempt::Retry { delay, cause } => {
                    budget.spend(&cause)?;
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "database change fetch failed, retrying"
                    );
                    ctx.retry_after(delay).await?;
                }
                Attempt::Restart { cause } => {
                    budget.spend(&cause)?;
                    ctx.record(|stats| stats.cursor_resets += 1);
                    info!("database change token expired, refetching from scratch");
                }
            }
        };

        let mut summary = ZoneChangeFetcher::new(Arc::clone(ctx))
            .fetch_all_zones()
            .await?;
        summary.changed_zones = changed;
        Ok(summary)
    }

    async fn attempt(&self) -> SyncResult<Attempt> {
        let ctx = &self.ctx;
        ctx.set_state(SyncState::FetchingDatabase);

        let since = ctx.tokens.database_token()?;
        debug!(
            database = %ctx.config.database_name,
            from_scratch = since.is_none(),
            "fetching database changes"
        );
        let mut events = ctx.transport.fetch_database_changes(DatabaseChangesRequest {
            since,
            quality_of_service: ctx.config.quality_of_service,
        });

        let mut changed = 0;
        while let Some(event) = events.recv().await {
            ctx.liveness.check()?;
            match event {
                DatabaseChangeEvent::ZoneChanged(zone) => {
                    debug!(zone = %zone, "zone changed");
                    changed += 1;
                }
                DatabaseChangeEvent::ZoneDeleted(zone) | DatabaseChangeEvent::ZonePurged(zone) => {
                    self.forget_zone(&zone).await?;
                }
                DatabaseChangeEvent::TokenCheckpoint(token) => {
                    ctx.write_tokens(move |tokens| tokens.set_database_token(Some(&token)))
                        .await?;
                }
                DatabaseChangeEvent::Completed { token, error } => {
                    return match ctx.classifier.classify(error.as_ref()) {
                        FetchOutcome::Success => {
                            if let Some(token) = token {
                                ctx.write_tokens(move |tokens| {
                                    tokens.set_database_token(Some(&token))
                                })
                                .await?;
                            }
                            Ok(Attempt::Done { changed })
                        }
                        FetchOutcome::Retry(delay) => Ok(Attempt::Retry {
                            delay,
                            cause: error.unwrap_or(RemoteError::NetworkFailure),
                        }),
                        FetchOutcome::Recoverable {
                            reason: RecoveryReason::CursorExpired,
                            error,
                        } => {
                            ctx.write_tokens(|tokens| tokens.set_database_token(None))
                                .await?;
                            Ok(Attempt::Restart { cause: error })
                        }
                        FetchOutcome::Recoverable { error, .. } | FetchOutcome::Fatal(error) => {
                            warn!(error = %error, "database change fetch failed");
                            Err(SyncError::Remote(error))
                        }
                    };
                }
            }
        }

        Err(SyncError::Remote(RemoteError::Internal(
            "database change stream ended without completion".into(),
        )))
    }

    async fn forget_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        if self.ctx.registry.by_zone(zone).is_none() {
            debug!(zone = %zone, "unregistered zone deleted remotely");
            return Ok(());
        }
        warn!(zone = %zone, "zone deleted remotely");
        self.ctx.forget_remote_zone(zone).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::registry::{
        MemorySyncObject, SubscriptionState, SyncObject, SyncObjectRegistry, ZoneState,
    };
    use crate::store::MemoryKeyValueStore;
    use crate::tokens::ChangeTokenStore;
    use crate::transport::MockTransport;
    use cloudsync_protocol::{ChangeToken, ZoneChangeEvent};

    fn token(n: u8) -> ChangeToken {
        ChangeToken::from_bytes(vec![n])
    }

    fn context(transport: MockTransport) -> Arc<SyncContext<MockTransport>> {
        let dogs: Arc<dyn SyncObject> = Arc::new(MemorySyncObject::new("DogZone", "Dog"));
        Arc::new(SyncContext::new(
            SyncConfig::default(),
            Arc::new(transport),
            ChangeTokenStore::new(Arc::new(MemoryKeyValueStore::new())),
            SyncObjectRegistry::new(vec![dogs]).unwrap(),
            true,
        ))
    }

    #[tokio::test]
    async fn success_persists_token_and_fetches_zones() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![
            DatabaseChangeEvent::ZoneChanged(ZoneId::new("DogZone")),
            DatabaseChangeEvent::Completed {
                token: Some(token(5)),
                error: None,
            },
        ]);
        let ctx = context(transport);

        let summary = DatabaseChangeFetcher::new(Arc::clone(&ctx))
            .fetch()
            .await
            .unwrap();

        assert_eq!(summary.changed_zones, 1);
        assert_eq!(ctx.tokens.database_token().unwrap(), Some(token(5)));
        assert_eq!(ctx.transport.zone_requests().len(), 1);
    }

    #[tokio::test]
    async fn checkpoints_are_persisted_before_completion() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![
            DatabaseChangeEvent::TokenCheckpoint(token(1)),
            DatabaseChangeEvent::TokenCheckpoint(token(2)),
            DatabaseChangeEvent::Completed {
                token: None,
                error: Some(RemoteError::QuotaExceeded),
            },
        ]);
        let ctx = context(transport);

        let err = DatabaseChangeFetcher::new(Arc::clone(&ctx))
            .fetch()
            .await
            .unwrap_err();

        assert_eq!(err, SyncError::Remote(RemoteError::QuotaExceeded));
        assert_eq!(ctx.tokens.database_token().unwrap(), Some(token(2)));
        assert!(ctx.transport.zone_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_refetches_after_delay() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![DatabaseChangeEvent::Completed {
            token: None,
            error: Some(RemoteError::ServiceUnavailable {
                retry_after: Some(Duration::from_secs(20)),
            }),
        }]);
        let ctx = context(transport);

        let started = tokio::time::Instant::now();
        DatabaseChangeFetcher::new(Arc::clone(&ctx))
            .fetch()
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(ctx.transport.database_requests().len(), 2);
        assert_eq!(ctx.stats().retries, 1);
    }

    #[tokio::test]
    async fn expired_token_is_cleared_and_refetched() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![DatabaseChangeEvent::Completed {
            token: None,
            error: Some(RemoteError::ChangeTokenExpired),
        }]);
        transport.push_database_script(vec![DatabaseChangeEvent::Completed {
            token: Some(token(9)),
            error: None,
        }]);
        let ctx = context(transport);
        ctx.tokens.set_database_token(Some(&token(3))).unwrap();

        DatabaseChangeFetcher::new(Arc::clone(&ctx))
            .fetch()
            .await
            .unwrap();

        let requests = ctx.transport.database_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].since, Some(token(3)));
        assert_eq!(requests[1].since, None);
        assert_eq!(ctx.tokens.database_token().unwrap(), Some(token(9)));
        assert_eq!(ctx.stats().cursor_resets, 1);
    }

    #[tokio::test]
    async fn zone_deletion_clears_zone_token_and_subscription() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![
            DatabaseChangeEvent::ZonePurged(ZoneId::new("DogZone")),
            DatabaseChangeEvent::Completed {
                token: None,
                error: None,
            },
        ]);
        transport.push_zone_script(vec![
            ZoneChangeEvent::ZoneCompleted {
                zone_id: ZoneId::new("DogZone"),
                token: None,
                error: None,
            },
            ZoneChangeEvent::Completed { error: None },
        ]);
        let ctx = context(transport);
        let zone = ZoneId::new("DogZone");
        ctx.tokens.set_zone_token(&zone, Some(&token(4))).unwrap();
        ctx.tokens.set_subscription_active(&zone, true).unwrap();
        let scope = ctx.registry.by_zone(&zone).unwrap().scope();
        scope.set_zone_state(ZoneState::Ready);
        scope.set_subscription_state(SubscriptionState::Active);

        DatabaseChangeFetcher::new(Arc::clone(&ctx))
            .fetch()
            .await
            .unwrap();

        assert_eq!(ctx.tokens.zone_token(&zone).unwrap(), None);
        assert!(!scope.is_zone_provisioned());
        assert_eq!(scope.subscription_state(), SubscriptionState::Absent);
        assert!(!ctx.tokens.subscription_active(&zone).unwrap());
    }

    #[tokio::test]
    async fn truncated_stream_is_an_internal_error() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![DatabaseChangeEvent::ZoneChanged(ZoneId::new(
            "DogZone",
        ))]);
        let ctx = context(transport);

        let err = DatabaseChangeFetcher::new(ctx).fetch().await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Internal(_))));
    }
}
