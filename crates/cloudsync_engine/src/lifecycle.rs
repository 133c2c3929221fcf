//! Zone and subscription provisioning.

use crate::classify::FetchOutcome;
use crate::context::{SyncContext, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::registry::{SubscriptionState, ZoneState};
use crate::transport::CloudTransport;
use cloudsync_protocol::{SubscriptionRequest, ZonesRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Makes sure every registered scope has a remote zone and a
/// change-notification subscription.
///
/// Both operations are idempotent: scopes that are already provisioned
/// are skipped without a remote call.
pub(crate) struct ZoneLifecycleManager<T> {
    ctx: Arc<SyncContext<T>>,
}

impl<T: CloudTransport> ZoneLifecycleManager<T> {
    pub(crate) fn new(ctx: Arc<SyncContext<T>>) -> Self {
        Self { ctx }
    }

    /// Creates every missing zone in one batch.
    ///
    /// On success each newly provisioned scope's collaborator is asked,
    /// on a blocking thread, to push its pending local changes; the
    /// returned future does not wait for those pushes. Retryable failures
    /// are retried after the classified delay. Any other failure leaves
    /// the scopes unprovisioned for the next call.
    pub(crate) async fn ensure_zones(&self) -> SyncResult<()> {
        let ctx = &self.ctx;
        let mut budget = ctx.config.retry.budget();

        loop {
            ctx.liveness.check()?;

            let pending: Vec<_> = ctx
                .registry
                .iter()
                .filter(|entry| entry.scope().zone_state() == ZoneState::NotProvisioned)
                .collect();
            if pending.is_empty() {
                debug!("all zones provisioned");
                return Ok(());
            }

            for entry in &pending {
                entry.scope().set_zone_state(ZoneState::CreatePending);
            }
            let request = ZonesRequest {
                zones: pending
                    .iter()
                    .map(|entry| entry.scope().zone_id().clone())
                    .collect(),
                quality_of_service: ctx.config.quality_of_service,
            };
            debug!(zones = request.zones.len(), "creating zones");

            let resume = ctx.state();
            ctx.set_state(SyncState::Provisioning);
            let result = ctx.transport.create_zones(request).await;
            ctx.set_state(resume);
            let error = result.err();

            match ctx.classifier.classify(error.as_ref()) {
                FetchOutcome::Success => {
                    for entry in &pending {
                        entry.scope().set_zone_state(ZoneState::Ready);
                        info!(zone = %entry.scope().zone_id(), "zone provisioned");

                        let zone = entry.scope().zone_id().clone();
                        let object = Arc::clone(entry.object());
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = object.push_pending_local_changes() {
                                warn!(zone = %zone, error = %e, "pushing pending local changes failed");
                            }
                        });
                    }
                    return Ok(());
                }
                FetchOutcome::Retry(delay) => {
                    reset_zones(&pending);
                    if let Some(cause) = &error {
                        budget.spend(cause)?;
                    }
                    warn!(delay_ms = delay.as_millis() as u64, "zone creation throttled, retrying");
                    ctx.retry_after(delay).await?;
                }
                FetchOutcome::Recoverable { error, .. } | FetchOutcome::Fatal(error) => {
                    reset_zones(&pending);
                    warn!(error = %error, "zone creation failed");
                    return Err(SyncError::Remote(error));
                }
            }
        }
    }

    /// Creates the change subscription of every scope that does not have
    /// one cached as active.
    ///
    /// Does nothing when the transport cannot create subscriptions.
    pub(crate) async fn ensure_subscription(&self) -> SyncResult<()> {
        let ctx = &self.ctx;
        if !ctx.subscriptions_supported {
            debug!("transport has no subscription support, skipping");
            return Ok(());
        }
        let mut budget = ctx.config.retry.budget();

        loop {
            ctx.liveness.check()?;

            let mut pending = Vec::new();
            for entry in ctx.registry.iter() {
                if ctx.tokens.subscription_active(entry.scope().zone_id())? {
                    entry.scope().set_subscription_state(SubscriptionState::Active);
                } else {
                    pending.push(entry);
                }
            }
            if pending.is_empty() {
                debug!("all subscriptions active");
                return Ok(());
            }

            let requests: Vec<_> = pending
                .iter()
                .map(|entry| {
                    entry.scope().set_subscription_state(SubscriptionState::Pending);
                    SubscriptionRequest::silent_for_zone(
                        entry.scope().zone_id().clone(),
                        ctx.config.quality_of_service,
                    )
                })
                .collect();

            let resume = ctx.state();
            ctx.set_state(SyncState::Provisioning);
            let result = ctx.transport.save_subscriptions(requests).await;
            ctx.set_state(resume);
            let error = result.err();

            match ctx.classifier.classify(error.as_ref()) {
                FetchOutcome::Success => {
                    let zones: Vec<_> = pending
                        .iter()
                        .map(|entry| entry.scope().zone_id().clone())
                        .collect();
                    let cached = ctx
                        .write_tokens(move |tokens| {
                            zones
                                .iter()
                                .try_for_each(|zone| tokens.set_subscription_active(zone, true))
                        })
                        .await;
                    if let Err(e) = cached {
                        reset_subscriptions(&pending);
                        return Err(e);
                    }
                    for entry in &pending {
                        entry.scope().set_subscription_state(SubscriptionState::Active);
                        info!(zone = %entry.scope().zone_id(), "subscription active");
                    }
                    return Ok(());
                }
                FetchOutcome::Retry(delay) => {
                    reset_subscriptions(&pending);
                    if let Some(cause) = &error {
                        budget.spend(cause)?;
                    }
                    warn!(delay_ms = delay.as_millis() as u64, "subscription save throttled, retrying");
                    ctx.retry_after(delay).await?;
                }
                FetchOutcome::Recoverable { error, .. } | FetchOutcome::Fatal(error) => {
                    reset_subscriptions(&pending);
                    warn!(error = %error, "subscription save failed");
                    return Err(SyncError::Remote(error));
                }
            }
        }
    }
}

fn reset_zones(pending: &[&crate::registry::RegisteredObject]) {
    for entry in pending {
        entry.scope().set_zone_state(ZoneState::NotProvisioned);
    }
}

fn reset_subscriptions(pending: &[&crate::registry::RegisteredObject]) {
    for entry in pending {
        entry.scope().set_subscription_state(SubscriptionState::Absent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::registry::{MemorySyncObject, ObjectCall, SyncObject, SyncObjectRegistry};
    use crate::store::MemoryKeyValueStore;
    use crate::tokens::ChangeTokenStore;
    use crate::transport::MockTransport;
    use cloudsync_protocol::{RemoteError, ZoneId};
    use std::time::Duration;

    fn setup(
        transport: MockTransport,
        config: SyncConfig,
    ) -> (
        ZoneLifecycleManager<MockTransport>,
        Arc<SyncContext<MockTransport>>,
        Arc<MemorySyncObject>,
    ) {
        let dogs = Arc::new(MemorySyncObject::new("DogZone", "Dog"));
        let cats: Arc<dyn SyncObject> = Arc::new(MemorySyncObject::new("CatZone", "Cat"));
        let registry =
            SyncObjectRegistry::new(vec![Arc::clone(&dogs) as Arc<dyn SyncObject>, cats]).unwrap();
        let supports = transport.supports_subscriptions();
        let ctx = Arc::new(SyncContext::new(
            config,
            Arc::new(transport),
            ChangeTokenStore::new(Arc::new(MemoryKeyValueStore::new())),
            registry,
            supports,
        ));
        (ZoneLifecycleManager::new(Arc::clone(&ctx)), ctx, dogs)
    }

    #[tokio::test]
    async fn creates_all_missing_zones_in_one_batch() {
        let (manager, ctx, dogs) = setup(MockTransport::new(), SyncConfig::default());
        dogs.add_pending_local("rex");

        manager.ensure_zones().await.unwrap();

        let creations = ctx.transport.zone_creations();
        assert_eq!(creations.len(), 1);
        assert_eq!(
            creations[0].zones,
            vec![ZoneId::new("DogZone"), ZoneId::new("CatZone")]
        );
        assert!(ctx.registry.iter().all(|e| e.scope().is_zone_provisioned()));

        // Already provisioned: no further remote call.
        manager.ensure_zones().await.unwrap();
        assert_eq!(ctx.transport.zone_creations().len(), 1);

        // The push runs decoupled from provisioning.
        for _ in 0..100 {
            if dogs.calls().contains(&ObjectCall::PushPending) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dogs.pending_local().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_zone_creation_after_delay() {
        let transport = MockTransport::new();
        transport.push_create_zones_result(Err(RemoteError::ZoneBusy {
            retry_after: Some(Duration::from_secs(10)),
        }));
        let (manager, ctx, _) = setup(transport, SyncConfig::default());

        manager.ensure_zones().await.unwrap();

        assert_eq!(ctx.transport.zone_creations().len(), 2);
        assert_eq!(ctx.stats().retries, 1);
        assert!(ctx.registry.iter().all(|e| e.scope().is_zone_provisioned()));
    }

    #[tokio::test]
    async fn fatal_zone_failure_leaves_scopes_unprovisioned() {
        let transport = MockTransport::new();
        transport.push_create_zones_result(Err(RemoteError::QuotaExceeded));
        let (manager, ctx, _) = setup(transport, SyncConfig::default());

        let err = manager.ensure_zones().await.unwrap_err();
        assert_eq!(err, SyncError::Remote(RemoteError::QuotaExceeded));
        assert!(ctx
            .registry
            .iter()
            .all(|e| e.scope().zone_state() == ZoneState::NotProvisioned));

        // The next call tries again.
        manager.ensure_zones().await.unwrap();
        assert_eq!(ctx.transport.zone_creations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_cap_applies_to_zone_creation() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            transport.push_create_zones_result(Err(RemoteError::NetworkUnavailable));
        }
        let config = SyncConfig::default()
            .with_retry(RetryConfig::default().with_max_consecutive_retries(2));
        let (manager, _, _) = setup(transport, config);

        let err = manager.ensure_zones().await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn subscription_is_cached_after_success() {
        let (manager, ctx, _) = setup(MockTransport::new(), SyncConfig::default());

        manager.ensure_subscription().await.unwrap();
        manager.ensure_subscription().await.unwrap();

        let batches = ctx.transport.subscription_requests();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].iter().all(|request| request.silent));
        assert!(ctx
            .tokens
            .subscription_active(&ZoneId::new("DogZone"))
            .unwrap());
        assert!(ctx
            .registry
            .iter()
            .all(|e| e.scope().is_subscription_provisioned()));
    }

    #[tokio::test]
    async fn subscription_failure_leaves_flag_unset() {
        let transport = MockTransport::new();
        transport.push_subscription_result(Err(RemoteError::PermissionFailure));
        let (manager, ctx, _) = setup(transport, SyncConfig::default());

        assert!(manager.ensure_subscription().await.is_err());
        assert!(!ctx
            .tokens
            .subscription_active(&ZoneId::new("DogZone"))
            .unwrap());

        manager.ensure_subscription().await.unwrap();
        assert_eq!(ctx.transport.subscription_requests().len(), 2);
    }

    #[tokio::test]
    async fn subscription_skipped_without_capability() {
        let (manager, ctx, _) = setup(MockTransport::without_subscriptions(), SyncConfig::default());

        manager.ensure_subscription().await.unwrap();
        assert!(ctx.transport.subscription_requests().is_empty());
    }
}
