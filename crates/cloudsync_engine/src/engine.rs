//! The sync engine facade.

use crate::config::SyncConfig;
use crate::context::{SyncContext, SyncState, SyncStats};
use crate::database::DatabaseChangeFetcher;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::ZoneLifecycleManager;
use crate::registry::{SyncObject, SyncObjectRegistry};
use crate::store::KeyValueStore;
use crate::throttle::ChangeNotificationThrottle;
use crate::tokens::ChangeTokenStore;
use crate::transport::CloudTransport;
use crate::zone::{FetchSummary, ZoneChangeFetcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State owned jointly by the handle and its background tasks.
struct Shared<T> {
    ctx: Arc<SyncContext<T>>,
    /// Held for a whole fetch cycle; token read-then-write assumes one
    /// cycle at a time.
    fetch_lock: Mutex<()>,
    /// Set by a throttle tick, cleared when a cycle starts on its behalf.
    tick_pending: AtomicBool,
    /// True while a task is draining `tick_pending`.
    draining: AtomicBool,
}

impl<T: CloudTransport> Shared<T> {
    async fn fetch_cycle(&self) -> SyncResult<FetchSummary> {
        let _guard = self.fetch_lock.lock().await;
        self.database_cycle().await
    }

    /// Runs a cycle for a throttle tick.
    ///
    /// Ticks that arrive while a cycle runs or waits for the lock collapse
    /// into one follow-up cycle.
    fn tick(self: &Arc<Self>) {
        self.tick_pending.store(true, Ordering::SeqCst);
        if !self.draining.swap(true, Ordering::SeqCst) {
            tokio::spawn(Arc::clone(self).drain_ticks());
        }
    }

    async fn drain_ticks(self: Arc<Self>) {
        loop {
            {
                let _guard = self.fetch_lock.lock().await;
                while self.tick_pending.swap(false, Ordering::SeqCst) {
                    // Failures are recorded in the stats by the cycle itself.
                    let _ = self.database_cycle().await;
                }
            }
            self.draining.store(false, Ordering::SeqCst);
            // A tick that raced the store above saw `draining` set and left
            // its flag for us.
            if !self.tick_pending.load(Ordering::SeqCst)
                || self.draining.swap(true, Ordering::SeqCst)
            {
                return;
            }
        }
    }

    /// Caller holds `fetch_lock`.
    async fn database_cycle(&self) -> SyncResult<FetchSummary> {
        let ctx = &self.ctx;
        ctx.liveness.check()?;

        let started = Instant::now();
        let result = DatabaseChangeFetcher::new(Arc::clone(ctx)).fetch().await;
        self.finish(result, started)
    }

    async fn zone_cycle(&self) -> SyncResult<FetchSummary> {
        let _guard = self.fetch_lock.lock().await;
        self.ctx.liveness.check()?;

        let started = Instant::now();
        let result = ZoneChangeFetcher::new(Arc::clone(&self.ctx))
            .fetch_all_zones()
            .await;
        self.finish(result, started)
    }

    fn finish(
        &self,
        result: SyncResult<FetchSummary>,
        started: Instant,
    ) -> SyncResult<FetchSummary> {
        let ctx = &self.ctx;
        match &result {
            Ok(summary) => {
                ctx.set_state(SyncState::Synced);
                ctx.record(|stats| {
                    stats.cycles_completed += 1;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                });
                info!(
                    database = %ctx.config.database_name,
                    changed_zones = summary.changed_zones,
                    applied = summary.records_applied,
                    deleted = summary.tombstones_applied,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "fetch cycle completed"
                );
            }
            Err(SyncError::Cancelled) => {
                debug!("fetch cycle cancelled");
            }
            Err(e) => {
                ctx.set_state(SyncState::Error);
                ctx.record(|stats| stats.last_error = Some(e.to_string()));
                warn!(database = %ctx.config.database_name, error = %e, "fetch cycle failed");
            }
        }
        result
    }
}

/// Keeps a set of local collaborators in sync with a remote record store.
///
/// Must be created from within a Tokio runtime: the notification throttle
/// and callback-style fetches run as tasks on it.
///
/// Dropping the handle shuts the engine down. Work already in flight stops
/// at its next event or delay, and callbacks it would have invoked are
/// dropped.
pub struct CloudSync<T: CloudTransport> {
    shared: Arc<Shared<T>>,
    throttle: ChangeNotificationThrottle,
}

impl<T: CloudTransport> CloudSync<T> {
    /// Creates an engine for the given collaborators.
    ///
    /// The transport's subscription capability is read once here.
    pub fn new(
        config: SyncConfig,
        transport: Arc<T>,
        store: Arc<dyn KeyValueStore>,
        objects: Vec<Arc<dyn SyncObject>>,
    ) -> SyncResult<Self> {
        let registry = SyncObjectRegistry::new(objects)?;
        let subscriptions_supported = transport.supports_subscriptions();
        let window = config.notification_window;
        let ctx = Arc::new(SyncContext::new(
            config,
            transport,
            ChangeTokenStore::new(store),
            registry,
            subscriptions_supported,
        ));
        let shared = Arc::new(Shared {
            ctx: Arc::clone(&ctx),
            fetch_lock: Mutex::new(()),
            tick_pending: AtomicBool::new(false),
            draining: AtomicBool::new(false),
        });

        let ticker = Arc::clone(&shared);
        let throttle = ChangeNotificationThrottle::spawn(
            window,
            Arc::clone(&ctx.liveness),
            move || ticker.tick(),
        );

        debug!(
            database = %ctx.config.database_name,
            scopes = ctx.registry.len(),
            subscriptions_supported,
            "sync engine created"
        );
        Ok(Self { shared, throttle })
    }

    fn ctx(&self) -> &Arc<SyncContext<T>> {
        &self.shared.ctx
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.ctx().config
    }

    /// Gets the registered collaborators.
    pub fn registry(&self) -> &SyncObjectRegistry {
        &self.ctx().registry
    }

    /// Gets the persisted change tokens.
    pub fn tokens(&self) -> &ChangeTokenStore {
        &self.ctx().tokens
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        self.ctx().state()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.ctx().stats()
    }

    /// Returns true until [`shutdown`](Self::shutdown) is called.
    pub fn is_running(&self) -> bool {
        self.ctx().liveness.is_live()
    }

    /// Provisions zones, then subscriptions.
    pub async fn prepare(&self) -> SyncResult<()> {
        self.ensure_zones().await?;
        self.ensure_subscription().await
    }

    /// Creates every missing remote zone.
    pub async fn ensure_zones(&self) -> SyncResult<()> {
        ZoneLifecycleManager::new(Arc::clone(self.ctx()))
            .ensure_zones()
            .await
    }

    /// Creates every missing change subscription.
    pub async fn ensure_subscription(&self) -> SyncResult<()> {
        ZoneLifecycleManager::new(Arc::clone(self.ctx()))
            .ensure_subscription()
            .await
    }

    /// Runs a full fetch cycle: changed zones, then their records.
    ///
    /// Cycles never overlap; a call made while one is running waits for it
    /// and then runs its own.
    pub async fn fetch_changes(&self) -> SyncResult<FetchSummary> {
        self.shared.fetch_cycle().await
    }

    /// Runs [`fetch_changes`](Self::fetch_changes) in the background and
    /// hands its outcome to `callback`.
    ///
    /// The callback is invoked at most once, with the terminal outcome
    /// after all automatic retries. It is never invoked if the engine
    /// shuts down first.
    pub fn fetch_changes_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(SyncResult<FetchSummary>) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.fetch_cycle().await;
            if matches!(result, Err(SyncError::Cancelled)) || !shared.ctx.liveness.is_live() {
                debug!("engine shut down, dropping fetch callback");
                return;
            }
            callback(result);
        })
    }

    /// Fetches record changes of every registered zone without asking
    /// which zones changed first.
    pub async fn fetch_all_zones(&self) -> SyncResult<FetchSummary> {
        self.shared.zone_cycle().await
    }

    /// Signals that remote data changed.
    ///
    /// Bursts are coalesced: one fetch cycle starts at the end of each
    /// notification window. Windows that close while a cycle is running
    /// queue at most one more cycle between them.
    pub fn remote_changed(&self) {
        self.throttle.notify();
    }

    /// Asks every collaborator to push its pending local changes, and
    /// waits for all of them.
    ///
    /// Returns the first failure after every collaborator had its turn.
    pub async fn push_all_pending(&self) -> SyncResult<()> {
        self.ctx().liveness.check()?;

        let mut pushes = Vec::with_capacity(self.registry().len());
        for entry in self.registry().iter() {
            let zone = entry.scope().zone_id().clone();
            let object = Arc::clone(entry.object());
            let handle = tokio::task::spawn_blocking(move || object.push_pending_local_changes());
            pushes.push((zone, handle));
        }

        let mut first_error = None;
        for (zone, handle) in pushes {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(SyncError::apply(&zone, e.to_string())),
            };
            if let Err(e) = result {
                warn!(zone = %zone, error = %e, "pushing pending local changes failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops the engine.
    ///
    /// Idempotent. Pending retry delays end early and in-flight cycles
    /// report [`SyncError::Cancelled`].
    pub fn shutdown(&self) {
        let ctx = self.ctx();
        if ctx.liveness.is_live() {
            info!(database = %ctx.config.database_name, "sync engine shutting down");
            ctx.liveness.shut_down();
        }
    }
}

impl<T: CloudTransport> Drop for CloudSync<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: CloudTransport> std::fmt::Debug for CloudSync<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSync")
            .field("database", &self.ctx().config.database_name)
            .field("state", &self.state())
            .field("scopes", &self.registry().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemorySyncObject, ObjectCall};
    use crate::store::MemoryKeyValueStore;
    use crate::transport::MockTransport;
    use cloudsync_protocol::{ChangeToken, RemoteError, RemoteRecord, ZoneChangeEvent, ZoneId};
    use std::time::Duration;

    fn engine(transport: MockTransport) -> (CloudSync<MockTransport>, Arc<MemorySyncObject>) {
        let dogs = Arc::new(MemorySyncObject::new("DogZone", "Dog"));
        let engine = CloudSync::new(
            SyncConfig::default(),
            Arc::new(transport),
            Arc::new(MemoryKeyValueStore::new()),
            vec![Arc::clone(&dogs) as Arc<dyn SyncObject>],
        )
        .unwrap();
        (engine, dogs)
    }

    #[tokio::test]
    async fn successful_cycle_updates_stats() {
        let transport = MockTransport::new();
        transport.push_zone_script(vec![
            ZoneChangeEvent::RecordChanged(RemoteRecord::new("Dog", "rex", "DogZone", vec![1])),
            ZoneChangeEvent::ZoneCompleted {
                zone_id: ZoneId::new("DogZone"),
                token: Some(ChangeToken::from_bytes(vec![1])),
                error: None,
            },
            ZoneChangeEvent::Completed { error: None },
        ]);
        let (engine, dogs) = engine(transport);

        let summary = engine.fetch_changes().await.unwrap();

        assert_eq!(summary.records_applied, 1);
        assert_eq!(engine.state(), SyncState::Synced);
        let stats = engine.stats();
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.records_applied, 1);
        assert!(stats.last_sync_time.is_some());
        assert_eq!(dogs.records().len(), 1);
    }

    #[tokio::test]
    async fn failed_cycle_records_error() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![cloudsync_protocol::DatabaseChangeEvent::Completed {
            token: None,
            error: Some(RemoteError::NotAuthenticated),
        }]);
        let (engine, _) = engine(transport);

        let err = engine.fetch_changes().await.unwrap_err();

        assert_eq!(err, SyncError::Remote(RemoteError::NotAuthenticated));
        assert_eq!(engine.state(), SyncState::Error);
        assert!(engine.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let err = CloudSync::new(
            SyncConfig::default(),
            Arc::new(MockTransport::new()),
            Arc::new(MemoryKeyValueStore::new()),
            vec![
                Arc::new(MemorySyncObject::new("DogZone", "Dog")) as Arc<dyn SyncObject>,
                Arc::new(MemorySyncObject::new("DogZone", "Puppy")) as Arc<dyn SyncObject>,
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRegistration(_)));
    }

    #[tokio::test]
    async fn callback_receives_outcome() {
        let (engine, _) = engine(MockTransport::new());
        let (tx, rx) = tokio::sync::oneshot::channel();

        engine
            .fetch_changes_with(move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_callback() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![cloudsync_protocol::DatabaseChangeEvent::Completed {
            token: None,
            error: Some(RemoteError::ServiceUnavailable {
                retry_after: Some(Duration::from_secs(60)),
            }),
        }]);
        let (engine, _) = engine(transport);
        let (tx, rx) = tokio::sync::oneshot::channel::<SyncResult<FetchSummary>>();

        let handle = engine.fetch_changes_with(move |result| {
            let _ = tx.send(result);
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        engine.shutdown();
        handle.await.unwrap();

        // The sender was dropped together with the callback.
        assert!(rx.await.is_err());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn prepare_provisions_and_push_all_pending_flushes() {
        let (engine, dogs) = engine(MockTransport::new());
        engine.prepare().await.unwrap();
        assert!(engine.registry().iter().all(|e| e.scope().is_zone_provisioned()));

        dogs.add_pending_local("rex");
        engine.push_all_pending().await.unwrap();
        assert!(dogs.pending_local().is_empty());
        assert!(dogs.calls().contains(&ObjectCall::PushPending));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_during_a_long_retry_queue_one_cycle() {
        let transport = MockTransport::new();
        transport.push_database_script(vec![cloudsync_protocol::DatabaseChangeEvent::Completed {
            token: None,
            error: Some(RemoteError::ServiceUnavailable {
                retry_after: Some(Duration::from_secs(120)),
            }),
        }]);
        let transport = Arc::new(transport);
        let engine = CloudSync::new(
            SyncConfig::default(),
            Arc::clone(&transport),
            Arc::new(MemoryKeyValueStore::new()),
            vec![Arc::new(MemorySyncObject::new("DogZone", "Dog")) as Arc<dyn SyncObject>],
        )
        .unwrap();

        let running = engine.fetch_changes_with(|_| {});
        for _ in 0..20 {
            engine.remote_changed();
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        running.await.unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;

        // The failed attempt, its retry, and one cycle for all twenty ticks.
        assert_eq!(transport.database_requests().len(), 3);
        assert_eq!(engine.stats().cycles_completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_after_idle_runs_a_fresh_cycle() {
        let transport = Arc::new(MockTransport::new());
        let engine = CloudSync::new(
            SyncConfig::default(),
            Arc::clone(&transport),
            Arc::new(MemoryKeyValueStore::new()),
            vec![Arc::new(MemorySyncObject::new("DogZone", "Dog")) as Arc<dyn SyncObject>],
        )
        .unwrap();

        engine.remote_changed();
        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.remote_changed();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.database_requests().len(), 2);
    }

    #[tokio::test]
    async fn operations_fail_after_shutdown() {
        let (engine, _) = engine(MockTransport::new());
        engine.shutdown();
        engine.shutdown();

        assert_eq!(engine.fetch_changes().await, Err(SyncError::Cancelled));
        assert_eq!(engine.push_all_pending().await, Err(SyncError::Cancelled));
    }
}
