//! State shared by the engine's components.

use crate::classify::Classifier;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::registry::{SubscriptionState, SyncObjectRegistry, ZoneState};
use crate::tokens::ChangeTokenStore;
use cloudsync_protocol::ZoneId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is creating zones or subscriptions.
    Provisioning,
    /// Engine is asking which zones changed.
    FetchingDatabase,
    /// Engine is streaming record changes.
    FetchingZones,
    /// Engine is waiting before retrying.
    RetryWait,
    /// Engine has completed a fetch cycle.
    Synced,
    /// The last fetch cycle failed.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Provisioning
                | SyncState::FetchingDatabase
                | SyncState::FetchingZones
                | SyncState::RetryWait
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of fetch cycles completed successfully.
    pub cycles_completed: u64,
    /// Total number of upserts applied to collaborators.
    pub records_applied: u64,
    /// Total number of tombstones applied to collaborators.
    pub tombstones_applied: u64,
    /// Total number of automatic retries.
    pub retries: u64,
    /// Total number of change tokens discarded because they expired.
    pub cursor_resets: u64,
    /// Last successful fetch time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Tracks whether the owning engine is still alive.
///
/// Background work holds the shared context, not the engine handle.
/// Once the handle shuts down, pending delays end early and in-flight
/// cycles stop at their next event.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    shut_down: AtomicBool,
    notify: Notify,
}

impl Liveness {
    pub(crate) fn is_live(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> SyncResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    pub(crate) fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once the engine has shut down.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_live() {
                return;
            }
            notified.await;
        }
    }

    /// Waits for `delay` unless the engine shuts down first.
    pub(crate) async fn sleep(&self, delay: Duration) -> SyncResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.check(),
            _ = self.cancelled() => Err(SyncError::Cancelled),
        }
    }
}

/// Everything the fetchers and the lifecycle manager share.
pub(crate) struct SyncContext<T> {
    pub(crate) config: SyncConfig,
    pub(crate) transport: Arc<T>,
    pub(crate) tokens: ChangeTokenStore,
    pub(crate) registry: SyncObjectRegistry,
    pub(crate) classifier: Classifier,
    pub(crate) liveness: Arc<Liveness>,
    pub(crate) subscriptions_supported: bool,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl<T> SyncContext<T> {
    pub(crate) fn new(
        config: SyncConfig,
        transport: Arc<T>,
        tokens: ChangeTokenStore,
        registry: SyncObjectRegistry,
        subscriptions_supported: bool,
    ) -> Self {
        let classifier = Classifier::from_config(&config.retry);
        Self {
            config,
            transport,
            tokens,
            registry,
            classifier,
            liveness: Arc::default(),
            subscriptions_supported,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    pub(crate) fn state(&self) -> SyncState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    pub(crate) fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut SyncStats)) {
        update(&mut self.stats.write());
    }

    /// Drops everything cached about a zone deleted on the remote side.
    ///
    /// The zone's history and its subscription went with it, so the token
    /// is cleared and both must be re-created before the next fetch.
    pub(crate) async fn forget_remote_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        if let Some(entry) = self.registry.by_zone(zone) {
            entry.scope().set_zone_state(ZoneState::NotProvisioned);
            entry.scope().set_subscription_state(SubscriptionState::Absent);
        }
        let zone = zone.clone();
        self.write_tokens(move |tokens| {
            tokens.set_zone_token(&zone, None)?;
            tokens.set_subscription_active(&zone, false)
        })
        .await
    }

    /// Runs a token write on the blocking pool.
    ///
    /// File-backed stores sync to disk on every write, so writes never
    /// run on a runtime worker.
    pub(crate) async fn write_tokens<F>(&self, write: F) -> SyncResult<()>
    where
        F: FnOnce(&ChangeTokenStore) -> SyncResult<()> + Send + 'static,
    {
        let tokens = self.tokens.clone();
        tokio::task::spawn_blocking(move || write(&tokens))
            .await
            .map_err(|e| SyncError::Storage(format!("token write task failed: {e}")))?
    }

    /// Waits out a retry delay, reflecting it in the engine state.
    pub(crate) async fn retry_after(&self, delay: Duration) -> SyncResult<()> {
        let resume = self.state();
        self.set_state(SyncState::RetryWait);
        self.record(|stats| stats.retries += 1);
        self.liveness.sleep(delay).await?;
        self.set_state(resume);
        Ok(())
    }
}
