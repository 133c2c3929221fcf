//! Transport layer abstraction for the remote store.

use cloudsync_protocol::{
    DatabaseChangeEvent, DatabaseChangesRequest, RemoteError, SubscriptionRequest,
    ZoneChangeEvent, ZoneChangesRequest, ZonesRequest,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::mpsc;

/// Stream of events produced by a running remote operation.
pub type EventStream<E> = mpsc::UnboundedReceiver<E>;

/// A transport executes operations against the remote store.
///
/// This trait abstracts the network layer: the engine only decides when
/// and in what order operations run and what to do with their outcomes.
/// Streaming operations return immediately with a receiver and deliver
/// their events from wherever the transport runs them. A stream must end
/// with exactly one `Completed` event; a stream that closes without one is
/// treated as an internal transport failure.
pub trait CloudTransport: Send + Sync + 'static {
    /// Whether this transport can create change-notification
    /// subscriptions. Read once when the engine is constructed.
    fn supports_subscriptions(&self) -> bool {
        true
    }

    /// Lists zones changed since the request token.
    fn fetch_database_changes(
        &self,
        request: DatabaseChangesRequest,
    ) -> EventStream<DatabaseChangeEvent>;

    /// Streams record changes for several zones.
    fn fetch_zone_changes(&self, request: ZoneChangesRequest) -> EventStream<ZoneChangeEvent>;

    /// Creates zones in one batch.
    fn create_zones(
        &self,
        request: ZonesRequest,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Creates or verifies subscriptions in one batch.
    fn save_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// A scripted transport for testing.
///
/// Each fetch pops the next scripted event sequence. When no script is
/// queued, a database fetch completes with no changes and a zone fetch
/// completes every requested zone with no changes. Every request is
/// recorded for later inspection.
pub struct MockTransport {
    supports_subscriptions: bool,
    database_scripts: Mutex<VecDeque<Vec<DatabaseChangeEvent>>>,
    zone_scripts: Mutex<VecDeque<Vec<ZoneChangeEvent>>>,
    create_zone_results: Mutex<VecDeque<Result<(), RemoteError>>>,
    subscription_results: Mutex<VecDeque<Result<(), RemoteError>>>,
    database_requests: Mutex<Vec<DatabaseChangesRequest>>,
    zone_requests: Mutex<Vec<ZoneChangesRequest>>,
    zone_creations: Mutex<Vec<ZonesRequest>>,
    subscription_requests: Mutex<Vec<Vec<SubscriptionRequest>>>,
}

impl MockTransport {
    /// Creates a mock transport that supports subscriptions.
    pub fn new() -> Self {
        Self {
            supports_subscriptions: true,
            database_scripts: Mutex::new(VecDeque::new()),
            zone_scripts: Mutex::new(VecDeque::new()),
            create_zone_results: Mutex::new(VecDeque::new()),
            subscription_results: Mutex::new(VecDeque::new()),
            database_requests: Mutex::new(Vec::new()),
            zone_requests: Mutex::new(Vec::new()),
            zone_creations: Mutex::new(Vec::new()),
            subscription_requests: Mutex::new(Vec::new()),
        }
    }

    /// Creates a mock transport without subscription support.
    pub fn without_subscriptions() -> Self {
        Self {
            supports_subscriptions: false,
            ..Self::new()
        }
    }

    /// Queues the events of the next database fetch.
    pub fn push_database_script(&self, events: Vec<DatabaseChangeEvent>) {
        self.database_scripts.lock().push_back(events);
    }

    /// Queues the events of the next zone fetch.
    pub fn push_zone_script(&self, events: Vec<ZoneChangeEvent>) {
        self.zone_scripts.lock().push_back(events);
    }

    /// Queues the result of the next zone creation.
    pub fn push_create_zones_result(&self, result: Result<(), RemoteError>) {
        self.create_zone_results.lock().push_back(result);
    }

    /// Queues the result of the next subscription save.
    pub fn push_subscription_result(&self, result: Result<(), RemoteError>) {
        self.subscription_results.lock().push_back(result);
    }

    /// Database fetch requests received so far.
    pub fn database_requests(&self) -> Vec<DatabaseChangesRequest> {
        self.database_requests.lock().clone()
    }

    /// Zone fetch requests received so far.
    pub fn zone_requests(&self) -> Vec<ZoneChangesRequest> {
        self.zone_requests.lock().clone()
    }

    /// Zone creation requests received so far.
    pub fn zone_creations(&self) -> Vec<ZonesRequest> {
        self.zone_creations.lock().clone()
    }

    /// Subscription batches received so far.
    pub fn subscription_requests(&self) -> Vec<Vec<SubscriptionRequest>> {
        self.subscription_requests.lock().clone()
    }

    fn stream<E>(events: Vec<E>) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            // The receiver is alive until we return it.
            let _ = tx.send(event);
        }
        rx
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudTransport for MockTransport {
    fn supports_subscriptions(&self) -> bool {
        self.supports_subscriptions
    }

    fn fetch_database_changes(
        &self,
        request: DatabaseChangesRequest,
    ) -> EventStream<DatabaseChangeEvent> {
        self.database_requests.lock().push(request);
        let events = self
            .database_scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                vec![DatabaseChangeEvent::Completed {
                    token: None,
                    error: None,
                }]
            });
        Self::stream(events)
    }

    fn fetch_zone_changes(&self, request: ZoneChangesRequest) -> EventStream<ZoneChangeEvent> {
        let events = self.zone_scripts.lock().pop_front().unwrap_or_else(|| {
            request
                .zones
                .iter()
                .map(|zone| ZoneChangeEvent::ZoneCompleted {
                    zone_id: zone.zone_id.clone(),
                    token: None,
                    error: None,
                })
                .chain(std::iter::once(ZoneChangeEvent::Completed { error: None }))
                .collect()
        });
        self.zone_requests.lock().push(request);
        Self::stream(events)
    }

    async fn create_zones(&self, request: ZonesRequest) -> Result<(), RemoteError> {
        self.zone_creations.lock().push(request);
        self.create_zone_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn save_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
    ) -> Result<(), RemoteError> {
        self.subscription_requests.lock().push(requests);
        self.subscription_results.lock().pop_front().unwrap_or(Ok(()))
    }
}
