//! An in-memory remote record store.
//!
//! [`MemoryCloud`] behaves like the real service as far as the engine can
//! tell: it hands out change tokens, collapses history into the latest
//! state per record, expires tokens on demand and fails operations when
//! told to.

use cloudsync_engine::{CloudTransport, EventStream};
use cloudsync_protocol::{
    ChangeToken, DatabaseChangeEvent, DatabaseChangesRequest, RecordId, RemoteError,
    RemoteRecord, SubscriptionRequest, ZoneChangeEvent, ZoneChangesRequest, ZoneId, ZonesRequest,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::mpsc;

/// Encodes a sequence number as a change token.
pub fn token_for(seq: u64) -> ChangeToken {
    ChangeToken::from_bytes(seq.to_be_bytes().to_vec())
}

/// Decodes a change token issued by [`MemoryCloud`].
pub fn seq_of(token: &ChangeToken) -> Option<u64> {
    let bytes: [u8; 8] = token.as_bytes().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Number of calls received per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Database-level change fetches.
    pub database_fetches: usize,
    /// Zone-level change fetches.
    pub zone_fetches: usize,
    /// Zone creation batches.
    pub zone_creations: usize,
    /// Subscription save batches.
    pub subscription_saves: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZoneChange {
    Changed,
    Deleted,
}

#[derive(Debug, Clone)]
struct RecordEntry {
    seq: u64,
    record_type: String,
    record: Option<RemoteRecord>,
}

#[derive(Debug, Default)]
struct ZoneLog {
    records: BTreeMap<RecordId, RecordEntry>,
    min_valid: u64,
}

#[derive(Debug, Default)]
struct Faults {
    database: VecDeque<RemoteError>,
    fetch: VecDeque<RemoteError>,
    zones: HashMap<ZoneId, VecDeque<RemoteError>>,
    create_zones: VecDeque<RemoteError>,
    subscriptions: VecDeque<RemoteError>,
}

#[derive(Debug, Default)]
struct CloudState {
    seq: u64,
    database_min_valid: u64,
    zones: BTreeMap<ZoneId, ZoneLog>,
    zone_changes: BTreeMap<ZoneId, (u64, ZoneChange)>,
    subscriptions: BTreeSet<String>,
    faults: Faults,
    calls: CallCounts,
    checkpoint_every: Option<usize>,
}

impl CloudState {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn ensure_zone(&mut self, zone: &ZoneId) {
        if !self.zones.contains_key(zone) {
            let seq = self.bump();
            self.zones.insert(zone.clone(), ZoneLog::default());
            self.zone_changes
                .insert(zone.clone(), (seq, ZoneChange::Changed));
        }
    }

    fn touch(&mut self, zone: &ZoneId, seq: u64) {
        self.zone_changes
            .insert(zone.clone(), (seq, ZoneChange::Changed));
    }

    /// Resolves a request token to the sequence number to resume after.
    fn resume_point(since: Option<&ChangeToken>, min_valid: u64) -> Result<u64, RemoteError> {
        match since {
            None => Ok(0),
            Some(token) => match seq_of(token) {
                Some(seq) if seq >= min_valid => Ok(seq),
                _ => Err(RemoteError::ChangeTokenExpired),
            },
        }
    }
}

/// In-memory implementation of [`CloudTransport`].
///
/// Every mutation advances a global sequence number; tokens encode that
/// number. Fetching without a token returns the current state of every
/// live record; fetching with one returns the latest change of each record
/// touched since, deletions included.
#[derive(Debug)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    supports_subscriptions: bool,
}

impl MemoryCloud {
    /// Creates an empty cloud.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            supports_subscriptions: true,
        }
    }

    /// Creates an empty cloud that cannot create subscriptions.
    pub fn without_subscriptions() -> Self {
        Self {
            supports_subscriptions: false,
            ..Self::new()
        }
    }

    /// Emits a token checkpoint after every `n` records of a zone.
    pub fn with_checkpoint_every(self, n: usize) -> Self {
        self.state.lock().checkpoint_every = Some(n.max(1));
        self
    }

    /// Creates a zone directly, bypassing the transport.
    pub fn create_zone(&self, zone: impl Into<ZoneId>) {
        self.state.lock().ensure_zone(&zone.into());
    }

    /// Deletes a zone and everything in it.
    pub fn delete_zone(&self, zone: impl Into<ZoneId>) {
        let zone = zone.into();
        let mut state = self.state.lock();
        if state.zones.remove(&zone).is_some() {
            let seq = state.bump();
            state
                .zone_changes
                .insert(zone.clone(), (seq, ZoneChange::Deleted));
            state
                .subscriptions
                .remove(&SubscriptionRequest::id_for_zone(&zone));
        }
    }

    /// Writes a record, creating its zone if needed. Returns the new
    /// sequence number.
    pub fn put(&self, record: RemoteRecord) -> u64 {
        let mut state = self.state.lock();
        state.ensure_zone(&record.zone_id);
        let seq = state.bump();
        let zone = record.zone_id.clone();
        state.touch(&zone, seq);
        if let Some(log) = state.zones.get_mut(&zone) {
            log.records.insert(
                record.record_id.clone(),
                RecordEntry {
                    seq,
                    record_type: record.record_type.clone(),
                    record: Some(record),
                },
            );
        }
        seq
    }

    /// Deletes a record. Returns `false` if it did not exist.
    pub fn delete(&self, zone: impl Into<ZoneId>, record_id: impl Into<RecordId>) -> bool {
        let zone = zone.into();
        let record_id = record_id.into();
        let mut state = self.state.lock();

        let exists = state
            .zones
            .get(&zone)
            .and_then(|log| log.records.get(&record_id))
            .is_some_and(|entry| entry.record.is_some());
        if !exists {
            return false;
        }

        let seq = state.bump();
        state.touch(&zone, seq);
        if let Some(entry) = state
            .zones
            .get_mut(&zone)
            .and_then(|log| log.records.get_mut(&record_id))
        {
            entry.seq = seq;
            entry.record = None;
        }
        true
    }

    /// Invalidates every token issued so far for `zone`.
    pub fn expire_zone_tokens(&self, zone: impl Into<ZoneId>) {
        let zone = zone.into();
        let mut state = self.state.lock();
        let seq = state.bump();
        if let Some(log) = state.zones.get_mut(&zone) {
            log.min_valid = seq;
        }
    }

    /// Invalidates every database token issued so far.
    pub fn expire_database_tokens(&self) {
        let mut state = self.state.lock();
        state.database_min_valid = state.bump();
    }

    /// Fails the next database-level fetch with `error`.
    pub fn fail_next_database_fetch(&self, error: RemoteError) {
        self.state.lock().faults.database.push_back(error);
    }

    /// Fails the next zone-level fetch as a whole with `error`.
    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.state.lock().faults.fetch.push_back(error);
    }

    /// Fails `zone` in the next zone-level fetch that includes it.
    pub fn fail_next_zone_fetch(&self, zone: impl Into<ZoneId>, error: RemoteError) {
        self.state
            .lock()
            .faults
            .zones
            .entry(zone.into())
            .or_default()
            .push_back(error);
    }

    /// Fails the next zone creation batch with `error`.
    pub fn fail_next_create_zones(&self, error: RemoteError) {
        self.state.lock().faults.create_zones.push_back(error);
    }

    /// Fails the next subscription batch with `error`.
    pub fn fail_next_subscription(&self, error: RemoteError) {
        self.state.lock().faults.subscriptions.push_back(error);
    }

    /// Calls received so far.
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Returns true if the zone exists.
    pub fn zone_exists(&self, zone: &ZoneId) -> bool {
        self.state.lock().zones.contains_key(zone)
    }

    /// Identifiers of the saved subscriptions.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    /// Live records of a zone.
    pub fn records(&self, zone: &ZoneId) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(zone)
            .map(|log| {
                log.records
                    .values()
                    .filter_map(|entry| entry.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Token describing the current state.
    pub fn current_token(&self) -> ChangeToken {
        token_for(self.state.lock().seq)
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn stream<E>(events: Vec<E>) -> EventStream<E> {
    let (tx, rx) = mpsc::unbounded_channel();
    for event in events {
        let _ = tx.send(event);
    }
    rx
}

impl CloudTransport for MemoryCloud {
    fn supports_subscriptions(&self) -> bool {
        self.supports_subscriptions
    }

    fn fetch_database_changes(
        &self,
        request: DatabaseChangesRequest,
    ) -> EventStream<DatabaseChangeEvent> {
        let mut state = self.state.lock();
        state.calls.database_fetches += 1;

        if let Some(error) = state.faults.database.pop_front() {
            return stream(vec![DatabaseChangeEvent::Completed {
                token: None,
                error: Some(error),
            }]);
        }
        let after = match CloudState::resume_point(request.since.as_ref(), state.database_min_valid)
        {
            Ok(after) => after,
            Err(error) => {
                return stream(vec![DatabaseChangeEvent::Completed {
                    token: None,
                    error: Some(error),
                }])
            }
        };

        let mut changes: Vec<_> = state
            .zone_changes
            .iter()
            .filter(|(_, (seq, _))| *seq > after)
            .map(|(zone, (seq, change))| (*seq, zone.clone(), *change))
            .collect();
        changes.sort_by_key(|(seq, _, _)| *seq);

        let mut events: Vec<_> = changes
            .into_iter()
            .map(|(_, zone, change)| match change {
                ZoneChange::Changed => DatabaseChangeEvent::ZoneChanged(zone),
                ZoneChange::Deleted => DatabaseChangeEvent::ZoneDeleted(zone),
            })
            .collect();
        events.push(DatabaseChangeEvent::Completed {
            token: Some(token_for(state.seq)),
            error: None,
        });
        stream(events)
    }

    fn fetch_zone_changes(&self, request: ZoneChangesRequest) -> EventStream<ZoneChangeEvent> {
        let mut state = self.state.lock();
        state.calls.zone_fetches += 1;

        if let Some(error) = state.faults.fetch.pop_front() {
            return stream(vec![ZoneChangeEvent::Completed { error: Some(error) }]);
        }

        let current = state.seq;
        let checkpoint_every = state.checkpoint_every;
        let mut events = Vec::new();
        let mut failures = Vec::new();

        for options in request.zones {
            let zone = options.zone_id;
            let injected = state
                .faults
                .zones
                .get_mut(&zone)
                .and_then(VecDeque::pop_front);

            let outcome = match (injected, state.zones.get(&zone)) {
                (Some(error), _) => Err(error),
                (None, None) => Err(RemoteError::ZoneNotFound),
                (None, Some(log)) => {
                    CloudState::resume_point(options.since.as_ref(), log.min_valid).map(|after| {
                        let fresh = options.since.is_none();
                        let mut entries: Vec<_> = log
                            .records
                            .iter()
                            .filter(|(_, entry)| entry.seq > after)
                            .filter(|(_, entry)| !(fresh && entry.record.is_none()))
                            .map(|(id, entry)| (id.clone(), entry.clone()))
                            .collect();
                        entries.sort_by_key(|(_, entry)| entry.seq);
                        entries
                    })
                }
            };

            match outcome {
                Ok(entries) => {
                    for (n, (record_id, entry)) in entries.into_iter().enumerate() {
                        let seq = entry.seq;
                        events.push(match entry.record {
                            Some(record) => ZoneChangeEvent::RecordChanged(record),
                            None => ZoneChangeEvent::RecordDeleted {
                                record_id,
                                record_type: Some(entry.record_type),
                                zone_id: zone.clone(),
                            },
                        });
                        if checkpoint_every.is_some_and(|every| (n + 1) % every == 0) {
                            events.push(ZoneChangeEvent::TokenCheckpoint {
                                zone_id: zone.clone(),
                                token: token_for(seq),
                            });
                        }
                    }
                    events.push(ZoneChangeEvent::ZoneCompleted {
                        zone_id: zone,
                        token: Some(token_for(current)),
                        error: None,
                    });
                }
                Err(error) => {
                    failures.push((zone.to_string(), error.clone()));
                    events.push(ZoneChangeEvent::ZoneCompleted {
                        zone_id: zone,
                        token: None,
                        error: Some(error),
                    });
                }
            }
        }

        let error = (!failures.is_empty()).then(|| RemoteError::partial(failures));
        events.push(ZoneChangeEvent::Completed { error });
        stream(events)
    }

    async fn create_zones(&self, request: ZonesRequest) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.zone_creations += 1;
        if let Some(error) = state.faults.create_zones.pop_front() {
            return Err(error);
        }
        for zone in &request.zones {
            state.ensure_zone(zone);
        }
        Ok(())
    }

    async fn save_subscriptions(
        &self,
        requests: Vec<SubscriptionRequest>,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.subscription_saves += 1;
        if let Some(error) = state.faults.subscriptions.pop_front() {
            return Err(error);
        }
        let missing: Vec<_> = requests
            .iter()
            .filter(|request| !state.zones.contains_key(&request.zone_id))
            .map(|request| (request.subscription_id.clone(), RemoteError::ZoneNotFound))
            .collect();
        if !missing.is_empty() {
            return Err(RemoteError::partial(missing));
        }
        for request in requests {
            state.subscriptions.insert(request.subscription_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudsync_protocol::{QualityOfService, ZoneFetchOptions};

    fn dog(id: &str) -> RemoteRecord {
        RemoteRecord::new("Dog", id, "DogZone", id.as_bytes().to_vec())
    }

    async fn drain<E>(mut events: EventStream<E>) -> Vec<E> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    fn zone_request(since: Option<ChangeToken>) -> ZoneChangesRequest {
        ZoneChangesRequest {
            zones: vec![ZoneFetchOptions {
                zone_id: ZoneId::new("DogZone"),
                since,
            }],
            fetch_all_changes: true,
            quality_of_service: QualityOfService::UserInitiated,
        }
    }

    #[test]
    fn tokens_encode_sequence_numbers() {
        assert_eq!(seq_of(&token_for(42)), Some(42));
        assert_eq!(seq_of(&ChangeToken::from_bytes(vec![1, 2])), None);
    }

    #[tokio::test]
    async fn fresh_fetch_skips_deleted_records() {
        let cloud = MemoryCloud::new();
        cloud.put(dog("rex"));
        cloud.put(dog("fido"));
        assert!(cloud.delete("DogZone", "fido"));
        assert!(!cloud.delete("DogZone", "ghost"));

        let events = drain(cloud.fetch_zone_changes(zone_request(None))).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ZoneChangeEvent::RecordChanged(dog("rex")));
        assert!(matches!(events[1], ZoneChangeEvent::ZoneCompleted { error: None, .. }));
        assert_eq!(events[2], ZoneChangeEvent::Completed { error: None });
    }

    #[tokio::test]
    async fn incremental_fetch_includes_deletions() {
        let cloud = MemoryCloud::new();
        cloud.put(dog("rex"));
        let token = cloud.current_token();
        cloud.put(dog("fido"));
        cloud.delete("DogZone", "rex");

        let events = drain(cloud.fetch_zone_changes(zone_request(Some(token)))).await;

        assert_eq!(events[0], ZoneChangeEvent::RecordChanged(dog("fido")));
        assert!(matches!(
            &events[1],
            ZoneChangeEvent::RecordDeleted { record_id, .. } if record_id.as_str() == "rex"
        ));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let cloud = MemoryCloud::new();
        cloud.put(dog("rex"));
        let token = cloud.current_token();
        cloud.expire_zone_tokens("DogZone");

        let events = drain(cloud.fetch_zone_changes(zone_request(Some(token)))).await;

        assert!(matches!(
            &events[0],
            ZoneChangeEvent::ZoneCompleted { error: Some(RemoteError::ChangeTokenExpired), .. }
        ));
        assert!(matches!(
            &events[1],
            ZoneChangeEvent::Completed { error: Some(RemoteError::PartialFailure { .. }) }
        ));
    }

    #[tokio::test]
    async fn database_changes_report_deleted_zones() {
        let cloud = MemoryCloud::new();
        cloud.create_zone("DogZone");
        cloud.create_zone("CatZone");
        let token = cloud.current_token();
        cloud.delete_zone("CatZone");
        cloud.put(dog("rex"));

        let events = drain(cloud.fetch_database_changes(DatabaseChangesRequest {
            since: Some(token),
            quality_of_service: QualityOfService::Utility,
        }))
        .await;

        assert_eq!(
            events[..2],
            [
                DatabaseChangeEvent::ZoneDeleted(ZoneId::new("CatZone")),
                DatabaseChangeEvent::ZoneChanged(ZoneId::new("DogZone")),
            ]
        );
        assert_eq!(cloud.calls().database_fetches, 1);
    }

    #[tokio::test]
    async fn checkpoints_follow_every_n_records() {
        let cloud = MemoryCloud::new().with_checkpoint_every(2);
        for id in ["a", "b", "c", "d"] {
            cloud.put(dog(id));
        }

        let events = drain(cloud.fetch_zone_changes(zone_request(None))).await;
        let checkpoints = events
            .iter()
            .filter(|event| matches!(event, ZoneChangeEvent::TokenCheckpoint { .. }))
            .count();
        assert_eq!(checkpoints, 2);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_once() {
        let cloud = MemoryCloud::new();
        cloud.fail_next_create_zones(RemoteError::QuotaExceeded);
        let request = ZonesRequest {
            zones: vec![ZoneId::new("DogZone")],
            quality_of_service: QualityOfService::UserInitiated,
        };

        assert_eq!(
            cloud.create_zones(request.clone()).await,
            Err(RemoteError::QuotaExceeded)
        );
        assert_eq!(cloud.create_zones(request).await, Ok(()));
        assert!(cloud.zone_exists(&ZoneId::new("DogZone")));
        assert_eq!(cloud.calls().zone_creations, 2);
    }
}
