//! Registered local collaborators and their sync scopes.

use crate::error::{SyncError, SyncResult};
use cloudsync_protocol::{RecordId, RemoteRecord, ZoneId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A local store adapter for one synchronizable object type.
///
/// The engine calls into collaborators; collaborators never call back into
/// the engine. Change tokens are persisted eagerly, so the same record may
/// be delivered more than once after a crash: `apply_upsert` and
/// `apply_tombstone` must be idempotent.
pub trait SyncObject: Send + Sync {
    /// Zone holding this object type's records.
    fn zone_id(&self) -> ZoneId;

    /// Record type used to route upserts to this collaborator.
    fn record_type(&self) -> String;

    /// Inserts or updates a record received from the remote store.
    fn apply_upsert(&self, record: &RemoteRecord) -> SyncResult<()>;

    /// Deletes a record removed on the remote side.
    fn apply_tombstone(&self, record_id: &RecordId) -> SyncResult<()>;

    /// Links records that referenced not-yet-seen records.
    ///
    /// Called once per fetch pass, after every record of the pass was
    /// delivered.
    fn resolve_pending_relationships(&self);

    /// Pushes local changes that have not reached the remote store yet.
    ///
    /// Runs on a blocking thread; it may take as long as it needs.
    fn push_pending_local_changes(&self) -> SyncResult<()>;
}

/// Provisioning state of a scope's remote zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// The zone has not been created by this process.
    NotProvisioned,
    /// A create request is in flight.
    CreatePending,
    /// The zone exists.
    Ready,
}

/// Provisioning state of a scope's change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription is known to exist.
    Absent,
    /// A save request is in flight.
    Pending,
    /// The subscription exists.
    Active,
}

/// One synchronizable object type.
#[derive(Debug)]
pub struct SyncScope {
    zone_id: ZoneId,
    record_type: String,
    zone_state: RwLock<ZoneState>,
    subscription_state: RwLock<SubscriptionState>,
}

impl SyncScope {
    /// Creates an unprovisioned scope.
    pub fn new(zone_id: ZoneId, record_type: impl Into<String>) -> Self {
        Self {
            zone_id,
            record_type: record_type.into(),
            zone_state: RwLock::new(ZoneState::NotProvisioned),
            subscription_state: RwLock::new(SubscriptionState::Absent),
        }
    }

    /// Zone identifier.
    pub fn zone_id(&self) -> &ZoneId {
        &self.zone_id
    }

    /// Record type tag.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Current zone state.
    pub fn zone_state(&self) -> ZoneState {
        *self.zone_state.read()
    }

    /// Returns true once the remote zone exists.
    pub fn is_zone_provisioned(&self) -> bool {
        self.zone_state() == ZoneState::Ready
    }

    pub(crate) fn set_zone_state(&self, state: ZoneState) {
        *self.zone_state.write() = state;
    }

    /// Current subscription state.
    pub fn subscription_state(&self) -> SubscriptionState {
        *self.subscription_state.read()
    }

    /// Returns true once the subscription exists.
    pub fn is_subscription_provisioned(&self) -> bool {
        self.subscription_state() == SubscriptionState::Active
    }

    pub(crate) fn set_subscription_state(&self, state: SubscriptionState) {
        *self.subscription_state.write() = state;
    }
}

/// A collaborator together with its scope.
pub struct RegisteredObject {
    scope: SyncScope,
    object: Arc<dyn SyncObject>,
}

impl RegisteredObject {
    /// The object's scope.
    pub fn scope(&self) -> &SyncScope {
        &self.scope
    }

    /// The collaborator.
    pub fn object(&self) -> &Arc<dyn SyncObject> {
        &self.object
    }
}

impl fmt::Debug for RegisteredObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredObject")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// The fixed set of collaborators supplied at construction.
#[derive(Debug)]
pub struct SyncObjectRegistry {
    entries: Vec<RegisteredObject>,
}

impl SyncObjectRegistry {
    /// Registers collaborators, one scope each.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistration` if two collaborators share a zone or a
    /// record type.
    pub fn new(objects: Vec<Arc<dyn SyncObject>>) -> SyncResult<Self> {
        let mut zones = HashSet::new();
        let mut record_types = HashSet::new();
        let mut entries = Vec::with_capacity(objects.len());

        for object in objects {
            let zone_id = object.zone_id();
            let record_type = object.record_type();
            if !zones.insert(zone_id.clone()) {
                return Err(SyncError::InvalidRegistration(format!(
                    "zone {zone_id} registered twice"
                )));
            }
            if !record_types.insert(record_type.clone()) {
                return Err(SyncError::InvalidRegistration(format!(
                    "record type {record_type} registered twice"
                )));
            }
            entries.push(RegisteredObject {
                scope: SyncScope::new(zone_id, record_type),
                object,
            });
        }

        Ok(Self { entries })
    }

    /// Iterates over registered objects in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredObject> {
        self.entries.iter()
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the collaborator for a record type.
    pub fn by_record_type(&self, record_type: &str) -> Option<&RegisteredObject> {
        self.entries
            .iter()
            .find(|entry| entry.scope.record_type == record_type)
    }

    /// Finds the collaborator owning a zone.
    pub fn by_zone(&self, zone_id: &ZoneId) -> Option<&RegisteredObject> {
        self.entries
            .iter()
            .find(|entry| &entry.scope.zone_id == zone_id)
    }

    /// Zone identifiers in registration order.
    pub fn zone_ids(&self) -> Vec<ZoneId> {
        self.entries
            .iter()
            .map(|entry| entry.scope.zone_id.clone())
            .collect()
    }
}

/// A call received by a [`MemorySyncObject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectCall {
    /// `apply_upsert` for a record.
    Upsert(RecordId),
    /// `apply_tombstone` for a record.
    Tombstone(RecordId),
    /// `resolve_pending_relationships`.
    ResolveRelationships,
    /// `push_pending_local_changes`.
    PushPending,
}

/// An in-memory collaborator for testing.
///
/// Keeps the latest version of every record and a log of every call.
pub struct MemorySyncObject {
    zone_id: ZoneId,
    record_type: String,
    records: RwLock<BTreeMap<RecordId, RemoteRecord>>,
    calls: RwLock<Vec<ObjectCall>>,
    pending_local: RwLock<Vec<RecordId>>,
    fail_applies: RwLock<bool>,
}

impl MemorySyncObject {
    /// Creates an empty collaborator.
    pub fn new(zone_id: impl Into<ZoneId>, record_type: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            record_type: record_type.into(),
            records: RwLock::new(BTreeMap::new()),
            calls: RwLock::new(Vec::new()),
            pending_local: RwLock::new(Vec::new()),
            fail_applies: RwLock::new(false),
        }
    }

    /// Current records.
    pub fn records(&self) -> Vec<RemoteRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Returns the stored version of a record.
    pub fn record(&self, record_id: &RecordId) -> Option<RemoteRecord> {
        self.records.read().get(record_id).cloned()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<ObjectCall> {
        self.calls.read().clone()
    }

    /// Number of `apply_upsert` and `apply_tombstone` calls.
    pub fn apply_count(&self) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|call| matches!(call, ObjectCall::Upsert(_) | ObjectCall::Tombstone(_)))
            .count()
    }

    /// Number of `resolve_pending_relationships` calls.
    pub fn resolve_count(&self) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|call| **call == ObjectCall::ResolveRelationships)
            .count()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.calls.write().clear();
    }

    /// Queues a local change for the next push.
    pub fn add_pending_local(&self, record_id: impl Into<RecordId>) {
        self.pending_local.write().push(record_id.into());
    }

    /// Local changes not pushed yet.
    pub fn pending_local(&self) -> Vec<RecordId> {
        self.pending_local.read().clone()
    }

    /// Makes subsequent applies fail until reset.
    pub fn set_fail_applies(&self, fail: bool) {
        *self.fail_applies.write() = fail;
    }

    fn check_failure(&self) -> SyncResult<()> {
        if *self.fail_applies.read() {
            Err(SyncError::apply(&self.zone_id, "injected apply failure"))
        } else {
            Ok(())
        }
    }
}

impl SyncObject for MemorySyncObject {
    fn zone_id(&self) -> ZoneId {
        self.zone_id.clone()
    }

    fn record_type(&self) -> String {
        self.record_type.clone()
    }

    fn apply_upsert(&self, record: &RemoteRecord) -> SyncResult<()> {
        self.check_failure()?;
        self.calls
            .write()
            .push(ObjectCall::Upsert(record.record_id.clone()));
        self.records
            .write()
            .insert(record.record_id.clone(), record.clone());
        Ok(())
    }

    fn apply_tombstone(&self, record_id: &RecordId) -> SyncResult<()> {
        self.check_failure()?;
        self.calls
            .write()
            .push(ObjectCall::Tombstone(record_id.clone()));
        self.records.write().remove(record_id);
        Ok(())
    }

    fn resolve_pending_relationships(&self) {
        self.calls.write().push(ObjectCall::ResolveRelationships);
    }

    fn push_pending_local_changes(&self) -> SyncResult<()> {
        self.calls.write().push(ObjectCall::PushPending);
        self.pending_local.write().clear();
        Ok(())
    }
}
