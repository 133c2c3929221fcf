//! Remote records and change records.

use crate::ids::{RecordId, ZoneId};
use serde::{Deserialize, Serialize};

/// A record as it exists in the remote store.
///
/// The payload is whatever the owning collaborator serialized; the engine
/// never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Declared record type, used to route the record to a collaborator.
    pub record_type: String,
    /// Record identifier.
    pub record_id: RecordId,
    /// Zone that owns the record.
    pub zone_id: ZoneId,
    /// Opaque record payload.
    pub payload: Vec<u8>,
}

impl RemoteRecord {
    /// Creates a remote record.
    pub fn new(
        record_type: impl Into<String>,
        record_id: impl Into<RecordId>,
        zone_id: impl Into<ZoneId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            zone_id: zone_id.into(),
            payload,
        }
    }
}

/// A remote-originated mutation.
///
/// Change records are consumed by a collaborator as soon as they are
/// delivered; the engine never buffers them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRecord {
    /// The record was created or updated.
    Upsert(RemoteRecord),
    /// The record was deleted.
    Tombstone {
        /// Deleted record.
        record_id: RecordId,
        /// Zone the record belonged to.
        zone_id: ZoneId,
    },
}

impl ChangeRecord {
    /// Returns the affected record id.
    pub fn record_id(&self) -> &RecordId {
        match self {
            ChangeRecord::Upsert(record) => &record.record_id,
            ChangeRecord::Tombstone { record_id, .. } => record_id,
        }
    }

    /// Returns the owning zone.
    pub fn zone_id(&self) -> &ZoneId {
        match self {
            ChangeRecord::Upsert(record) => &record.zone_id,
            ChangeRecord::Tombstone { zone_id, .. } => zone_id,
        }
    }

    /// Returns true for tombstones.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, ChangeRecord::Tombstone { .. })
    }
}
