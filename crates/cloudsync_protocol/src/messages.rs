//! Fetch requests and the events a transport streams while serving them.

use crate::error::RemoteError;
use crate::ids::{ChangeToken, RecordId, ZoneId};
use crate::record::RemoteRecord;
use serde::{Deserialize, Serialize};

/// Scheduling priority requested from the transport.
///
/// Low priorities let the platform defer requests indefinitely while
/// offline. The engine asks for `UserInitiated` by default so that
/// connectivity problems come back as errors it can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QualityOfService {
    /// Deferrable background work.
    Background,
    /// Long-running work the user is not waiting on.
    Utility,
    /// Work the user is waiting on.
    #[default]
    UserInitiated,
}

/// "Which zones changed since this token?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseChangesRequest {
    /// Database-level token, `None` to list every zone.
    pub since: Option<ChangeToken>,
    /// Requested priority.
    pub quality_of_service: QualityOfService,
}

/// Per-zone parameters of a [`ZoneChangesRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneFetchOptions {
    /// Zone to fetch.
    pub zone_id: ZoneId,
    /// Zone-level token, `None` to fetch every record.
    pub since: Option<ChangeToken>,
}

/// "Send me every record change in these zones."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneChangesRequest {
    /// Zones with their resumption tokens.
    pub zones: Vec<ZoneFetchOptions>,
    /// Keep paging until every pending change is delivered.
    pub fetch_all_changes: bool,
    /// Requested priority.
    pub quality_of_service: QualityOfService,
}

/// Batched zone creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonesRequest {
    /// Zones to create. Creating an existing zone succeeds.
    pub zones: Vec<ZoneId>,
    /// Requested priority.
    pub quality_of_service: QualityOfService,
}

/// Change-notification subscription for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Stable subscription identifier.
    pub subscription_id: String,
    /// Zone whose changes trigger notifications.
    pub zone_id: ZoneId,
    /// Deliver silent (content-available) pushes only.
    pub silent: bool,
    /// Requested priority.
    pub quality_of_service: QualityOfService,
}

impl SubscriptionRequest {
    /// Subscription identifier used for a zone.
    pub fn id_for_zone(zone_id: &ZoneId) -> String {
        format!("{zone_id}.subscription")
    }

    /// Creates a silent subscription request for a zone.
    pub fn silent_for_zone(zone_id: ZoneId, quality_of_service: QualityOfService) -> Self {
        Self {
            subscription_id: Self::id_for_zone(&zone_id),
            zone_id,
            silent: true,
            quality_of_service,
        }
    }
}

/// Events streamed while serving a [`DatabaseChangesRequest`].
///
/// A well-behaved stream ends with exactly one `Completed`.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseChangeEvent {
    /// A zone has changes since the request token.
    ZoneChanged(ZoneId),
    /// A zone was deleted.
    ZoneDeleted(ZoneId),
    /// A zone was purged (deleted together with its history).
    ZonePurged(ZoneId),
    /// Intermediate cursor; safe to persist immediately.
    TokenCheckpoint(ChangeToken),
    /// The operation finished.
    Completed {
        /// Final database-level token.
        token: Option<ChangeToken>,
        /// Terminal error, `None` on success.
        error: Option<RemoteError>,
    },
}

/// Events streamed while serving a [`ZoneChangesRequest`].
///
/// Events for different zones may interleave arbitrarily; events for one
/// zone arrive in feed order. A well-behaved stream sends one
/// `ZoneCompleted` per requested zone and ends with exactly one `Completed`.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneChangeEvent {
    /// Intermediate zone cursor; safe to persist immediately.
    TokenCheckpoint {
        /// Zone the token belongs to.
        zone_id: ZoneId,
        /// New zone-level token.
        token: ChangeToken,
    },
    /// A record was created or updated.
    RecordChanged(RemoteRecord),
    /// A record was deleted.
    RecordDeleted {
        /// Deleted record.
        record_id: RecordId,
        /// Record type, when the service reports it.
        record_type: Option<String>,
        /// Zone the record belonged to.
        zone_id: ZoneId,
    },
    /// All changes of one zone were delivered (or the zone failed).
    ZoneCompleted {
        /// Completed zone.
        zone_id: ZoneId,
        /// Final zone-level token.
        token: Option<ChangeToken>,
        /// Zone-scoped error, `None` on success.
        error: Option<RemoteError>,
    },
    /// The whole multi-zone operation finished.
    Completed {
        /// Overall error, `None` on success.
        error: Option<RemoteError>,
    },
}

impl ZoneChangeEvent {
    /// Returns the zone this event belongs to, if it is zone-scoped.
    pub fn zone_id(&self) -> Option<&ZoneId> {
        match self {
            ZoneChangeEvent::TokenCheckpoint { zone_id, .. }
            | ZoneChangeEvent::RecordDeleted { zone_id, .. }
            | ZoneChangeEvent::ZoneCompleted { zone_id, .. } => Some(zone_id),
            ZoneChangeEvent::RecordChanged(record) => Some(&record.zone_id),
            ZoneChangeEvent::Completed { .. } => None,
        }
    }
}
