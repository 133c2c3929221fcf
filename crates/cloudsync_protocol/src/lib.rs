//! # CloudSync Protocol
//!
//! Remote change-feed protocol types for CloudSync.
//!
//! This crate provides:
//! - `ZoneId`, `RecordId` and the opaque `ChangeToken` cursor
//! - `RemoteRecord` / `ChangeRecord` for remote mutations
//! - `RemoteError` for the failures a transport reports
//! - Fetch requests and the event streams emitted while they run
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ids;
mod messages;
mod record;

pub use error::{PartialFailureItem, RemoteError};
pub use ids::{ChangeToken, RecordId, ZoneId};
pub use messages::{
    DatabaseChangeEvent, DatabaseChangesRequest, QualityOfService, SubscriptionRequest,
    ZoneChangeEvent, ZoneChangesRequest, ZoneFetchOptions, ZonesRequest,
};
pub use record::{ChangeRecord, RemoteRecord};
