//! # CloudSync Engine
//!
//! Keeps local collaborators in sync with a remote, zone-partitioned
//! record store.
//!
//! This crate provides:
//! - Durable change tokens per database and per zone
//! - Failure classification (retry, recover, give up)
//! - Idempotent zone and subscription provisioning
//! - Database-level and zone-level change fetching
//! - Coalescing of remote-change notifications
//! - A transport abstraction with a scripted mock
//!
//! ## Architecture
//!
//! A fetch cycle is **database first, then zones**:
//! 1. Ask which zones changed since the database token
//! 2. Stream record changes of every registered zone since its own token
//! 3. Route each change to the collaborator owning its record type or zone
//! 4. Once the stream completes, let every collaborator resolve
//!    relationships between the records it received
//!
//! ## Key Invariants
//!
//! - Tokens are persisted as soon as the remote store hands them out
//! - A zone's token never advances past a change its collaborator failed
//!   to apply
//! - At most one fetch cycle runs at a time
//! - Callers see one terminal outcome per cycle; retries and expired
//!   tokens are handled internally

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod classify;
mod config;
mod context;
mod database;
mod engine;
mod error;
mod lifecycle;
mod registry;
mod store;
mod throttle;
mod tokens;
mod transport;
mod zone;

pub use classify::{classify, Classifier, FetchOutcome, RecoveryReason};
pub use config::{RetryConfig, SyncConfig};
pub use context::{SyncState, SyncStats};
pub use engine::CloudSync;
pub use error::{SyncError, SyncResult};
pub use registry::{
    MemorySyncObject, ObjectCall, RegisteredObject, SubscriptionState, SyncObject,
    SyncObjectRegistry, SyncScope, ZoneState,
};
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use tokens::{ChangeTokenStore, TokenScope};
pub use transport::{CloudTransport, EventStream, MockTransport};
pub use zone::FetchSummary;
