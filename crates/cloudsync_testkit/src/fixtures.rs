//! Test fixtures and engine helpers.
//!
//! Provides ready-made engines wired to a [`MemoryCloud`] and one
//! [`MemorySyncObject`] per scope.

use crate::cloud::MemoryCloud;
use cloudsync_engine::{
    CloudSync, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, MemorySyncObject,
    SyncConfig, SyncObject,
};
use cloudsync_protocol::{RemoteRecord, ZoneId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// The scopes most tests use: `(zone, record type)`.
pub const PET_SCOPES: &[(&str, &str)] = &[("DogZone", "Dog"), ("CatZone", "Cat")];

/// A test engine with automatic cleanup.
pub struct TestEngine {
    /// The engine under test.
    pub engine: CloudSync<MemoryCloud>,
    /// The remote side.
    pub cloud: Arc<MemoryCloud>,
    /// The token store backing the engine.
    pub store: Arc<dyn KeyValueStore>,
    /// One collaborator per scope, in registration order.
    pub objects: Vec<Arc<MemorySyncObject>>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an engine with in-memory tokens for the given scopes.
    pub fn memory(scopes: &[(&str, &str)]) -> Self {
        Self::open(
            test_config(),
            Arc::new(MemoryCloud::new()),
            Arc::new(MemoryKeyValueStore::new()),
            scopes,
        )
    }

    /// Creates an engine whose tokens live in a temporary file.
    pub fn file(scopes: &[(&str, &str)]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileKeyValueStore::open(temp_dir.path().join("tokens.cbor"))
            .expect("Failed to open token store");
        let mut engine = Self::open(
            test_config(),
            Arc::new(MemoryCloud::new()),
            Arc::new(store),
            scopes,
        );
        engine._temp_dir = Some(temp_dir);
        engine
    }

    /// Creates an engine over existing parts.
    pub fn open(
        config: SyncConfig,
        cloud: Arc<MemoryCloud>,
        store: Arc<dyn KeyValueStore>,
        scopes: &[(&str, &str)],
    ) -> Self {
        let objects: Vec<_> = scopes
            .iter()
            .map(|(zone, record_type)| Arc::new(MemorySyncObject::new(*zone, *record_type)))
            .collect();
        let engine = CloudSync::new(
            config,
            Arc::clone(&cloud),
            Arc::clone(&store),
            objects
                .iter()
                .map(|object| Arc::clone(object) as Arc<dyn SyncObject>)
                .collect(),
        )
        .expect("Failed to create engine");

        Self {
            engine,
            cloud,
            store,
            objects,
            _temp_dir: None,
        }
    }

    /// Directory holding the token file, if file-based.
    pub fn dir(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(|d| d.path())
    }

    /// Path of the token file, if file-based.
    pub fn token_path(&self) -> Option<PathBuf> {
        self.dir().map(|d| d.join("tokens.cbor"))
    }

    /// The collaborator owning `zone`.
    pub fn object(&self, zone: &str) -> &Arc<MemorySyncObject> {
        let zone = ZoneId::new(zone);
        self.objects
            .iter()
            .find(|object| object.zone_id() == zone)
            .expect("No collaborator for zone")
    }

    /// Total upserts and tombstones applied across all collaborators.
    pub fn total_applies(&self) -> usize {
        self.objects.iter().map(|object| object.apply_count()).sum()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = CloudSync<MemoryCloud>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Configuration with short delays, suitable for tests.
pub fn test_config() -> SyncConfig {
    SyncConfig::new("test")
        .with_notification_window(Duration::from_millis(200))
        .with_retry(cloudsync_engine::RetryConfig::new(Duration::from_millis(10)))
}

/// Creates a record with a UTF-8 payload.
pub fn record(record_type: &str, record_id: &str, zone: &str, payload: &str) -> RemoteRecord {
    RemoteRecord::new(record_type, record_id, zone, payload.as_bytes().to_vec())
}

/// Creates `count` records named `<prefix>-<n>` in `zone`.
pub fn records(record_type: &str, zone: &str, prefix: &str, count: usize) -> Vec<RemoteRecord> {
    (0..count)
        .map(|n| {
            let id = format!("{prefix}-{n}");
            record(record_type, &id, zone, &format!("payload {n}"))
        })
        .collect()
}
