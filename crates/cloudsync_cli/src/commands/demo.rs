//! Demo command implementation.

use cloudsync_engine::{
    CloudSync, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, MemorySyncObject,
    SyncConfig, SyncObject,
};
use cloudsync_testkit::{records, MemoryCloud};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Runs the demo command.
///
/// Fills an in-memory cloud with `zones` zones of `records` records each,
/// then provisions and fetches everything.
pub fn run(
    zones: usize,
    records_per_zone: usize,
    store: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_cycle(zones, records_per_zone, store))
}

async fn run_cycle(
    zones: usize,
    records_per_zone: usize,
    store: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn KeyValueStore> = match store {
        Some(path) => Arc::new(FileKeyValueStore::open(path)?),
        None => Arc::new(MemoryKeyValueStore::new()),
    };

    let cloud = Arc::new(MemoryCloud::new());
    let mut objects = Vec::with_capacity(zones);
    for n in 0..zones {
        let zone = format!("Zone{n}");
        let record_type = format!("Type{n}");
        for record in records(&record_type, &zone, "record", records_per_zone) {
            cloud.put(record);
        }
        objects.push(Arc::new(MemorySyncObject::new(zone.as_str(), record_type)));
    }

    let engine = CloudSync::new(
        SyncConfig::new("demo"),
        Arc::clone(&cloud),
        store,
        objects
            .iter()
            .map(|object| Arc::clone(object) as Arc<dyn SyncObject>)
            .collect(),
    )?;

    let started = Instant::now();
    engine.prepare().await?;
    let summary = engine.fetch_changes().await?;
    let elapsed = started.elapsed();

    println!("CloudSync Demo");
    println!("==============");
    println!();
    println!("Zones:              {}", zones);
    println!("Changed zones:      {}", summary.changed_zones);
    println!("Records applied:    {}", summary.records_applied);
    println!("Tombstones applied: {}", summary.tombstones_applied);
    println!("Fetch passes:       {}", summary.passes);
    println!("Remote calls:       {:?}", cloud.calls());
    println!("Elapsed:            {:.1?}", elapsed);
    println!();
    for object in &objects {
        println!(
            "  {:<12} {} record(s)",
            object.zone_id().to_string(),
            object.records().len()
        );
    }

    engine.shutdown();
    Ok(())
}
