//! Readers hammer a shared dataset while a reloader swaps it underneath them.
//!
//! Run with `RUST_LOG=resource_handle=debug cargo run --features demo --bin reload_under_load`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use resource_handle::{ManagerConfig, ResourceManager};
use tracing_subscriber::EnvFilter;

const NUM_READERS: usize = 8;
const NUM_RELOADS: u64 = 10;

/// Stand-in for a memory-mapped dataset.
struct Dataset {
    version: u64,
    rows: Vec<u64>,
}

impl Dataset {
    fn build(version: u64) -> Self {
        Self {
            version,
            rows: (0..100_000).map(|row| row ^ version).collect(),
        }
    }

    fn checksum(&self) -> u64 {
        self.rows.iter().fold(0, |acc, row| acc.wrapping_add(*row))
    }
}

fn unload(dataset: Dataset) {
    tracing::info!(version = dataset.version, rows = dataset.rows.len(), "dataset unloaded");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ManagerConfig::default().with_name("dataset");
    let manager = match ResourceManager::with_config(Dataset::build(0), unload, config) {
        Ok(manager) => Arc::new(manager),
        Err(rejected) => {
            eprintln!("failed to initialise: {}", rejected);
            std::process::exit(1);
        }
    };
    println!(
        "=== Reload under load: {} readers, {} reloads (lock-free slot: {}) ===",
        NUM_READERS,
        NUM_RELOADS,
        ResourceManager::<Dataset>::is_lock_free()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let lookups = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let readers: Vec<_> = (0..NUM_READERS)
        .map(|_| {
            let manager = manager.clone();
            let stop = stop.clone();
            let lookups = lookups.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let dataset = manager.acquire();
                    let index = lookups.fetch_add(1, Ordering::Relaxed) as usize % dataset.rows.len();
                    // Every row of a generation is encoded with that generation's version.
                    assert_eq!(dataset.rows[index] ^ dataset.version, index as u64);
                }
            })
        })
        .collect();

    for version in 1..=NUM_RELOADS {
        thread::sleep(Duration::from_millis(50));
        let dataset = Dataset::build(version);
        let checksum = dataset.checksum();
        match manager.replace(dataset) {
            Ok(id) => println!("reloaded generation {} (checksum {:#x})", id.generation(), checksum),
            Err(rejected) => eprintln!("reload {} failed: {}", version, rejected),
        }
    }

    stop.store(true, Ordering::Relaxed);
    let failed_readers = readers
        .into_iter()
        .map(|reader| reader.join())
        .filter(Result::is_err)
        .count();

    let stats = manager.stats();
    println!("Elapsed: {:?}", start.elapsed());
    println!("Lookups: {}", lookups.load(Ordering::Relaxed));
    println!(
        "Acquires: {}, releases: {}, replacements: {}, frees: {}, contended retries: {}",
        stats.acquires, stats.releases, stats.replacements, stats.frees, stats.contended_retries
    );

    if failed_readers > 0 {
        eprintln!("{} reader(s) observed a corrupted dataset", failed_readers);
        std::process::exit(1);
    }
}
