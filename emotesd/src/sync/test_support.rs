use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use sqlx::sqlite::SqlitePoolOptions;

use super::gate::{CapabilityGate, NetworkInfo, NetworkMonitor, StorageSwitch};
use super::index::IndexStore;

pub async fn make_store() -> IndexStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

pub fn open_gate() -> CapabilityGate {
    CapabilityGate::new(
        Arc::new(NetworkMonitor::new(NetworkInfo {
            connected: true,
            on_wifi: true,
        })),
        Arc::new(StorageSwitch::new(true)),
        true,
    )
}

pub fn gzip(value: serde_json::Value) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(value.to_string().as_bytes()).unwrap();
    encoder.finish().unwrap()
}
