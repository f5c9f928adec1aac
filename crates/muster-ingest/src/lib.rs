//! Ingestion pipeline: the log tailer and the pane watcher discover raw
//! input, run it through normalization and enrichment, fold it into durable
//! job/agent state, and hand the enriched events to the broadcast sink.

pub mod reconcile;
pub mod tailer;
pub mod tmux;
pub mod watcher;

use muster_storage::StatusStore;
use std::sync::{Arc, Mutex};

/// Store handle shared by both pollers and the read API. The underlying
/// connection is not Sync, so every persistence call goes through this
/// one mutex.
pub type SharedStore = Arc<Mutex<StatusStore>>;

pub fn shared_store(store: StatusStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
