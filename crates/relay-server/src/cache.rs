//! Per-connection last-known-value caches for selection and variable data.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use relay_core::ClientId;

/// The most recent payload reported by one connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub client_id: ClientId,
    pub captured_at: DateTime<Utc>,
    pub payload: Value,
    pub count: usize,
    /// Store order, breaks timestamp ties.
    #[serde(skip)]
    seq: u64,
}

/// One snapshot per connection; reads pick the newest across connections.
pub struct SnapshotCache {
    name: &'static str,
    entries: DashMap<ClientId, Snapshot>,
    seq: AtomicU64,
}

impl SnapshotCache {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Replace `client`'s snapshot, stamped now.
    pub fn store(&self, client: &ClientId, payload: Value, count: usize) {
        self.store_at(client, payload, count, Utc::now());
    }

    pub fn store_at(
        &self,
        client: &ClientId,
        payload: Value,
        count: usize,
        captured_at: DateTime<Utc>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.entries.insert(
            client.clone(),
            Snapshot {
                client_id: client.clone(),
                captured_at,
                payload,
                count,
                seq,
            },
        );
        tracing::debug!(cache = self.name, client_id = %client, count, "snapshot stored");
    }

    /// Newest snapshot across all connections, or `None` when empty.
    pub fn latest(&self) -> Option<Snapshot> {
        self.entries
            .iter()
            .max_by_key(|e| (e.captured_at, e.seq))
            .map(|e| e.value().clone())
    }

    /// Every snapshot, newest first.
    pub fn all(&self) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self.entries.iter().map(|e| e.value().clone()).collect();
        snapshots.sort_by(|a, b| (b.captured_at, b.seq).cmp(&(a.captured_at, a.seq)));
        snapshots
    }

    pub fn evict(&self, client: &ClientId) -> bool {
        self.entries.remove(client).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The selection and variables caches, evicted together on disconnect.
pub struct DataCaches {
    pub selection: SnapshotCache,
    pub variables: SnapshotCache,
}

impl DataCaches {
    pub fn new() -> Self {
        Self {
            selection: SnapshotCache::new("selection"),
            variables: SnapshotCache::new("variables"),
        }
    }

    pub fn evict_client(&self, client: &ClientId) {
        let selection = self.selection.evict(client);
        let variables = self.variables.evict(client);
        if selection || variables {
            tracing::debug!(client_id = %client, selection, variables, "evicted cached data");
        }
    }
}

impl Default for DataCaches {
    fn default() -> Self {
        Self::new()
    }
}
