//! Catalog cache - cached routing table snapshots with explicit invalidation.
//!
//! The cache sits between the retry coordinator and the routing lookup
//! service. Lookups return the cached snapshot when one exists; a stale
//! version reported by a shard evicts the entry so the next lookup reloads
//! from the source. The refresh mechanism itself lives behind
//! [`RoutingSource`]; only its read interface and the invalidation triggers
//! are modeled here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gantry_core::{Namespace, RoutingVersion, ShardId};
use tracing::debug;

use crate::routing_table::RoutingTable;

/// The routing lookup service consumed by the cache.
///
/// Returns a fresh versioned snapshot for a namespace, or `None` when the
/// namespace does not exist.
#[async_trait]
pub trait RoutingSource: Send + Sync + 'static {
    /// Loads the current routing table for a namespace.
    async fn load(&self, namespace: &Namespace) -> Option<RoutingTable>;
}

/// Cache of per-namespace routing table snapshots.
pub struct CatalogCache {
    source: Arc<dyn RoutingSource>,
    entries: Mutex<HashMap<Namespace, Arc<RoutingTable>>>,
}

impl CatalogCache {
    /// Creates a cache over the given lookup source.
    #[must_use]
    pub fn new(source: Arc<dyn RoutingSource>) -> Self {
        Self {
            source,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a snapshot for the namespace, loading it on a cache miss.
    ///
    /// `None` means the namespace does not exist, which callers treat as an
    /// empty result set rather than an error.
    pub async fn snapshot(&self, namespace: &Namespace) -> Option<Arc<RoutingTable>> {
        if let Some(cached) = self.entries.lock().expect("catalog lock").get(namespace) {
            return Some(Arc::clone(cached));
        }

        let loaded = self.source.load(namespace).await?;
        let table = Arc::new(loaded);
        self.entries
            .lock()
            .expect("catalog lock")
            .insert(namespace.clone(), Arc::clone(&table));
        Some(table)
    }

    /// Invalidates every cached entry for a database.
    ///
    /// Called when a shard reports a stale database version.
    pub fn invalidate_database(&self, db: &str) {
        let mut entries = self.entries.lock().expect("catalog lock");
        let before = entries.len();
        entries.retain(|namespace, _| namespace.db() != db);
        debug!(db, evicted = before - entries.len(), "invalidated database routing entries");
    }

    /// Invalidates a collection entry after a shard reported a stale shard
    /// version.
    ///
    /// The stale version and shard identify which disagreement triggered the
    /// eviction; the whole entry is evicted either way, so a later lookup
    /// reloads a coherent snapshot.
    pub fn invalidate_shard(
        &self,
        namespace: &Namespace,
        wanted: RoutingVersion,
        shard: ShardId,
    ) {
        self.entries.lock().expect("catalog lock").remove(namespace);
        debug!(namespace = %namespace, wanted = %wanted, shard = %shard, "invalidated collection routing entry");
    }

    /// Invalidates a collection entry with no extra targeting information.
    pub fn invalidate_collection(&self, namespace: &Namespace) {
        self.entries.lock().expect("catalog lock").remove(namespace);
        debug!(namespace = %namespace, "invalidated collection routing entry");
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("catalog lock").len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
