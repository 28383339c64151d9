//! TTL cache for resolved secrets.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Resolved-secret cache keyed by sentinel signature. Entries expire after
/// `ttl` on read, and the whole cache is wiped every `ttl` plus a random
/// jitter of up to a minute to bound staleness across the fleet.
#[derive(Clone)]
pub struct SecretCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SecretCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, signature: &str) -> Option<Value> {
        let entry = self.entries.get(signature)?;
        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(signature);
            None
        }
    }

    pub fn put(&self, signature: String, value: Value) {
        self.entries.insert(
            signature,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Start the periodic wipe. Must be called within a Tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let entries = self.entries.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            loop {
                let jitter = Duration::from_millis(fastrand::u64(0..60_000));
                tokio::time::sleep(ttl + jitter).await;
                let wiped = entries.len();
                entries.clear();
                debug!(wiped, "secret cache wiped");
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
