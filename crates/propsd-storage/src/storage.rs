//! Layered property storage with debounced rebuilds.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use propsd_common::properties;
use propsd_secrets::SecretTransformer;
use propsd_sources::{Source, SourceEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors from storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Source {kind}/{name} is already registered")]
    Duplicate { kind: String, name: String },
}

/// Notification carrying a freshly built, secret-resolved property tree.
#[derive(Debug, Clone)]
pub struct BuildEvent {
    /// Monotonic build counter
    pub build: u64,
    pub properties: Arc<Value>,
}

/// One source's line in the aggregate health report.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ok: bool,
}

/// Aggregate health across all registered sources.
#[derive(Debug, Clone, Serialize)]
pub struct StorageHealth {
    pub ok: bool,
    pub sources: Vec<SourceSummary>,
    pub code: u16,
}

struct StorageInner {
    /// Active sources in merge order; later sources win at leaf collisions
    sources: RwLock<Vec<Arc<dyn Source>>>,
    /// Event-forwarding tasks keyed like their source
    forwarders: Mutex<HashMap<(String, String), JoinHandle<()>>>,
    properties: ArcSwap<Value>,
    transformer: SecretTransformer,
    hold_down: Duration,
    events: broadcast::Sender<BuildEvent>,
    dirty: AtomicBool,
    signal: Notify,
    builds: AtomicU64,
}

/// Holds the ordered list of active sources and the merged, secret-resolved
/// property tree. Rebuilds are debounced by a hold-down window and are
/// single-flight: updates landing mid-build coalesce into one follow-up.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Create the storage and start its builder task. Must be called within
    /// a Tokio runtime.
    pub fn new(transformer: SecretTransformer, hold_down: Duration) -> Self {
        let (events, _) = broadcast::channel(16);
        let inner = Arc::new(StorageInner {
            sources: RwLock::new(Vec::new()),
            forwarders: Mutex::new(HashMap::new()),
            properties: ArcSwap::from_pointee(properties::empty()),
            transformer,
            hold_down,
            events,
            dirty: AtomicBool::new(false),
            signal: Notify::new(),
            builds: AtomicU64::new(0),
        });

        tokio::spawn(run_builder(inner.clone()));
        Self { inner }
    }

    /// Append a source and subscribe to its update and error channels.
    /// A duplicate `(type, name)` is rejected.
    pub fn register(&self, source: Arc<dyn Source>) -> Result<(), StorageError> {
        let key = (source.kind().to_string(), source.name().to_string());
        {
            let mut sources = self.inner.sources.write();
            if sources
                .iter()
                .any(|s| s.kind() == key.0 && s.name() == key.1)
            {
                return Err(StorageError::Duplicate {
                    kind: key.0,
                    name: key.1,
                });
            }
            sources.push(source.clone());
        }

        let mut events = source.subscribe();
        let inner = self.inner.clone();
        let (kind, name) = key.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SourceEvent::Update) => inner.mark_dirty(),
                    Ok(SourceEvent::Error(err)) => {
                        warn!(source = %name, kind = %kind, error = %err, "source error")
                    }
                    Ok(SourceEvent::Shutdown) => break,
                    Ok(_) => {}
                    // Missed events may include an update
                    Err(broadcast::error::RecvError::Lagged(_)) => inner.mark_dirty(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.forwarders.lock().insert(key, handle);
        Ok(())
    }

    /// Remove a source from the layer list and detach its forwarder. The
    /// source itself is returned for the caller to shut down.
    pub fn unregister(&self, kind: &str, name: &str) -> Option<Arc<dyn Source>> {
        let removed = {
            let mut sources = self.inner.sources.write();
            let position = sources
                .iter()
                .position(|s| s.kind() == kind && s.name() == name)?;
            sources.remove(position)
        };
        if let Some(handle) = self
            .inner
            .forwarders
            .lock()
            .remove(&(kind.to_string(), name.to_string()))
        {
            handle.abort();
        }
        Some(removed)
    }

    /// Reorder the layer list to match `keys`; sources not named keep their
    /// current relative order ahead of the named ones.
    pub fn update_order(&self, keys: &[(String, String)]) {
        let mut sources = self.inner.sources.write();
        let mut ordered = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            if !keys
                .iter()
                .any(|(kind, name)| source.kind() == kind && source.name() == name)
            {
                ordered.push(source.clone());
            }
        }
        for (kind, name) in keys {
            if let Some(source) = sources
                .iter()
                .find(|s| s.kind() == kind && s.name() == name)
            {
                ordered.push(source.clone());
            }
        }
        *sources = ordered;
    }

    /// Schedule a rebuild after the hold-down window; calls made during the
    /// window coalesce into one rebuild.
    pub fn update(&self) {
        self.inner.mark_dirty();
    }

    /// Merge, resolve secrets, publish, and emit a build event immediately.
    pub async fn build(&self) {
        self.inner.build().await;
    }

    /// The last successfully built, secret-resolved tree.
    pub fn properties(&self) -> Arc<Value> {
        self.inner.properties.load_full()
    }

    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        self.inner.sources.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.inner.events.subscribe()
    }

    /// Number of completed builds.
    pub fn builds(&self) -> u64 {
        self.inner.builds.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> StorageHealth {
        let sources = self.inner.sources.read();
        let summaries: Vec<SourceSummary> = sources
            .iter()
            .map(|source| SourceSummary {
                name: source.name().to_string(),
                kind: source.kind().to_string(),
                ok: source.status().ok,
            })
            .collect();
        let ok = summaries.iter().all(|s| s.ok);
        StorageHealth {
            ok,
            sources: summaries,
            code: if ok { 200 } else { 503 },
        }
    }
}

impl StorageInner {
    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.signal.notify_one();
    }

    async fn build(&self) {
        // One consistent snapshot: each source's tree is read exactly once
        let layers: Vec<Arc<Value>> = {
            self.sources.read().iter().map(|s| s.properties()).collect()
        };

        let mut merged = properties::empty();
        for layer in layers {
            properties::merge_into(&mut merged, (*layer).clone());
        }

        let overlay = self.transformer.transform(&merged).await;
        properties::merge_into(&mut merged, overlay);

        let build = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        let tree = Arc::new(merged);
        self.properties.store(tree.clone());
        let _ = self.events.send(BuildEvent {
            build,
            properties: tree,
        });
        debug!(build, "property tree rebuilt");
    }
}

async fn run_builder(inner: Arc<StorageInner>) {
    loop {
        inner.signal.notified().await;
        if !inner.dirty.load(Ordering::SeqCst) {
            continue;
        }
        tokio::time::sleep(inner.hold_down).await;
        // Updates that arrived during the window are covered by this build
        inner.dirty.store(false, Ordering::SeqCst);
        inner.build().await;
        // Updates that arrived mid-build get one follow-up rebuild
        if inner.dirty.load(Ordering::SeqCst) {
            inner.signal.notify_one();
        }
    }
}
