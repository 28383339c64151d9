//! Plugin manager: keeps the active source set synchronized with the
//! interpolated index document.
//!
//! The manager owns two terminal sources, the index and the instance
//! metadata, and reloads on every update from either. A reload
//! interpolates the index's source specs against the metadata tree,
//! diffs the result against the registered children by `(type, name)`,
//! and registers, replaces, or retires children accordingly. An
//! interpolation failure (metadata not yet arrived) is retried on the next
//! terminal update; there is no separate timer.

use crate::storage::Storage;
use async_trait::async_trait;
use parking_lot::Mutex;
use propsd_common::template;
use propsd_sources::{Source, SourceEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors from source instantiation.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Source type {0} not implemented")]
    UnknownType(String),

    #[error("Source construction failed: {0}")]
    Construction(String),
}

/// One source definition as read from the index document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Instantiates sources by index `type`. `key` names the instance a spec
/// would produce, so the manager can diff without instantiating.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    fn key(&self, spec: &SourceSpec) -> (String, String);
    async fn create(&self, spec: &SourceSpec) -> Result<Arc<dyn Source>, ManagerError>;
}

/// Notifications emitted while reconciling the source set.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The interpolated spec list, after template substitution
    SourcesGenerated(Vec<SourceSpec>),
    /// The `(type, name)` pairs registered in storage after a reload
    SourcesRegistered(Vec<(String, String)>),
    Error(String),
}

/// Manager health snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub ok: bool,
}

struct ManagerInner {
    index: Arc<dyn Source>,
    metadata: Arc<dyn Source>,
    storage: Storage,
    factory: Arc<dyn SourceFactory>,
    /// Interpolated parameters per registered child, for change detection
    children: Mutex<HashMap<(String, String), Value>>,
    running: AtomicBool,
    ok: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
    stop: broadcast::Sender<()>,
}

/// Owns the index and metadata sources and drives the storage's child set.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    pub fn new(
        index: Arc<dyn Source>,
        metadata: Arc<dyn Source>,
        storage: Storage,
        factory: Arc<dyn SourceFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        let (stop, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ManagerInner {
                index,
                metadata,
                storage,
                factory,
                children: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                ok: AtomicBool::new(false),
                events,
                stop,
            }),
        }
    }

    /// Start the terminal sources and the reload loop. Idempotent.
    pub async fn initialize(&self) -> propsd_common::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // The metadata source is the first storage layer so the reserved
        // `instance` subtree participates in merges. The index stays
        // outside storage.
        if let Err(err) = self.inner.storage.register(self.inner.metadata.clone()) {
            debug!(error = %err, "metadata source already registered");
        }

        let mut index_events = self.inner.index.subscribe();
        let mut metadata_events = self.inner.metadata.subscribe();

        self.inner.metadata.initialize().await?;
        self.inner.index.initialize().await?;

        let inner = self.inner.clone();
        let mut stop = inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    event = index_events.recv() => {
                        if !handle_terminal_event(&inner, event).await {
                            break;
                        }
                    }
                    event = metadata_events.recv() => {
                        if !handle_terminal_event(&inner, event).await {
                            break;
                        }
                    }
                }
            }
        });

        info!("plugin manager started");
        Ok(())
    }

    /// Shut down every source in storage, then the index. Idempotent.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.stop.send(());
        self.inner.index.shutdown().await;
        for source in self.inner.storage.sources() {
            source.shutdown().await;
        }
        info!("plugin manager stopped");
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            ok: self.inner.ok.load(Ordering::SeqCst),
        }
    }

    /// The index source, for status reporting.
    pub fn index(&self) -> &Arc<dyn Source> {
        &self.inner.index
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }
}

/// Returns false when the terminal source's event channel closed.
async fn handle_terminal_event(
    inner: &Arc<ManagerInner>,
    event: Result<SourceEvent, broadcast::error::RecvError>,
) -> bool {
    match event {
        Ok(SourceEvent::Update) => {
            inner.reload_sources().await;
            true
        }
        // Missed events may include an update
        Err(broadcast::error::RecvError::Lagged(_)) => {
            inner.reload_sources().await;
            true
        }
        Ok(_) => true,
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

impl ManagerInner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, message: String) {
        self.ok.store(false, Ordering::SeqCst);
        warn!(error = %message, "source reload failed");
        self.emit(ManagerEvent::Error(message));
    }

    /// Recompute the child set from the current index and metadata trees.
    async fn reload_sources(&self) {
        let index_properties = self.index.properties();

        // Before the index's first update there is nothing to reconcile
        let raw_specs = match index_properties.get("sources") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                self.fail(format!("index sources is not a sequence: {}", other));
                return;
            }
            None => return,
        };

        let mut specs = Vec::with_capacity(raw_specs.len());
        for item in raw_specs {
            match serde_json::from_value::<SourceSpec>(item) {
                Ok(spec) => specs.push(spec),
                Err(err) => {
                    self.fail(format!("invalid source spec: {}", err));
                    return;
                }
            }
        }

        // Interpolate string parameters against the metadata tree. Failure
        // here usually means metadata has not arrived yet; the next
        // terminal update retries.
        let scope = self.metadata.properties();
        let mut interpolated = Vec::with_capacity(specs.len());
        for spec in specs {
            match template::render_parameters(&spec.parameters, &scope) {
                Ok(parameters) => interpolated.push(SourceSpec { parameters, ..spec }),
                Err(err) => {
                    self.fail(err.to_string());
                    return;
                }
            }
        }

        self.emit(ManagerEvent::SourcesGenerated(interpolated.clone()));

        let mut desired: Vec<((String, String), SourceSpec)> = Vec::new();
        for spec in interpolated {
            let key = self.factory.key(&spec);
            if desired.iter().any(|(k, _)| *k == key) {
                warn!(kind = %key.0, name = %key.1, "duplicate source in index, keeping the first");
                continue;
            }
            desired.push((key, spec));
        }

        let current: HashMap<(String, String), Value> = self.children.lock().clone();
        let mut failed = false;

        // Retire children no longer in the index
        for key in current.keys() {
            if !desired.iter().any(|(k, _)| k == key) {
                if let Some(source) = self.storage.unregister(&key.0, &key.1) {
                    source.shutdown().await;
                }
                self.children.lock().remove(key);
                info!(kind = %key.0, name = %key.1, "source retired");
            }
        }

        // Register new children; replace those whose parameters changed
        for (key, spec) in &desired {
            let changed = current
                .get(key)
                .map(|parameters| parameters != &spec.parameters)
                .unwrap_or(false);
            let added = !current.contains_key(key);
            if !changed && !added {
                continue;
            }

            if changed {
                if let Some(old) = self.storage.unregister(&key.0, &key.1) {
                    old.shutdown().await;
                }
                info!(kind = %key.0, name = %key.1, "source parameters changed, replacing");
            }

            match self.factory.create(spec).await {
                Ok(source) => {
                    if let Err(err) = self.storage.register(source.clone()) {
                        warn!(error = %err, "source registration rejected");
                        continue;
                    }
                    if let Err(err) = source.initialize().await {
                        warn!(kind = %key.0, name = %key.1, error = %err, "source failed to start");
                    }
                    self.children
                        .lock()
                        .insert(key.clone(), spec.parameters.clone());
                    debug!(kind = %key.0, name = %key.1, "source registered");
                }
                Err(err) => {
                    warn!(kind = %spec.kind, name = %spec.name, error = %err, "source not instantiated");
                    self.children.lock().remove(key);
                    self.emit(ManagerEvent::Error(err.to_string()));
                    failed = true;
                }
            }
        }

        // Storage order follows the interpolated list, behind the terminal
        // metadata layer
        let mut order = vec![(
            self.metadata.kind().to_string(),
            self.metadata.name().to_string(),
        )];
        order.extend(desired.iter().map(|(key, _)| key.clone()));
        self.storage.update_order(&order);
        self.storage.update();

        let registered: Vec<(String, String)> = self
            .storage
            .sources()
            .iter()
            .map(|source| (source.kind().to_string(), source.name().to_string()))
            .collect();
        self.emit(ManagerEvent::SourcesRegistered(registered));
        self.ok.store(!failed, Ordering::SeqCst);
    }
}
