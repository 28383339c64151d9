//! Generic polling runner with etag/signature change detection.

use crate::source::{Source, SourceError, SourceEvent, SourceState, SourceStatus};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use propsd_common::properties;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Outcome of one fetch against the backing store.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The backend reported the content unchanged (entity-tag match)
    Unchanged,
    /// The document does not exist
    NotFound,
    /// A parsed property tree, with the backend's entity tag if it has one
    Payload {
        properties: Value,
        tag: Option<String>,
    },
}

/// One fetch against a concrete backend. `tag` is the entity tag recorded
/// from the previous successful fetch, for conditional requests.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    async fn fetch(&self, tag: Option<&str>) -> Result<FetchOutcome, SourceError>;
}

struct Shared {
    ok: bool,
    state: SourceState,
    updated: Option<chrono::DateTime<Utc>>,
    /// Entity tag from the last installed payload
    tag: Option<String>,
    /// Content signature for etag-less backends
    signature: Option<String>,
}

struct Inner<F> {
    kind: &'static str,
    name: String,
    interval: Duration,
    fetcher: F,
    properties: ArcSwap<Value>,
    shared: Mutex<Shared>,
    events: broadcast::Sender<SourceEvent>,
    running: AtomicBool,
    stop: Notify,
}

/// A [`Source`] driven by a periodic fetch loop. The first fetch happens
/// immediately; each subsequent tick is `interval` later.
pub struct PollingSource<F: Fetch> {
    inner: Arc<Inner<F>>,
}

impl<F: Fetch> PollingSource<F> {
    pub fn new(kind: &'static str, name: impl Into<String>, interval: Duration, fetcher: F) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                kind,
                name: name.into(),
                interval,
                fetcher,
                properties: ArcSwap::from_pointee(properties::empty()),
                shared: Mutex::new(Shared {
                    ok: false,
                    state: SourceState::Created,
                    updated: None,
                    tag: None,
                    signature: None,
                }),
                events,
                running: AtomicBool::new(false),
                stop: Notify::new(),
            }),
        }
    }
}

impl<F: Fetch> Inner<F> {
    /// Events are suppressed once the source stops; `Shutdown` itself is
    /// emitted by `shutdown()` after the flag flips.
    fn emit(&self, event: SourceEvent) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    async fn tick(&self) {
        let tag = self.shared.lock().tag.clone();
        let deadline = (self.interval / 2).max(Duration::from_secs(1));

        let outcome = match tokio::time::timeout(deadline, self.fetcher.fetch(tag.as_deref())).await
        {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(deadline)),
        };

        match outcome {
            Ok(FetchOutcome::Unchanged) => {
                let mut shared = self.shared.lock();
                shared.ok = true;
                shared.state = SourceState::Running;
                drop(shared);
                self.emit(SourceEvent::NoUpdate);
            }
            Ok(FetchOutcome::NotFound) => {
                self.properties.store(Arc::new(properties::empty()));
                let mut shared = self.shared.lock();
                shared.ok = true;
                shared.state = SourceState::Running;
                shared.updated = Some(Utc::now());
                shared.tag = None;
                shared.signature = None;
                drop(shared);
                debug!(source = %self.name, "document missing, serving empty tree");
                self.emit(SourceEvent::Update);
            }
            Ok(FetchOutcome::Payload { properties, tag }) => {
                // Etag-less backends are gated on a content hash instead
                let signature = match tag {
                    Some(_) => None,
                    None => Some(properties::signature(&properties)),
                };
                let changed = {
                    let mut shared = self.shared.lock();
                    let changed = match (&tag, &signature) {
                        (Some(tag), _) => shared.tag.as_deref() != Some(tag.as_str()),
                        (None, Some(sig)) => shared.signature.as_deref() != Some(sig.as_str()),
                        (None, None) => true,
                    };
                    if changed {
                        shared.tag = tag;
                        shared.signature = signature;
                        shared.updated = Some(Utc::now());
                    }
                    shared.ok = true;
                    shared.state = SourceState::Running;
                    changed
                };
                if changed {
                    self.properties.store(Arc::new(properties));
                    self.emit(SourceEvent::Update);
                } else {
                    self.emit(SourceEvent::NoUpdate);
                }
            }
            Err(err) => {
                let mut shared = self.shared.lock();
                shared.ok = false;
                shared.state = SourceState::Failed;
                drop(shared);
                warn!(source = %self.name, error = %err, "fetch failed");
                self.emit(SourceEvent::Error(err.to_string()));
            }
        }
    }
}

#[async_trait]
impl<F: Fetch> Source for PollingSource<F> {
    fn kind(&self) -> &'static str {
        self.inner.kind
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn properties(&self) -> Arc<Value> {
        self.inner.properties.load_full()
    }

    fn status(&self) -> SourceStatus {
        let shared = self.inner.shared.lock();
        SourceStatus {
            ok: shared.ok,
            running: self.inner.running.load(Ordering::SeqCst),
            updated: shared.updated,
            interval: self.inner.interval.as_millis() as u64,
            state: shared.state,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.inner.events.subscribe()
    }

    async fn initialize(&self) -> propsd_common::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.shared.lock().state = SourceState::Running;
        self.inner.emit(SourceEvent::Startup);
        debug!(source = %self.inner.name, kind = self.inner.kind, "source starting");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.stop.notified() => break,
                    _ = ticker.tick() => {}
                }
                // Shutdown cancels an in-flight fetch
                tokio::select! {
                    _ = inner.stop.notified() => break,
                    _ = inner.tick() => {}
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.stop.notify_one();
        let mut shared = self.inner.shared.lock();
        shared.state = SourceState::Stopped;
        shared.tag = None;
        shared.signature = None;
        drop(shared);

        let _ = self.inner.events.send(SourceEvent::Shutdown);
        debug!(source = %self.inner.name, "source stopped");
    }
}
