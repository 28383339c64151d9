//! Consul service-catalog source.
//!
//! Two levels of watchers built on Consul blocking queries:
//! - a service-list watcher over `/v1/catalog/services`, which keeps one
//!   health watcher alive per `(service, tag)` pair (or per service when it
//!   has no tags), and
//! - health watchers over `/v1/health/service/<service>`, each maintaining
//!   `consul.<name>.addresses` as the ascending-sorted unique list of
//!   addresses. An empty list retires the entry and ends its watcher.

use crate::source::{Source, SourceError, SourceEvent, SourceState, SourceStatus};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use propsd_common::properties;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Blocking-query wait window
const WAIT: &str = "55s";
const WAIT_MILLIS: u64 = 55_000;
/// Backoff after a failed blocking query
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Parameters for the catalog source.
#[derive(Debug, Clone)]
pub struct CatalogParameters {
    pub host: String,
    pub port: u16,
}

impl Default for CatalogParameters {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node", default)]
    node: Option<EntryAddress>,
    #[serde(rename = "Service", default)]
    service: Option<EntryAddress>,
}

#[derive(Debug, Deserialize)]
struct EntryAddress {
    #[serde(rename = "Address", default)]
    address: Option<String>,
}

struct Shared {
    ok: bool,
    state: SourceState,
    updated: Option<chrono::DateTime<Utc>>,
}

struct CatalogInner {
    name: String,
    base: String,
    client: reqwest::Client,
    properties: ArcSwap<Value>,
    /// Watch name (`service` or `service-tag`) to its address list
    catalog: Mutex<BTreeMap<String, Value>>,
    watchers: Mutex<BTreeMap<String, JoinHandle<()>>>,
    shared: Mutex<Shared>,
    events: broadcast::Sender<SourceEvent>,
    running: AtomicBool,
    stop: broadcast::Sender<()>,
}

/// A [`Source`] observing a Consul service catalog under the reserved key
/// `consul`.
pub struct CatalogSource {
    inner: Arc<CatalogInner>,
}

impl CatalogSource {
    pub fn new(name: impl Into<String>, params: &CatalogParameters) -> Self {
        let (events, _) = broadcast::channel(64);
        let (stop, _) = broadcast::channel(1);
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            // Must outlive the blocking-query wait window
            .timeout(Duration::from_secs(66))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            inner: Arc::new(CatalogInner {
                name: name.into(),
                base: format!("http://{}:{}", params.host, params.port),
                client,
                properties: ArcSwap::from_pointee(properties::empty()),
                catalog: Mutex::new(BTreeMap::new()),
                watchers: Mutex::new(BTreeMap::new()),
                shared: Mutex::new(Shared {
                    ok: false,
                    state: SourceState::Created,
                    updated: None,
                }),
                events,
                running: AtomicBool::new(false),
                stop,
            }),
        }
    }
}

/// The set of health watches a service listing calls for, keyed by watch
/// name. A service with tags gets one watch per `(service, tag)`; a service
/// without tags gets a single untagged watch.
fn desired_watches(
    services: &BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, (String, Option<String>)> {
    let mut desired = BTreeMap::new();
    for (service, tags) in services {
        if tags.is_empty() {
            desired.insert(service.clone(), (service.clone(), None));
        } else {
            for tag in tags {
                desired.insert(
                    format!("{}-{}", service, tag),
                    (service.clone(), Some(tag.clone())),
                );
            }
        }
    }
    desired
}

/// Ascending-sorted unique addresses: `Service.Address` when present,
/// otherwise `Node.Address`.
fn addresses_from(entries: &[HealthEntry]) -> Vec<String> {
    let mut addresses = BTreeSet::new();
    for entry in entries {
        let service_address = entry
            .service
            .as_ref()
            .and_then(|s| s.address.as_deref())
            .filter(|a| !a.is_empty());
        let node_address = entry
            .node
            .as_ref()
            .and_then(|n| n.address.as_deref())
            .filter(|a| !a.is_empty());
        if let Some(address) = service_address.or(node_address) {
            addresses.insert(address.to_string());
        }
    }
    addresses.into_iter().collect()
}

impl CatalogInner {
    fn emit(&self, event: SourceEvent) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    fn mark_ok(&self) {
        let mut shared = self.shared.lock();
        shared.ok = true;
        shared.state = SourceState::Running;
    }

    fn mark_failed(&self, err: &SourceError) {
        let mut shared = self.shared.lock();
        shared.ok = false;
        shared.state = SourceState::Failed;
        drop(shared);
        warn!(source = %self.name, error = %err, "catalog query failed");
        self.emit(SourceEvent::Error(err.to_string()));
    }

    /// Rebuild the published tree from the current catalog map.
    fn publish(&self) {
        let catalog = self.catalog.lock();
        let mut services = Map::new();
        for (name, value) in catalog.iter() {
            services.insert(name.clone(), value.clone());
        }
        drop(catalog);

        let mut root = Map::new();
        root.insert("consul".to_string(), Value::Object(services));
        self.properties.store(Arc::new(Value::Object(root)));
        self.shared.lock().updated = Some(Utc::now());
    }

    fn install(&self, name: &str, addresses: Vec<String>) {
        let entry = serde_json::json!({ "addresses": addresses });
        {
            let mut catalog = self.catalog.lock();
            if catalog.get(name) == Some(&entry) {
                return;
            }
            catalog.insert(name.to_string(), entry);
        }
        self.publish();
        self.emit(SourceEvent::Update);
    }

    fn retire(&self, name: &str) {
        let removed = self.catalog.lock().remove(name).is_some();
        // Let a later service listing respawn the watch
        self.watchers.lock().remove(name);
        if removed {
            self.publish();
            self.emit(SourceEvent::Update);
        }
    }

    async fn fetch_services(
        &self,
        index: Option<&str>,
    ) -> Result<(BTreeMap<String, Vec<String>>, Option<String>), SourceError> {
        let mut request = self
            .client
            .get(format!("{}/v1/catalog/services", self.base))
            .query(&[("wait", WAIT)]);
        if let Some(index) = index {
            request = request.query(&[("index", index)]);
        }

        let response = send(request).await?;
        let next_index = consul_index(&response);
        let services = response
            .json::<BTreeMap<String, Vec<String>>>()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;
        Ok((services, next_index))
    }

    async fn fetch_health(
        &self,
        service: &str,
        tag: Option<&str>,
        index: Option<&str>,
    ) -> Result<(Vec<HealthEntry>, Option<String>), SourceError> {
        let mut request = self
            .client
            .get(format!("{}/v1/health/service/{}", self.base, service))
            .query(&[("wait", WAIT), ("passing", "true")]);
        if let Some(tag) = tag {
            request = request.query(&[("tag", tag)]);
        }
        if let Some(index) = index {
            request = request.query(&[("index", index)]);
        }

        let response = send(request).await?;
        let next_index = consul_index(&response);
        let entries = response
            .json::<Vec<HealthEntry>>()
            .await
            .map_err(|e| SourceError::Parse(e.to_string()))?;
        Ok((entries, next_index))
    }

    /// Reconcile running health watchers with the latest service listing.
    fn sync_watchers(self: &Arc<Self>, services: &BTreeMap<String, Vec<String>>) {
        let desired = desired_watches(services);
        let mut watchers = self.watchers.lock();

        let stale: Vec<String> = watchers
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = watchers.remove(&name) {
                handle.abort();
            }
            debug!(source = %self.name, watch = %name, "service disappeared, tearing down watch");
            let removed = self.catalog.lock().remove(&name).is_some();
            if removed {
                self.publish();
                self.emit(SourceEvent::Update);
            }
        }

        for (name, (service, tag)) in desired {
            watchers.entry(name.clone()).or_insert_with(|| {
                debug!(source = %self.name, watch = %name, "starting health watch");
                tokio::spawn(run_health_watch(self.clone(), name, service, tag))
            });
        }
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, SourceError> {
    match request.send().await {
        Ok(response) => response
            .error_for_status()
            .map_err(|e| SourceError::Request(e.to_string())),
        Err(err) if err.is_connect() => Err(SourceError::ConnectionRefused(err.to_string())),
        Err(err) => Err(SourceError::Request(err.to_string())),
    }
}

fn consul_index(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("X-Consul-Index")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

async fn run_service_watch(inner: Arc<CatalogInner>) {
    let mut stop = inner.stop.subscribe();
    let mut index: Option<String> = None;
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            result = inner.fetch_services(index.as_deref()) => match result {
                Ok((services, next_index)) => {
                    index = next_index;
                    inner.mark_ok();
                    inner.sync_watchers(&services);
                }
                Err(err) => {
                    index = None;
                    inner.mark_failed(&err);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

async fn run_health_watch(
    inner: Arc<CatalogInner>,
    name: String,
    service: String,
    tag: Option<String>,
) {
    let mut stop = inner.stop.subscribe();
    let mut index: Option<String> = None;
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            result = inner.fetch_health(&service, tag.as_deref(), index.as_deref()) => match result {
                Ok((entries, next_index)) => {
                    index = next_index;
                    let addresses = addresses_from(&entries);
                    if addresses.is_empty() {
                        debug!(source = %inner.name, watch = %name, "no healthy instances, retiring");
                        inner.retire(&name);
                        break;
                    }
                    inner.install(&name, addresses);
                }
                Err(err) => {
                    index = None;
                    inner.mark_failed(&err);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl Source for CatalogSource {
    fn kind(&self) -> &'static str {
        "consul"
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
            interval: WAIT_MILLIS,
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
        debug!(source = %self.inner.name, "catalog source starting");

        tokio::spawn(run_service_watch(self.inner.clone()));
        Ok(())
    }

    async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.stop.send(());
        let mut watchers = self.inner.watchers.lock();
        for (_, handle) in watchers.iter() {
            handle.abort();
        }
        watchers.clear();
        drop(watchers);

        let mut shared = self.inner.shared.lock();
        shared.state = SourceState::Stopped;
        drop(shared);

        let _ = self.inner.events.send(SourceEvent::Shutdown);
        debug!(source = %self.inner.name, "catalog source stopped");
    }
}
