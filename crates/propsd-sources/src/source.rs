//! The Source abstraction: lifecycle, status, and events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors produced by source fetches.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The remote endpoint actively refused the connection. Reported
    /// distinctly so the plugin manager can retry the metadata source in
    /// isolation.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Request failed (network, 5xx, transport)
    #[error("Request failed: {0}")]
    Request(String),

    /// Payload could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// The fetch exceeded its per-tick deadline
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Lifecycle state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceState {
    Created,
    Running,
    Failed,
    Stopped,
}

/// Lifecycle events emitted by every source.
///
/// The alphabet is closed: no other messages are ever emitted, and after
/// `Shutdown` nothing further is observed from that source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Startup,
    /// New data was parsed and installed
    Update,
    /// Fetch succeeded but the data is unchanged
    NoUpdate,
    Shutdown,
    Error(String),
}

/// Point-in-time snapshot of a source's health.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub ok: bool,
    pub running: bool,
    pub updated: Option<DateTime<Utc>>,
    /// Fetch interval in milliseconds
    pub interval: u64,
    pub state: SourceState,
}

/// A periodically refreshed, parsed view of one external data feed.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source type, e.g. `s3`, `ec2-metadata`, `consul`
    fn kind(&self) -> &'static str;

    /// Instance name, unique within a type
    fn name(&self) -> &str;

    /// The current parsed property tree. A source whose last fetch failed
    /// keeps serving its previous tree.
    fn properties(&self) -> Arc<Value>;

    fn status(&self) -> SourceStatus;

    fn subscribe(&self) -> broadcast::Receiver<SourceEvent>;

    /// Begin fetching. Idempotent: a second call on a running source is a
    /// no-op.
    async fn initialize(&self) -> propsd_common::Result<()>;

    /// Stop fetching, detach watchers, reset change-detection state.
    /// Idempotent.
    async fn shutdown(&self);
}
