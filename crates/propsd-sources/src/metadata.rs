//! EC2 instance-metadata source.
//!
//! Walks a fixed hierarchy on the instance-metadata HTTP service and
//! materializes a nested mapping under the reserved key `instance`. The
//! service has no entity tags; change detection is a content hash over the
//! assembled tree.

use crate::poller::{Fetch, FetchOutcome, PollingSource};
use crate::source::SourceError;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// An instance-metadata source: a `PollingSource` over the fixed walk.
pub type MetadataSource = PollingSource<MetadataFetcher>;

/// Parameters for the metadata source.
#[derive(Debug, Clone)]
pub struct MetadataParameters {
    /// `host` or `host:port` of the metadata service
    pub host: String,
    /// Fetch interval in milliseconds
    pub interval: u64,
}

impl Default for MetadataParameters {
    fn default() -> Self {
        Self {
            host: "169.254.169.254".to_string(),
            interval: 30_000,
        }
    }
}

/// Scalar leaves fetched verbatim, keyed by their name under `instance`.
const SCALAR_PATHS: &[(&str, &str)] = &[
    ("ami-id", "meta-data/ami-id"),
    ("instance-id", "meta-data/instance-id"),
    ("instance-type", "meta-data/instance-type"),
    ("hostname", "meta-data/hostname"),
    ("local-hostname", "meta-data/local-hostname"),
    ("local-ipv4", "meta-data/local-ipv4"),
    ("public-hostname", "meta-data/public-hostname"),
    ("public-ipv4", "meta-data/public-ipv4"),
    ("reservation-id", "meta-data/reservation-id"),
    ("security-groups", "meta-data/security-groups"),
    ("availability-zone", "meta-data/placement/availability-zone"),
];

pub struct MetadataFetcher {
    client: reqwest::Client,
    base: String,
}

impl MetadataFetcher {
    pub fn new(params: &MetadataParameters) -> Self {
        // The metadata service is link-local; keep the timeouts short so a
        // missing service fails the tick quickly.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(3))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base: format!("http://{}/latest", params.host),
        }
    }

    /// GET one path. `Ok(None)` when the leaf does not exist.
    async fn get_text(&self, path: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/{}", self.base, path);
        match self.client.get(&url).send().await {
            Ok(response) => {
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = response
                    .error_for_status()
                    .map_err(|e| SourceError::Request(e.to_string()))?;
                let body = response
                    .text()
                    .await
                    .map_err(|e| SourceError::Request(e.to_string()))?;
                if body.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(body))
                }
            }
            Err(err) if err.is_connect() => Err(SourceError::ConnectionRefused(err.to_string())),
            Err(err) => Err(SourceError::Request(err.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl Fetch for MetadataFetcher {
    async fn fetch(&self, _tag: Option<&str>) -> Result<FetchOutcome, SourceError> {
        let mut instance = Map::new();

        for (key, path) in SCALAR_PATHS {
            if let Some(text) = self.get_text(path).await? {
                instance.insert(key.to_string(), Value::String(text));
            }
        }

        if let Some(document) = self.get_text("dynamic/instance-identity/document").await? {
            merge_identity_document(&mut instance, &document);
        }

        if let Some(listing) = self.get_text("meta-data/iam/security-credentials").await? {
            if let Some(role) = listing.lines().next().map(str::trim).filter(|r| !r.is_empty()) {
                instance.insert("iam-role".to_string(), Value::String(role.to_string()));
                let path = format!("meta-data/iam/security-credentials/{}", role);
                if let Some(credentials) = self.get_text(&path).await? {
                    merge_credentials(&mut instance, &credentials);
                }
            }
        }

        debug!(leaves = instance.len(), "assembled instance metadata");

        let mut properties = Map::new();
        properties.insert("instance".to_string(), Value::Object(instance));
        Ok(FetchOutcome::Payload {
            properties: Value::Object(properties),
            tag: None,
        })
    }
}

/// Decode the instance-identity document and lift `account` and `region`
/// next to the scalar leaves; the full document stays available under
/// `identity-document`.
fn merge_identity_document(instance: &mut Map<String, Value>, document: &str) {
    match serde_json::from_str::<Value>(document) {
        Ok(decoded) => {
            if let Some(account) = decoded.get("accountId").and_then(Value::as_str) {
                instance.insert("account".to_string(), Value::String(account.to_string()));
            }
            if let Some(region) = decoded.get("region").and_then(Value::as_str) {
                instance.insert("region".to_string(), Value::String(region.to_string()));
            }
            instance.insert("identity-document".to_string(), decoded);
        }
        Err(err) => warn!(error = %err, "invalid instance-identity document"),
    }
}

/// Decode an IAM security-credentials document under `credentials`.
fn merge_credentials(instance: &mut Map<String, Value>, credentials: &str) {
    match serde_json::from_str::<Value>(credentials) {
        Ok(decoded) => {
            instance.insert("credentials".to_string(), decoded);
        }
        Err(err) => warn!(error = %err, "invalid IAM credentials document"),
    }
}

/// Build the node's `MetadataSource`, named `ec2-metadata`.
pub fn metadata_source(params: &MetadataParameters) -> MetadataSource {
    let interval = Duration::from_millis(params.interval);
    let fetcher = MetadataFetcher::new(params);
    PollingSource::new("ec2-metadata", "ec2-metadata", interval, fetcher)
}
