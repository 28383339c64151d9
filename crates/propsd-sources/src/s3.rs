//! S3-backed property source with entity-tag conditional requests.

use crate::poller::{Fetch, FetchOutcome, PollingSource};
use crate::source::SourceError;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, error::SdkError, Client as S3Client};
use propsd_common::properties;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// An S3 property source: a `PollingSource` over conditional GETs.
pub type ObjectStoreSource = PollingSource<S3Fetcher>;

/// Parameters for an S3-backed source.
#[derive(Debug, Clone)]
pub struct S3Parameters {
    pub bucket: String,
    pub path: String,
    /// Custom endpoint; forces path-style addressing (for S3-compatible
    /// stores and test fixtures)
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Fetch interval in milliseconds
    pub interval: u64,
}

impl S3Parameters {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            endpoint: None,
            region: None,
            interval: 60_000,
        }
    }
}

/// How to extract a property tree from a fetched JSON document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// `{"version": "1.0", "properties": {...}}`: the tree is the
    /// `properties` member
    PropertyFile,
    /// `{"version": "1.0", "sources": [...]}`: the whole document is kept
    /// so the plugin manager can read `sources`
    SourceIndex,
}

impl DocumentFormat {
    fn extract(&self, document: Value) -> Result<Value, SourceError> {
        if !document.is_object() {
            return Err(SourceError::Parse(
                "document root must be a mapping".to_string(),
            ));
        }
        if let Some(version) = document.get("version").and_then(Value::as_str) {
            if version != "1.0" {
                warn!(version, "unexpected document version");
            }
        }
        match self {
            DocumentFormat::PropertyFile => Ok(document
                .get("properties")
                .cloned()
                .unwrap_or_else(properties::empty)),
            DocumentFormat::SourceIndex => Ok(document),
        }
    }
}

/// Conditional-GET fetcher against one S3 object.
pub struct S3Fetcher {
    client: S3Client,
    bucket: String,
    path: String,
    format: DocumentFormat,
}

impl S3Fetcher {
    pub async fn new(params: &S3Parameters, format: DocumentFormat) -> Self {
        let region = params
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(endpoint) = &params.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        debug!(
            bucket = %params.bucket,
            path = %params.path,
            %region,
            "created S3 fetcher"
        );

        Self {
            client,
            bucket: params.bucket.clone(),
            path: params.path.clone(),
            format,
        }
    }
}

#[async_trait::async_trait]
impl Fetch for S3Fetcher {
    async fn fetch(&self, tag: Option<&str>) -> Result<FetchOutcome, SourceError> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.path);
        if let Some(tag) = tag {
            request = request.if_none_match(tag);
        }

        match request.send().await {
            Ok(output) => {
                let etag = output.e_tag().map(|t| t.to_string());
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| SourceError::Request(e.to_string()))?
                    .into_bytes();
                let document: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| SourceError::Parse(e.to_string()))?;
                let properties = self.format.extract(document)?;
                Ok(FetchOutcome::Payload {
                    properties,
                    tag: etag,
                })
            }
            Err(err) => {
                if let SdkError::ServiceError(context) = &err {
                    match context.raw().status().as_u16() {
                        304 => return Ok(FetchOutcome::Unchanged),
                        404 => return Ok(FetchOutcome::NotFound),
                        _ => {}
                    }
                }
                Err(SourceError::Request(err.to_string()))
            }
        }
    }
}

/// Build an `ObjectStoreSource` named `s3-<bucket>-<path>`.
pub async fn object_store_source(params: S3Parameters, format: DocumentFormat) -> ObjectStoreSource {
    let name = format!("s3-{}-{}", params.bucket, params.path);
    let interval = Duration::from_millis(params.interval);
    let fetcher = S3Fetcher::new(&params, format).await;
    PollingSource::new("s3", name, interval, fetcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_property_file_extracts_properties_member() {
        let doc = json!({"version": "1.0", "properties": {"a": 1}});
        let tree = DocumentFormat::PropertyFile.extract(doc).unwrap();
        assert_eq!(tree, json!({"a": 1}));
    }

    #[test]
    fn test_property_file_without_properties_is_empty() {
        let doc = json!({"version": "1.0"});
        let tree = DocumentFormat::PropertyFile.extract(doc).unwrap();
        assert_eq!(tree, json!({}));
    }

    #[test]
    fn test_source_index_keeps_whole_document() {
        let doc = json!({
            "version": "1.0",
            "sources": [{"name": "global", "type": "s3", "parameters": {"path": "global.json"}}]
        });
        let tree = DocumentFormat::SourceIndex.extract(doc.clone()).unwrap();
        assert_eq!(tree, doc);
    }

    #[test]
    fn test_non_mapping_root_is_a_parse_error() {
        assert!(DocumentFormat::PropertyFile.extract(json!([1, 2])).is_err());
    }
}
