//! Standard source factory: instantiates sources by index `type`.

use crate::manager::{ManagerError, SourceFactory, SourceSpec};
use async_trait::async_trait;
use propsd_sources::{
    object_store_source, CatalogParameters, CatalogSource, DocumentFormat, S3Parameters, Source,
};
use serde_json::Value;
use std::sync::Arc;

/// Defaults injected into child sources: object-store children inherit the
/// index's bucket and client settings; catalog children share one Consul
/// agent address.
#[derive(Debug, Clone)]
pub struct FactoryDefaults {
    pub index_bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Default fetch interval for children, in milliseconds
    pub interval: u64,
    pub consul: CatalogParameters,
}

/// The production [`SourceFactory`]: `s3` and `consul` types.
pub struct StandardSourceFactory {
    defaults: FactoryDefaults,
}

impl StandardSourceFactory {
    pub fn new(defaults: FactoryDefaults) -> Self {
        Self { defaults }
    }

    fn s3_parameters(&self, spec: &SourceSpec) -> Result<S3Parameters, ManagerError> {
        let path = spec
            .parameters
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ManagerError::Construction(format!(
                    "s3 source {} has no path parameter",
                    spec.name
                ))
            })?;
        let bucket = spec
            .parameters
            .get("bucket")
            .and_then(Value::as_str)
            .unwrap_or(&self.defaults.index_bucket);
        let interval = spec
            .parameters
            .get("interval")
            .and_then(Value::as_u64)
            .unwrap_or(self.defaults.interval);

        Ok(S3Parameters {
            bucket: bucket.to_string(),
            path: path.to_string(),
            endpoint: self.defaults.endpoint.clone(),
            region: self.defaults.region.clone(),
            interval,
        })
    }
}

#[async_trait]
impl SourceFactory for StandardSourceFactory {
    fn key(&self, spec: &SourceSpec) -> (String, String) {
        if spec.kind == "s3" {
            if let Ok(params) = self.s3_parameters(spec) {
                return (
                    "s3".to_string(),
                    format!("s3-{}-{}", params.bucket, params.path),
                );
            }
        }
        (spec.kind.clone(), spec.name.clone())
    }

    async fn create(&self, spec: &SourceSpec) -> Result<Arc<dyn Source>, ManagerError> {
        match spec.kind.as_str() {
            "s3" => {
                let params = self.s3_parameters(spec)?;
                let source = object_store_source(params, DocumentFormat::PropertyFile).await;
                Ok(Arc::new(source))
            }
            "consul" => Ok(Arc::new(CatalogSource::new(
                spec.name.clone(),
                &self.defaults.consul,
            ))),
            other => Err(ManagerError::UnknownType(other.to_string())),
        }
    }
}
