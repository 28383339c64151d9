//! Settings loading: JSON file over defaults, environment overrides.

use propsd_common::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub service: ServiceSettings,
    pub index: IndexSettings,
    pub metadata: MetadataSettings,
    pub consul: ConsulSettings,
    pub tokend: TokendSettings,
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            index: IndexSettings::default(),
            metadata: MetadataSettings::default(),
            consul: ConsulSettings::default(),
            tokend: TokendSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub bucket: String,
    pub path: String,
    /// Fetch interval in milliseconds
    pub interval: u64,
    /// Custom endpoint; forces path-style addressing
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            path: "index.json".to_string(),
            interval: 60_000,
            endpoint: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    /// `host` or `host:port` of the instance-metadata service
    pub host: String,
    pub interval: u64,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            host: "169.254.169.254".to_string(),
            interval: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokendSettings {
    pub host: String,
    pub port: u16,
    /// Secret cache TTL in milliseconds
    #[serde(alias = "cacheTTL")]
    pub cache_ttl: u64,
}

impl Default for TokendSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4500,
            cache_ttl: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Rebuild hold-down window in milliseconds
    pub hold_down: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { hold_down: 100 }
    }
}

impl Settings {
    /// Load settings from an optional JSON file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                let settings: Settings = serde_json::from_str(&content)
                    .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
                info!(path = %path.display(), "loaded settings");
                settings
            }
            None => Settings::default(),
        };
        settings.apply_env();

        if settings.index.bucket.is_empty() {
            return Err(Error::Configuration(
                "index.bucket must be configured".to_string(),
            ));
        }
        Ok(settings)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `PROPSD_*` overrides (plus the legacy `BUILD_HOLD_DOWN`) from
    /// the given lookup. Values that fail to parse are ignored.
    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }

        if let Some(bucket) = get("PROPSD_INDEX_BUCKET") {
            self.index.bucket = bucket;
        }
        if let Some(path) = get("PROPSD_INDEX_PATH") {
            self.index.path = path;
        }
        if let Some(interval) = parse(get("PROPSD_INDEX_INTERVAL")) {
            self.index.interval = interval;
        }
        if let Some(endpoint) = get("PROPSD_INDEX_ENDPOINT") {
            self.index.endpoint = Some(endpoint);
        }
        if let Some(region) = get("PROPSD_INDEX_REGION") {
            self.index.region = Some(region);
        }
        if let Some(host) = get("PROPSD_METADATA_HOST") {
            self.metadata.host = host;
        }
        if let Some(interval) = parse(get("PROPSD_METADATA_INTERVAL")) {
            self.metadata.interval = interval;
        }
        if let Some(host) = get("PROPSD_CONSUL_HOST") {
            self.consul.host = host;
        }
        if let Some(port) = parse(get("PROPSD_CONSUL_PORT")) {
            self.consul.port = port;
        }
        if let Some(host) = get("PROPSD_TOKEND_HOST") {
            self.tokend.host = host;
        }
        if let Some(port) = parse(get("PROPSD_TOKEND_PORT")) {
            self.tokend.port = port;
        }
        if let Some(cache_ttl) = parse(get("PROPSD_TOKEND_CACHE_TTL")) {
            self.tokend.cache_ttl = cache_ttl;
        }
        if let Some(hostname) = get("PROPSD_SERVICE_HOSTNAME") {
            self.service.hostname = hostname;
        }
        if let Some(port) = parse(get("PROPSD_SERVICE_PORT")) {
            self.service.port = port;
        }
        if let Some(hold_down) = parse(get("BUILD_HOLD_DOWN")) {
            self.storage.hold_down = hold_down;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.service.port, 9100);
        assert_eq!(settings.index.interval, 60_000);
        assert_eq!(settings.metadata.host, "169.254.169.254");
        assert_eq!(settings.tokend.port, 4500);
        assert_eq!(settings.tokend.cache_ttl, 300_000);
        assert_eq!(settings.storage.hold_down, 100);
    }

    #[test]
    fn test_load_merges_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "index": {{"bucket": "props", "interval": 30000}},
                "tokend": {{"cacheTTL": 60000}}
            }}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();

        assert_eq!(settings.index.bucket, "props");
        assert_eq!(settings.index.interval, 30_000);
        assert_eq!(settings.index.path, "index.json");
        assert_eq!(settings.tokend.cache_ttl, 60_000);
        assert_eq!(settings.consul.port, 8500);
    }

    #[test]
    fn test_missing_bucket_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"index": {{"path": "index.json"}}}}"#).unwrap();

        assert!(Settings::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_env_overrides_cover_every_knob() {
        let vars: std::collections::HashMap<&str, &str> = [
            ("PROPSD_INDEX_BUCKET", "props"),
            ("PROPSD_INDEX_PATH", "other/index.json"),
            ("PROPSD_INDEX_INTERVAL", "15000"),
            ("PROPSD_INDEX_ENDPOINT", "http://localhost:4569"),
            ("PROPSD_INDEX_REGION", "us-west-2"),
            ("PROPSD_METADATA_HOST", "127.0.0.1:8080"),
            ("PROPSD_METADATA_INTERVAL", "10000"),
            ("PROPSD_CONSUL_HOST", "consul.internal"),
            ("PROPSD_CONSUL_PORT", "8501"),
            ("PROPSD_TOKEND_HOST", "tokend.internal"),
            ("PROPSD_TOKEND_PORT", "4501"),
            ("PROPSD_TOKEND_CACHE_TTL", "60000"),
            ("PROPSD_SERVICE_HOSTNAME", "0.0.0.0"),
            ("PROPSD_SERVICE_PORT", "9101"),
            ("BUILD_HOLD_DOWN", "250"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.index.bucket, "props");
        assert_eq!(settings.index.path, "other/index.json");
        assert_eq!(settings.index.interval, 15_000);
        assert_eq!(
            settings.index.endpoint.as_deref(),
            Some("http://localhost:4569")
        );
        assert_eq!(settings.index.region.as_deref(), Some("us-west-2"));
        assert_eq!(settings.metadata.host, "127.0.0.1:8080");
        assert_eq!(settings.metadata.interval, 10_000);
        assert_eq!(settings.consul.host, "consul.internal");
        assert_eq!(settings.consul.port, 8501);
        assert_eq!(settings.tokend.host, "tokend.internal");
        assert_eq!(settings.tokend.port, 4501);
        assert_eq!(settings.tokend.cache_ttl, 60_000);
        assert_eq!(settings.service.hostname, "0.0.0.0");
        assert_eq!(settings.service.port, 9101);
        assert_eq!(settings.storage.hold_down, 250);
    }

    #[test]
    fn test_unparsable_override_values_are_ignored() {
        let mut settings = Settings::default();
        settings.apply_overrides(|key| match key {
            "PROPSD_CONSUL_PORT" => Some("not-a-port".to_string()),
            "BUILD_HOLD_DOWN" => Some("soon".to_string()),
            _ => None,
        });

        assert_eq!(settings.consul.port, 8500);
        assert_eq!(settings.storage.hold_down, 100);
    }

    #[test]
    fn test_invalid_json_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(Error::Configuration(_))
        ));
    }
}
