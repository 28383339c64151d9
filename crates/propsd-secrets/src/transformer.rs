//! Sentinel resolution over property trees.

use crate::broker::{BrokerError, SecretBroker};
use crate::cache::SecretCache;
use propsd_common::properties;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// The key marking a mapping as a secret reference.
const SENTINEL_KEY: &str = "$tokend";

/// Resolves `$tokend` sentinels in a property tree into an overlay of
/// substitutions. Failures never propagate: a sentinel that cannot be
/// resolved becomes `null`.
pub struct SecretTransformer {
    broker: Arc<dyn SecretBroker>,
    cache: SecretCache,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SecretTransformer {
    pub fn new(broker: Arc<dyn SecretBroker>, cache_ttl: Duration) -> Self {
        Self {
            broker,
            cache: SecretCache::new(cache_ttl),
            sweeper: Mutex::new(None),
        }
    }

    /// Walk `tree`, resolve every sentinel, and return an overlay tree
    /// holding the substitutions at their original key paths. The caller
    /// deep-merges the overlay on top of `tree`.
    pub async fn transform(&self, tree: &Value) -> Value {
        self.ensure_sweeper();

        let sentinels = collect(tree);
        let mut overlay = properties::empty();
        for (path, spec) in sentinels {
            let resolved = self.resolve(&spec).await;
            properties::set_path(&mut overlay, &path, resolved);
        }
        overlay
    }

    /// Resolve one sentinel spec, consulting the cache first. Only
    /// successful plaintexts are cached.
    async fn resolve(&self, spec: &Value) -> Value {
        let signature = properties::signature(spec);
        if let Some(hit) = self.cache.get(&signature) {
            return hit;
        }

        let response = match self.dispatch(spec).await {
            Ok(Some(response)) => response,
            Ok(None) => return Value::Null,
            Err(err) => {
                warn!(error = %err, "secret broker request failed, substituting null");
                return Value::Null;
            }
        };

        match response.get("plaintext") {
            Some(plaintext) => {
                let plaintext = plaintext.clone();
                self.cache.put(signature, plaintext.clone());
                plaintext
            }
            None => {
                warn!("secret broker response has no plaintext, substituting null");
                Value::Null
            }
        }
    }

    /// Classify the spec by `type` and issue the broker request.
    /// `Ok(None)` means the spec itself was unusable and no call was made.
    async fn dispatch(&self, spec: &Value) -> Result<Option<Value>, BrokerError> {
        let resource = spec.get("resource").and_then(Value::as_str);
        let kind = spec.get("type").and_then(Value::as_str);

        let resource = match resource {
            Some(resource) => resource,
            None => {
                warn!("secret sentinel has no resource, substituting null");
                return Ok(None);
            }
        };

        match kind {
            Some("generic") => self.broker.get(resource).await.map(Some),
            Some("transit") => {
                let body = json!({
                    "key": spec.get("key").cloned().unwrap_or(Value::Null),
                    "ciphertext": spec.get("ciphertext").cloned().unwrap_or(Value::Null),
                });
                self.broker.post(resource, body).await.map(Some)
            }
            Some("kms") => {
                let mut body = json!({
                    "key": "KMS",
                    "ciphertext": spec.get("ciphertext").cloned().unwrap_or(Value::Null),
                });
                if let Some(region) = spec.get("region") {
                    body["region"] = region.clone();
                }
                if let Some(datakey) = spec.get("datakey") {
                    body["datakey"] = datakey.clone();
                }
                self.broker.post(resource, body).await.map(Some)
            }
            other => {
                warn!(kind = ?other, "unknown secret type, substituting null");
                Ok(None)
            }
        }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_none() {
            *sweeper = Some(self.cache.spawn_sweeper());
        }
    }
}

impl Drop for SecretTransformer {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

/// Depth-first sentinel collection. A mapping whose sole key is `$tokend`
/// records its key path and is not descended into; sequences are not
/// walked.
fn collect(tree: &Value) -> Vec<(Vec<String>, Value)> {
    fn walk(node: &Value, path: &mut Vec<String>, out: &mut Vec<(Vec<String>, Value)>) {
        if let Value::Object(map) = node {
            if map.len() == 1 {
                if let Some(spec) = map.get(SENTINEL_KEY) {
                    out.push((path.clone(), spec.clone()));
                    return;
                }
            }
            for (key, value) in map {
                path.push(key.clone());
                walk(value, path, out);
                path.pop();
            }
        }
    }

    let mut out = Vec::new();
    walk(tree, &mut Vec::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeBroker {
        responses: SyncMutex<Vec<Result<Value, BrokerError>>>,
        calls: SyncMutex<Vec<(String, String, Option<Value>)>>,
    }

    impl FakeBroker {
        fn respond(responses: Vec<Result<Value, BrokerError>>) -> Arc<Self> {
            let mut responses = responses;
            responses.reverse();
            Arc::new(Self {
                responses: SyncMutex::new(responses),
                calls: SyncMutex::new(Vec::new()),
            })
        }

        fn pop(&self) -> Result<Value, BrokerError> {
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(BrokerError::Request("script exhausted".to_string())))
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl SecretBroker for FakeBroker {
        async fn get(&self, path: &str) -> Result<Value, BrokerError> {
            self.calls
                .lock()
                .push(("GET".to_string(), path.to_string(), None));
            self.pop()
        }

        async fn post(&self, path: &str, body: Value) -> Result<Value, BrokerError> {
            self.calls
                .lock()
                .push(("POST".to_string(), path.to_string(), Some(body)));
            self.pop()
        }
    }

    fn sentinel(kind: &str, resource: &str) -> Value {
        json!({ "$tokend": { "type": kind, "resource": resource } })
    }

    #[test]
    fn test_collect_finds_nested_sentinels() {
        let tree = json!({
            "database": {
                "password": sentinel("generic", "/v1/secret/db/password"),
                "host": "db.internal"
            },
            "api-key": sentinel("generic", "/v1/secret/api/key")
        });

        let found = collect(&tree);
        let paths: Vec<String> = found.iter().map(|(p, _)| p.join(".")).collect();
        // Depth-first in insertion order
        assert_eq!(paths, vec!["database.password", "api-key"]);
    }

    #[test]
    fn test_collect_ignores_mappings_with_extra_keys() {
        let tree = json!({
            "node": { "$tokend": {"type": "generic"}, "other": 1 }
        });
        assert!(collect(&tree).is_empty());
    }

    #[tokio::test]
    async fn test_generic_secret_resolves() {
        let broker = FakeBroker::respond(vec![Ok(json!({"plaintext": "toor"}))]);
        let transformer = SecretTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({
            "password": sentinel("generic", "/v1/secret/kali/root/password")
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(overlay, json!({"password": "toor"}));
        let calls = broker.calls.lock();
        assert_eq!(calls[0].0, "GET");
        assert_eq!(calls[0].1, "/v1/secret/kali/root/password");
    }

    #[tokio::test]
    async fn test_cache_suppresses_repeat_calls_within_ttl() {
        let broker = FakeBroker::respond(vec![Ok(json!({"plaintext": "toor"}))]);
        let transformer = SecretTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({
            "password": sentinel("generic", "/v1/secret/kali/root/password")
        });

        let first = transformer.transform(&tree).await;
        let second = transformer.transform(&tree).await;

        assert_eq!(first, second);
        assert_eq!(broker.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_plaintext_substitutes_null() {
        let broker = FakeBroker::respond(vec![Ok(json!({"plaintexts": "toor"}))]);
        let transformer = SecretTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({"password": sentinel("generic", "/v1/secret/x")});
        let overlay = transformer.transform(&tree).await;

        assert_eq!(overlay, json!({"password": null}));
        // Nulls are not cached, so the broker is retried on the next build
        transformer.transform(&tree).await;
        assert_eq!(broker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_broker_failure_substitutes_null() {
        let broker = FakeBroker::respond(vec![Err(BrokerError::Request("refused".to_string()))]);
        let transformer = SecretTransformer::new(broker, Duration::from_secs(300));

        let tree = json!({"password": sentinel("generic", "/v1/secret/x")});
        assert_eq!(
            transformer.transform(&tree).await,
            json!({"password": null})
        );
    }

    #[tokio::test]
    async fn test_unknown_type_substitutes_null_without_a_call() {
        let broker = FakeBroker::respond(vec![]);
        let transformer = SecretTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({"password": sentinel("pkcs11", "/v1/secret/x")});
        assert_eq!(
            transformer.transform(&tree).await,
            json!({"password": null})
        );
        assert_eq!(broker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_transit_and_kms_request_bodies() {
        let broker = FakeBroker::respond(vec![
            Ok(json!({"plaintext": "alpha"})),
            Ok(json!({"plaintext": "beta"})),
        ]);
        let transformer = SecretTransformer::new(broker.clone(), Duration::from_secs(300));

        let tree = json!({
            "a": {"$tokend": {
                "type": "transit",
                "resource": "/v1/transit/default/decrypt",
                "key": "app",
                "ciphertext": "vault:v1:abc"
            }},
            "b": {"$tokend": {
                "type": "kms",
                "resource": "/v1/kms/decrypt",
                "ciphertext": "AQIC",
                "region": "us-east-1"
            }}
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(overlay, json!({"a": "alpha", "b": "beta"}));
        let calls = broker.calls.lock();
        assert_eq!(
            calls[0].2,
            Some(json!({"key": "app", "ciphertext": "vault:v1:abc"}))
        );
        assert_eq!(
            calls[1].2,
            Some(json!({"key": "KMS", "ciphertext": "AQIC", "region": "us-east-1"}))
        );
    }

    #[tokio::test]
    async fn test_overlay_covers_multiple_paths() {
        let broker = FakeBroker::respond(vec![
            Ok(json!({"plaintext": "one"})),
            Ok(json!({"plaintext": "two"})),
        ]);
        let transformer = SecretTransformer::new(broker, Duration::from_secs(300));

        let tree = json!({
            "database": {
                "username": sentinel("generic", "/v1/secret/db/user"),
                "password": sentinel("generic", "/v1/secret/db/pass"),
                "host": "db.internal"
            }
        });
        let overlay = transformer.transform(&tree).await;

        assert_eq!(
            overlay,
            json!({"database": {"username": "one", "password": "two"}})
        );
    }
}
