//! Secret broker client.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from broker requests.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Malformed response: {0}")]
    Response(String),
}

/// JSON transport to the secret broker. GET fetches generic secrets; POST
/// submits decryption requests.
#[async_trait]
pub trait SecretBroker: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value, BrokerError>;
    async fn post(&self, path: &str, body: Value) -> Result<Value, BrokerError>;
}

/// HTTP client for a Tokend-style broker on the local node.
pub struct TokendClient {
    client: reqwest::Client,
    base: String,
}

impl TokendClient {
    pub fn new(host: &str, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");
        let base = format!("http://{}:{}", host, port);
        debug!(%base, "created secret broker client");
        Self { client, base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl SecretBroker for TokendClient {
    async fn get(&self, path: &str) -> Result<Value, BrokerError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Response(e.to_string()))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, BrokerError> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| BrokerError::Request(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Response(e.to_string()))
    }
}
