//! HTTP API: `/v1/health`, `/v1/status`, `/v1/conqueso*`.

use crate::conqueso;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use propsd_storage::{PluginManager, Storage};
use serde_json::{json, Map, Value};
use std::time::Instant;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub manager: PluginManager,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/conqueso", get(conqueso_properties))
        .route("/v1/conqueso/*path", get(conqueso_properties))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn uptime_millis(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.storage.health();

    // Plugin counts by type, index included
    let mut plugins: Map<String, Value> = Map::new();
    let mut count = |kind: &str| {
        let entry = plugins.entry(kind.to_string()).or_insert(json!(0));
        *entry = json!(entry.as_u64().unwrap_or(0) + 1);
    };
    count(state.manager.index().kind());
    for source in state.storage.sources() {
        count(source.kind());
    }

    let body = json!({
        "status": health.code,
        "uptime": uptime_millis(state.started),
        "plugins": plugins,
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status_code(health.code), Json(body))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.storage.health();
    let manager = state.manager.status();
    let index = state.manager.index().status();

    let code = if health.ok && manager.ok { 200 } else { 503 };
    let sources: Vec<Value> = health
        .sources
        .iter()
        .map(|source| {
            json!({
                "name": source.name,
                "type": source.kind,
                "status": if source.ok { "okay" } else { "fail" },
            })
        })
        .collect();

    let body = json!({
        "status": code,
        "uptime": uptime_millis(state.started),
        "index": {
            "running": index.running,
            "interval": index.interval,
            "updated": index.updated,
            "ok": index.ok,
        },
        "sources": sources,
    });
    (status_code(code), Json(body))
}

async fn conqueso_properties(State(state): State<AppState>) -> impl IntoResponse {
    conqueso::flatten(&state.storage.properties())
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use propsd_secrets::{BrokerError, SecretBroker, SecretTransformer};
    use propsd_sources::{Source, SourceEvent, SourceState, SourceStatus};
    use propsd_storage::{ManagerError, SourceFactory, SourceSpec};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    struct StaticSource {
        kind: &'static str,
        name: String,
        properties: ArcSwap<Value>,
        events: broadcast::Sender<SourceEvent>,
        ok: AtomicBool,
    }

    impl StaticSource {
        fn new(kind: &'static str, name: &str, properties: Value) -> Arc<Self> {
            let (events, _) = broadcast::channel(8);
            Arc::new(Self {
                kind,
                name: name.to_string(),
                properties: ArcSwap::from_pointee(properties),
                events,
                ok: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Source for StaticSource {
        fn kind(&self) -> &'static str {
            self.kind
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn properties(&self) -> Arc<Value> {
            self.properties.load_full()
        }
        fn status(&self) -> SourceStatus {
            SourceStatus {
                ok: self.ok.load(Ordering::SeqCst),
                running: true,
                updated: None,
                interval: 60_000,
                state: SourceState::Running,
            }
        }
        fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
            self.events.subscribe()
        }
        async fn initialize(&self) -> propsd_common::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
    }

    struct NullBroker;

    #[async_trait]
    impl SecretBroker for NullBroker {
        async fn get(&self, _path: &str) -> Result<Value, BrokerError> {
            Err(BrokerError::Request("no broker".to_string()))
        }
        async fn post(&self, _path: &str, _body: Value) -> Result<Value, BrokerError> {
            Err(BrokerError::Request("no broker".to_string()))
        }
    }

    struct NullFactory;

    #[async_trait]
    impl SourceFactory for NullFactory {
        fn key(&self, spec: &SourceSpec) -> (String, String) {
            (spec.kind.clone(), spec.name.clone())
        }
        async fn create(&self, spec: &SourceSpec) -> Result<Arc<dyn Source>, ManagerError> {
            Err(ManagerError::UnknownType(spec.kind.clone()))
        }
    }

    struct Fixture {
        state: AppState,
        child: Arc<StaticSource>,
    }

    async fn fixture() -> Fixture {
        let transformer = SecretTransformer::new(Arc::new(NullBroker), Duration::from_secs(300));
        let storage = Storage::new(transformer, Duration::from_millis(10));

        let index = StaticSource::new("s3", "s3-props-index.json", json!({}));
        let metadata = StaticSource::new("ec2-metadata", "ec2-metadata", json!({}));
        let child = StaticSource::new(
            "s3",
            "s3-props-global.json",
            json!({"database": {"host": "db.internal"}, "tags": ["a", "b"]}),
        );
        storage.register(metadata.clone() as Arc<dyn Source>).unwrap();
        storage.register(child.clone() as Arc<dyn Source>).unwrap();
        storage.build().await;

        let manager = PluginManager::new(
            index as Arc<dyn Source>,
            metadata as Arc<dyn Source>,
            storage.clone(),
            Arc::new(NullFactory),
        );
        manager.initialize().await.unwrap();

        Fixture {
            state: AppState {
                storage,
                manager,
                started: Instant::now(),
            },
            child,
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_plugin_counts() {
        let fixture = fixture().await;
        let app = router(fixture.state);

        let (status, body) = get_json(app, "/v1/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!(200));
        // The index and one child, plus the metadata layer
        assert_eq!(body["plugins"]["s3"], json!(2));
        assert_eq!(body["plugins"]["ec2-metadata"], json!(1));
        assert_eq!(body["version"], json!(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_health_degrades_when_a_source_fails() {
        let fixture = fixture().await;
        fixture.child.ok.store(false, Ordering::SeqCst);
        let app = router(fixture.state);

        let (status, body) = get_json(app, "/v1/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], json!(503));
    }

    #[tokio::test]
    async fn test_status_lists_sources_with_okay_or_fail() {
        let fixture = fixture().await;
        fixture.child.ok.store(false, Ordering::SeqCst);
        let app = router(fixture.state);

        let (_, body) = get_json(app, "/v1/status").await;

        assert_eq!(body["index"]["running"], json!(true));
        let sources = body["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0]["name"], json!("ec2-metadata"));
        assert_eq!(sources[0]["status"], json!("okay"));
        assert_eq!(sources[1]["name"], json!("s3-props-global.json"));
        assert_eq!(sources[1]["status"], json!("fail"));
    }

    #[tokio::test]
    async fn test_conqueso_renders_flat_properties() {
        let fixture = fixture().await;
        let app = router(fixture.state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/conqueso")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("database.host=db.internal"));
        assert!(text.contains("tags=a,b"));
    }

    #[tokio::test]
    async fn test_conqueso_subpaths_serve_the_same_view() {
        let fixture = fixture().await;
        let app = router(fixture.state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/conqueso/api/roles/global/properties")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_methods_get_405_with_allow() {
        let fixture = fixture().await;
        let app = router(fixture.state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/conqueso")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let allow = response.headers().get("allow").unwrap().to_str().unwrap();
        assert!(allow.contains("GET"));
    }
}
