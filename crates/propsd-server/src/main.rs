//! Propsd - per-node dynamic property server.
//!
//! Assembles a merged, live-updated property tree from an S3 index,
//! instance metadata, Consul, and a Tokend-style secret broker, and serves
//! it over a small HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use propsd_secrets::{SecretTransformer, TokendClient};
use propsd_server::{api, settings::Settings, telemetry};
use propsd_sources::{
    metadata_source, object_store_source, CatalogParameters, DocumentFormat, MetadataParameters,
    S3Parameters, Source,
};
use propsd_storage::{FactoryDefaults, PluginManager, StandardSourceFactory, Storage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "propsd",
    about = "Per-node dynamic property server",
    version
)]
struct Cli {
    /// Path to a JSON settings file
    #[arg(short, long, env = "PROPSD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "PROPSD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level)?;

    let settings = Settings::load(cli.config.as_deref())
        .context("failed to load settings")?;

    let broker = Arc::new(TokendClient::new(
        &settings.tokend.host,
        settings.tokend.port,
    ));
    let transformer =
        SecretTransformer::new(broker, Duration::from_millis(settings.tokend.cache_ttl));
    let storage = Storage::new(transformer, Duration::from_millis(settings.storage.hold_down));

    let index_params = S3Parameters {
        bucket: settings.index.bucket.clone(),
        path: settings.index.path.clone(),
        endpoint: settings.index.endpoint.clone(),
        region: settings.index.region.clone(),
        interval: settings.index.interval,
    };
    let index = Arc::new(object_store_source(index_params, DocumentFormat::SourceIndex).await);

    let metadata = Arc::new(metadata_source(&MetadataParameters {
        host: settings.metadata.host.clone(),
        interval: settings.metadata.interval,
    }));

    let factory = Arc::new(StandardSourceFactory::new(FactoryDefaults {
        index_bucket: settings.index.bucket.clone(),
        endpoint: settings.index.endpoint.clone(),
        region: settings.index.region.clone(),
        interval: settings.index.interval,
        consul: CatalogParameters {
            host: settings.consul.host.clone(),
            port: settings.consul.port,
        },
    }));

    let manager = PluginManager::new(
        index as Arc<dyn Source>,
        metadata as Arc<dyn Source>,
        storage.clone(),
        factory,
    );
    manager.initialize().await?;

    let state = api::AppState {
        storage,
        manager: manager.clone(),
        started: Instant::now(),
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", settings.service.hostname, settings.service.port)
        .parse()
        .context("invalid service address")?;
    info!(%addr, "propsd listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("propsd stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler");
        tokio::select! {
            _ = interrupt => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = interrupt.await;
    }

    info!("shutdown signal received");
}
