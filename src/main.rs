use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use webscout::bus::EventBus;
use webscout::config::Config;
use webscout::content::ContentExtractor;
use webscout::fingerprint::FingerprintProvider;
use webscout::jobs::JobRegistry;
use webscout::renderer::HeadlessRenderer;
use webscout::storage::DocStore;
use webscout::workers::{browser_pool::BrowserPool, browser_pool_size, sized_workers, WorkerPool};
use webscout::{build_app, AppState};

#[tokio::main]
async fn main() {
    // Initialize tracing with RUST_LOG env filter (defaults to "info")
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::parse());
    let port = config.port;

    // Document store: unavailability degrades to in-memory-only jobs.
    let store = match DocStore::connect(&config.store_url).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!(error = %e, "Document store unavailable, continuing in-memory only");
            None
        }
    };

    // Message bus: unavailability drops event fan-out but crawls proceed.
    let bus = match EventBus::connect(&config.bus_url).await {
        Ok(bus) => Some(bus),
        Err(e) => {
            tracing::warn!(error = %e, "Message bus unavailable, events will be dropped");
            None
        }
    };

    let registry = JobRegistry::new(store.clone());
    let recovered = registry.recover().await;
    if recovered > 0 {
        tracing::info!(count = recovered, "Recovered interrupted jobs from the store");
    }

    let fingerprints =
        FingerprintProvider::new(&config.fingerprint_api_url, &config.fingerprint_api_key);

    let workers = sized_workers();
    let browser_pool = BrowserPool::new(browser_pool_size(workers));
    let extractor = Arc::new(ContentExtractor::new(
        fingerprints.clone(),
        Some(HeadlessRenderer::new(browser_pool.clone())),
    ));
    let worker_pool = WorkerPool::with_size(workers, extractor, browser_pool);

    let state = AppState {
        config: config.clone(),
        registry,
        worker_pool: worker_pool.clone(),
        bus,
        store,
        fingerprints,
    };

    let app = build_app(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Crawler service starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Drain workers, then close the browser pool.
    worker_pool.shutdown().await;
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
