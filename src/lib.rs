pub mod bus;
pub mod config;
pub mod content;
pub mod crawler;
pub mod fingerprint;
pub mod jobs;
pub mod models;
pub mod renderer;
pub mod server;
pub mod storage;
pub mod workers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::config::Config;
use crate::crawler::CrawlContext;
use crate::fingerprint::FingerprintProvider;
use crate::jobs::JobRegistry;
use crate::storage::DocStore;
use crate::workers::WorkerPool;

/// Shared application state passed to all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<JobRegistry>,
    pub worker_pool: Arc<WorkerPool>,
    pub bus: Option<Arc<EventBus>>,
    pub store: Option<DocStore>,
    pub fingerprints: Arc<FingerprintProvider>,
}

impl AppState {
    /// Bundle the crawl executor's process-wide collaborators.
    pub fn crawl_context(&self) -> Arc<CrawlContext> {
        Arc::new(CrawlContext {
            fingerprints: self.fingerprints.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            browser_pool: self.worker_pool.browser_pool(),
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    // CORS layer — permissive for the internal service
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Routes behind the API key
    let authenticated_routes = Router::new()
        .route("/crawl", post(server::routes::create_crawl))
        .route("/content", post(server::routes::extract_content))
        .route("/jobs", get(server::routes::list_jobs))
        .route("/jobs/{id}", get(server::routes::get_job))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            server::auth::require_api_key,
        ));

    // Public routes: health, root, and the WebSocket upgrade
    let public_routes = Router::new()
        .route("/", get(server::routes::health))
        .route("/health", get(server::routes::health))
        .route("/ws/{id}", get(server::ws::ws_handler));

    Router::new()
        .merge(authenticated_routes)
        .merge(public_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
