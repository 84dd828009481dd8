use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::crawler;
use crate::models::{
    generate_id, is_valid_job_id, ContentBatchResponse, ContentRequest, CrawlRequest, Job,
    JobStatus,
};
use crate::jobs::RegistryError;
use crate::workers::WorkerPoolError;
use crate::AppState;

/// GET / and /health
///
/// Liveness plus a per-dependency connectivity snapshot.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let bus_ok = match &state.bus {
        Some(bus) => bus.ping().await,
        None => false,
    };
    let store_ok = match &state.store {
        Some(store) => store.ping().await,
        None => false,
    };
    let browser_pool = state.worker_pool.browser_pool();

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now(),
        "services": {
            "bus": bus_ok,
            "store": store_ok,
            "worker_pool": {
                "workers": state.worker_pool.workers(),
                "idle": state.worker_pool.idle_workers(),
            },
            "browser_pool": {
                "capacity": browser_pool.capacity(),
                "size": browser_pool.size().await,
            },
        },
        "memory": {
            "active_jobs": state.registry.active_count().await,
        },
    }))
}

/// POST /crawl
///
/// Validate the request, register the job, and detach its executor.
pub async fn create_crawl(
    State(state): State<AppState>,
    payload: Result<Json<CrawlRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(mut request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
    };

    if request.url.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Field 'url' is required");
    }
    match Url::parse(&request.url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Field 'url' must be an absolute http(s) URL",
            );
        }
    }

    let job_id = match &request.job_id {
        Some(id) => {
            if !is_valid_job_id(id) {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "Field 'job_id' must be 3-50 characters of [A-Za-z0-9_-]",
                );
            }
            id.clone()
        }
        None => generate_id(),
    };

    if request.clamp_max_urls() {
        tracing::debug!(job_id = %job_id, "max_urls clamped to server ceiling");
    }

    let job = Job::new(job_id.clone(), request.clone());
    if let Err(RegistryError::Conflict(_)) = state.registry.create(job).await {
        return error_response(StatusCode::CONFLICT, "Job id already exists");
    }

    tracing::info!(job_id = %job_id, url = %request.url, "Crawl job accepted");
    crawler::spawn_crawl(state.crawl_context(), job_id.clone(), request);

    (
        StatusCode::OK,
        Json(json!({
            "job_id": job_id,
            "status": "accepted",
            "message": "Crawl started; poll /jobs/{id} or subscribe to /ws/{id}",
        })),
    )
        .into_response()
}

/// POST /content
///
/// Single URL or batch; admission control may answer 503.
pub async fn extract_content(
    State(state): State<AppState>,
    payload: Result<Json<ContentRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(request)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
    };

    let mut urls: Vec<String> = Vec::new();
    if let Some(url) = request.url.as_ref().filter(|u| !u.trim().is_empty()) {
        urls.push(url.clone());
    }
    if let Some(batch) = &request.urls {
        urls.extend(batch.iter().filter(|u| !u.trim().is_empty()).cloned());
    }
    if urls.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Provide either 'url' or a non-empty 'urls' list",
        );
    }

    match state
        .worker_pool
        .process_content_urls(&urls, request.concurrency)
        .await
    {
        Ok(results) => Json(ContentBatchResponse::from_results(results)).into_response(),
        Err(WorkerPoolError::Overloaded) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, crate::workers::OVERLOADED)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
    pub status: Option<String>,
}

/// GET /jobs?limit=&status=
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some("running") => Some(JobStatus::Running),
        Some("completed") => Some(JobStatus::Completed),
        Some("failed") => Some(JobStatus::Failed),
        Some(other) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Unknown status filter: {other}"),
            );
        }
    };

    let jobs = state.registry.list(status, query.limit).await;
    Json(jobs).into_response()
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&job_id).await {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}
