use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::json;
use std::sync::Arc;

use webscout::config::Config;
use webscout::content::ContentExtractor;
use webscout::fingerprint::FingerprintProvider;
use webscout::jobs::JobRegistry;
use webscout::workers::{browser_pool::BrowserPool, WorkerPool};
use webscout::{build_app, AppState};

fn test_state(api_key: &str) -> AppState {
    let mut config = Config::for_tests();
    config.api_key = api_key.to_string();

    let fingerprints = FingerprintProvider::new("", "");
    let extractor = Arc::new(ContentExtractor::new(fingerprints.clone(), None));
    let worker_pool = WorkerPool::with_size(5, extractor, BrowserPool::new(2));

    AppState {
        config: Arc::new(config),
        registry: JobRegistry::new(None),
        worker_pool,
        bus: None,
        store: None,
        fingerprints,
    }
}

fn test_server(api_key: &str) -> TestServer {
    TestServer::new(build_app(test_state(api_key))).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = test_server("");

    for path in ["/", "/health"] {
        let response = server.get(path).await;
        response.assert_status(StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["memory"]["active_jobs"], 0);
        assert_eq!(body["services"]["bus"], false);
        assert_eq!(body["services"]["store"], false);
    }
}

#[tokio::test]
async fn test_crawl_rejects_invalid_json() {
    let server = test_server("");
    let response = server
        .post("/crawl")
        .content_type("application/json")
        .text("{not json")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_crawl_requires_url() {
    let server = test_server("");
    let response = server.post("/crawl").json(&json!({})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body = response.json::<serde_json::Value>();
    assert!(body["error"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn test_crawl_rejects_relative_url() {
    let server = test_server("");
    let response = server.post("/crawl").json(&json!({"url": "/relative"})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_crawl_rejects_malformed_job_id() {
    let server = test_server("");
    for bad_id in ["ab", "has space", "way!bad"] {
        let response = server
            .post("/crawl")
            .json(&json!({"url": "http://127.0.0.1:9/", "job_id": bad_id}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_crawl_accepts_and_conflicts_on_duplicate_id() {
    let server = test_server("");
    let payload = json!({"url": "http://127.0.0.1:9/", "job_id": "already-taken"});

    let response = server.post("/crawl").json(&payload).await;
    response.assert_status(StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["job_id"], "already-taken");
    assert_eq!(body["status"], "accepted");

    let response = server.post("/crawl").json(&payload).await;
    response.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_crawl_generates_hex_id_when_absent() {
    let server = test_server("");
    let response = server
        .post("/crawl")
        .json(&json!({"url": "http://127.0.0.1:9/"}))
        .await;
    response.assert_status(StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    let id = body["job_id"].as_str().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_crawl_clamps_max_urls() {
    let server = test_server("");
    let response = server
        .post("/crawl")
        .json(&json!({"url": "http://127.0.0.1:9/", "job_id": "clamp-job", "max_urls": 99999}))
        .await;
    response.assert_status(StatusCode::OK);

    let response = server.get("/jobs/clamp-job").await;
    response.assert_status(StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    assert_eq!(body["request"]["max_urls"], 5000);
}

#[tokio::test]
async fn test_get_job_unknown_is_404() {
    let server = test_server("");
    let response = server.get("/jobs/nope-never-created").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_jobs_and_status_filter() {
    let server = test_server("");
    server
        .post("/crawl")
        .json(&json!({"url": "http://127.0.0.1:9/", "job_id": "list-me"}))
        .await
        .assert_status(StatusCode::OK);

    let response = server.get("/jobs").await;
    response.assert_status(StatusCode::OK);
    let body = response.json::<serde_json::Value>();
    let jobs = body.as_array().unwrap();
    assert!(jobs.iter().any(|j| j["id"] == "list-me"));

    let response = server.get("/jobs?status=bogus").await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_content_requires_some_url() {
    let server = test_server("");
    let response = server.post("/content").json(&json!({})).await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = server.post("/content").json(&json!({"urls": []})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_api_key_enforced_on_protected_routes() {
    let server = test_server("secret-key");

    // Health stays open.
    server.get("/health").await.assert_status(StatusCode::OK);

    // Protected routes refuse without the key.
    let response = server.get("/jobs").await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    // Both header forms are accepted.
    let response = server
        .get("/jobs")
        .add_header("X-API-Key", "secret-key")
        .await;
    response.assert_status(StatusCode::OK);

    let response = server
        .get("/jobs")
        .add_header("Authorization", "Bearer secret-key")
        .await;
    response.assert_status(StatusCode::OK);

    let response = server
        .get("/jobs")
        .add_header("X-API-Key", "wrong-key")
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unreachable_seed_fails_job_with_diagnostic() {
    let server = test_server("");
    server
        .post("/crawl")
        .json(&json!({"url": "http://127.0.0.1:9/", "job_id": "doomed-job"}))
        .await
        .assert_status(StatusCode::OK);

    // The executor probes variants with human-like pauses; give it time.
    let mut status = String::new();
    for _ in 0..60 {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let response = server.get("/jobs/doomed-job").await;
        let body = response.json::<serde_json::Value>();
        status = body["status"].as_str().unwrap_or("").to_string();
        if status != "running" {
            assert_eq!(status, "failed");
            let error = body["error"].as_str().unwrap();
            assert!(error.contains("all fallbacks are inaccessible"));
            return;
        }
    }
    panic!("job did not reach a terminal state, last status: {status}");
}
