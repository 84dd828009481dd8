use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Hard server-side ceiling for `max_urls`, applied after parsing.
pub const MAX_URLS_CEILING: usize = 5000;

// --- Crawl Request ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Base politeness delay as a duration string, e.g. "200ms" or "1s".
    #[serde(default = "default_delay")]
    pub delay: String,
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,
    #[serde(default)]
    pub enable_sitemap: bool,
    #[serde(default)]
    pub enable_html: bool,
    #[serde(default)]
    pub enable_headless: bool,
    /// Headless navigation budget in seconds.
    #[serde(default = "default_headless_timeout")]
    pub headless_timeout: u64,
}

fn default_depth() -> u32 {
    1
}

fn default_workers() -> usize {
    10
}

fn default_delay() -> String {
    "200ms".to_string()
}

fn default_max_urls() -> usize {
    1000
}

fn default_headless_timeout() -> u64 {
    30
}

impl Default for CrawlRequest {
    fn default() -> Self {
        CrawlRequest {
            url: String::new(),
            job_id: None,
            depth: default_depth(),
            workers: default_workers(),
            delay: default_delay(),
            max_urls: default_max_urls(),
            enable_sitemap: false,
            enable_html: false,
            enable_headless: false,
            headless_timeout: default_headless_timeout(),
        }
    }
}

/// Which discovery tiers a request actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPlan {
    pub sitemap: bool,
    pub html: bool,
    pub headless: bool,
}

impl CrawlRequest {
    /// Clamp `max_urls` to the server ceiling. Returns true if clamping occurred.
    pub fn clamp_max_urls(&mut self) -> bool {
        if self.max_urls > MAX_URLS_CEILING {
            self.max_urls = MAX_URLS_CEILING;
            return true;
        }
        false
    }

    /// Resolve the tier flags: when none is set explicitly, sitemap and HTML
    /// default on while headless stays off.
    pub fn tier_plan(&self) -> TierPlan {
        if !self.enable_sitemap && !self.enable_html && !self.enable_headless {
            TierPlan {
                sitemap: true,
                html: true,
                headless: false,
            }
        } else {
            TierPlan {
                sitemap: self.enable_sitemap,
                html: self.enable_html,
                headless: self.enable_headless,
            }
        }
    }

    /// Parse the delay duration string, falling back to 200 ms.
    pub fn delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.delay).unwrap_or(Duration::from_millis(200))
    }
}

/// Validate a client-supplied job id: 3-50 chars of `[A-Za-z0-9_-]`.
pub fn is_valid_job_id(id: &str) -> bool {
    (3..=50).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Generate an opaque hex job/result identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// --- Crawl Result ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSettings {
    pub depth: u32,
    pub workers: usize,
    pub max_urls: usize,
    pub sitemap_enabled: bool,
    pub html_enabled: bool,
    pub headless_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub id: String,
    /// Effective target after reachability fallback; may differ from the request URL.
    pub target_url: String,
    pub duration: String,
    pub total_urls: usize,
    /// Formatted URLs/second throughput.
    pub urls_per_second: String,
    pub settings: CrawlSettings,
    /// Unique URLs in order of first observation.
    pub urls: Vec<String>,
}

// --- Job ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: CrawlRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CrawlResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: String, request: CrawlRequest) -> Self {
        let now = Utc::now();
        Job {
            id,
            status: JobStatus::Running,
            progress: "Job accepted".to_string(),
            created_at: now,
            updated_at: now,
            request,
            result: None,
            error: None,
        }
    }
}

// --- Content extraction ---

#[derive(Debug, Clone, Deserialize)]
pub struct ContentRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Option<Vec<String>>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    /// Final URL after any reachability fallback.
    pub url: String,
    pub status_code: u16,
    pub content_type: String,
    pub markdown: String,
    /// Byte size of the markdown body.
    pub size: usize,
    pub headers: HashMap<String, String>,
    /// Empty on success.
    #[serde(default)]
    pub error: String,
}

impl ContentResponse {
    pub fn failure(url: &str, status_code: u16, error: String) -> Self {
        ContentResponse {
            url: url.to_string(),
            status_code,
            content_type: String::new(),
            markdown: String::new(),
            size: 0,
            headers: HashMap::new(),
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentBatchResponse {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<ContentResponse>,
}

impl ContentBatchResponse {
    pub fn from_results(results: Vec<ContentResponse>) -> Self {
        let total = results.len();
        let success = results.iter().filter(|r| r.is_success()).count();
        ContentBatchResponse {
            total,
            success,
            failed: total - success,
            results,
        }
    }
}

// --- Events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    UrlDiscovered,
    SitemapDiscovered,
    TierSwitch,
    Completed,
    Error,
}

impl EventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Error)
    }

    /// Routing-key segment for the bus topic `crawler.<job_id>.<segment>`.
    /// Sitemap-discovery and tier-switch events travel as progress variants.
    pub fn routing_segment(&self) -> &'static str {
        match self {
            EventType::Progress | EventType::SitemapDiscovered | EventType::TierSwitch => {
                "progress"
            }
            EventType::UrlDiscovered => "url_discovered",
            EventType::Completed => "completed",
            EventType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Sitemap,
    Html,
    Headless,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Sitemap => write!(f, "sitemap"),
            Tier::Html => write!(f, "html"),
            Tier::Headless => write!(f, "headless"),
        }
    }
}

/// A progress record published to the bus and relayed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl CrawlEvent {
    pub fn new(event_type: EventType, job_id: &str) -> Self {
        CrawlEvent {
            event_type,
            job_id: job_id.to_string(),
            url: None,
            depth: None,
            progress: None,
            timestamp: Utc::now(),
            total: None,
            page_count: None,
            error: None,
            tier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_validation_bounds() {
        assert!(is_valid_job_id("abc"));
        assert!(is_valid_job_id("my-job_42"));
        assert!(is_valid_job_id(&"a".repeat(50)));
        assert!(!is_valid_job_id("ab"));
        assert!(!is_valid_job_id(&"a".repeat(51)));
        assert!(!is_valid_job_id(""));
        assert!(!is_valid_job_id("has space"));
        assert!(!is_valid_job_id("dots.not.allowed"));
        assert!(!is_valid_job_id("emoji-😀"));
    }

    #[test]
    fn test_generated_ids_are_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_defaults() {
        let req: CrawlRequest = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(req.depth, 1);
        assert_eq!(req.workers, 10);
        assert_eq!(req.delay, "200ms");
        assert_eq!(req.max_urls, 1000);
        assert_eq!(req.headless_timeout, 30);
        assert!(!req.enable_sitemap);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let req: CrawlRequest =
            serde_json::from_str(r#"{"url":"https://example.com","bogus":true}"#).unwrap();
        assert_eq!(req.url, "https://example.com");
    }

    #[test]
    fn test_tier_plan_defaults_when_unset() {
        let req = CrawlRequest::default();
        let plan = req.tier_plan();
        assert!(plan.sitemap);
        assert!(plan.html);
        assert!(!plan.headless);
    }

    #[test]
    fn test_tier_plan_explicit() {
        let req = CrawlRequest {
            enable_headless: true,
            ..Default::default()
        };
        let plan = req.tier_plan();
        assert!(!plan.sitemap);
        assert!(!plan.html);
        assert!(plan.headless);
    }

    #[test]
    fn test_max_urls_clamp() {
        let mut req = CrawlRequest {
            max_urls: 9999,
            ..Default::default()
        };
        assert!(req.clamp_max_urls());
        assert_eq!(req.max_urls, MAX_URLS_CEILING);

        let mut req = CrawlRequest {
            max_urls: 100,
            ..Default::default()
        };
        assert!(!req.clamp_max_urls());
        assert_eq!(req.max_urls, 100);
    }

    #[test]
    fn test_delay_parsing() {
        let req = CrawlRequest {
            delay: "1s".to_string(),
            ..Default::default()
        };
        assert_eq!(req.delay_duration(), Duration::from_secs(1));

        let req = CrawlRequest {
            delay: "garbage".to_string(),
            ..Default::default()
        };
        assert_eq!(req.delay_duration(), Duration::from_millis(200));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_event_routing_segments() {
        assert_eq!(EventType::SitemapDiscovered.routing_segment(), "progress");
        assert_eq!(EventType::TierSwitch.routing_segment(), "progress");
        assert_eq!(EventType::UrlDiscovered.routing_segment(), "url_discovered");
        assert_eq!(EventType::Completed.routing_segment(), "completed");
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = CrawlEvent::new(EventType::UrlDiscovered, "job-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "url_discovered");
        assert_eq!(json["job_id"], "job-1");
        assert!(json.get("url").is_none());
    }

    #[test]
    fn test_batch_response_counts() {
        let results = vec![
            ContentResponse {
                url: "https://a".into(),
                status_code: 200,
                content_type: "text/html".into(),
                markdown: "# ok".into(),
                size: 4,
                headers: HashMap::new(),
                error: String::new(),
            },
            ContentResponse::failure("https://b", 403, "blocked".into()),
        ];
        let batch = ContentBatchResponse::from_results(results);
        assert_eq!(batch.total, 2);
        assert_eq!(batch.success, 1);
        assert_eq!(batch.failed, 1);
    }
}
