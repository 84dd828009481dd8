use governor::{Quota, RateLimiter};
use rand::Rng;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use url::Url;

use crate::bus::JobEvents;
use crate::fingerprint::FingerprintProvider;
use crate::models::Tier;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// File extensions that never lead to crawlable HTML.
const DENY_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "svg", "webp", "ico", "bmp", "tif", "tiff", "avif",
    // video
    "mp4", "avi", "mov", "wmv", "flv", "webm", "mkv", "m4v",
    // archives
    "zip", "rar", "7z", "tar", "gz", "bz2", "xz",
    // office documents
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp",
    // styles and scripts
    "css", "js", "mjs", "map",
];

/// Path prefixes excluded from the walk.
const DENY_PATH_PREFIXES: &[&str] =
    &["/admin", "/login", "/api/", "/assets/", "/static/", "/images/"];

/// Href schemes/prefixes that are not links at all for our purposes.
const DENY_HREF_PREFIXES: &[&str] = &["mailto:", "tel:", "javascript:", "#"];

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub depth: u32,
    pub workers: usize,
    pub delay: Duration,
}

struct CollectorState {
    seen: HashSet<String>,
    ordered: Vec<String>,
    pages: usize,
    stopped: bool,
}

/// Shared dedup set and ordered URL list for one crawl job.
///
/// All tiers insert through the same collector so the final list is unique
/// across tiers in order of first observation. Reaching the cap sets a
/// sticky `stopped` flag that in-flight walker requests observe.
pub struct UrlCollector {
    state: Mutex<CollectorState>,
    max_urls: usize,
}

impl UrlCollector {
    pub fn new(max_urls: usize) -> Arc<Self> {
        Arc::new(UrlCollector {
            state: Mutex::new(CollectorState {
                seen: HashSet::new(),
                ordered: Vec::new(),
                pages: 0,
                stopped: false,
            }),
            max_urls: max_urls.max(1),
        })
    }

    /// Insert a canonical URL. Returns true when the URL was new and there
    /// was room for it; hitting the cap latches the stopped flag.
    pub async fn insert(&self, url: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.stopped || state.seen.contains(url) {
            return false;
        }
        state.seen.insert(url.to_string());
        state.ordered.push(url.to_string());
        if state.ordered.len() >= self.max_urls {
            state.stopped = true;
        }
        true
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.state.lock().await.seen.contains(url)
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.ordered.len()
    }

    pub async fn record_page(&self) -> usize {
        let mut state = self.state.lock().await;
        state.pages += 1;
        state.pages
    }

    pub async fn page_count(&self) -> usize {
        self.state.lock().await.pages
    }

    /// The collected URLs in first-observation order.
    pub async fn into_urls(&self) -> Vec<String> {
        self.state.lock().await.ordered.clone()
    }
}

type HostLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bounded-depth same-host link walker.
pub struct HtmlWalker {
    client: reqwest::Client,
    fingerprints: Arc<FingerprintProvider>,
    limiters: Arc<RwLock<HashMap<String, Arc<HostLimiter>>>>,
}

impl HtmlWalker {
    pub fn new(fingerprints: Arc<FingerprintProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(20)
            .build()
            .unwrap_or_default();

        HtmlWalker {
            client,
            fingerprints,
            limiters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Walk the site from `seed`, inserting discovered URLs into `collector`
    /// and emitting progress events. Fetch errors are reported as events and
    /// never abort the walk.
    pub async fn walk(
        self: &Arc<Self>,
        seed: &Url,
        config: &WalkerConfig,
        collector: &Arc<UrlCollector>,
        events: &JobEvents,
    ) {
        let allowed = allowed_hosts(seed);
        let rate_per_second = rate_from_delay(config.delay);

        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        frontier.push_back((seed.to_string(), 0));

        let mut join_set: JoinSet<(String, u32, Result<Vec<String>, String>)> = JoinSet::new();

        loop {
            while join_set.len() < config.workers.max(1) {
                if collector.is_stopped().await {
                    frontier.clear();
                    break;
                }
                let Some((url, depth)) = frontier.pop_front() else {
                    break;
                };

                let walker = self.clone();
                let collector_ref = collector.clone();
                let allowed_ref = allowed.clone();
                let delay = config.delay;
                join_set.spawn(async move {
                    let result = walker
                        .fetch_page(&url, delay, rate_per_second, &collector_ref, &allowed_ref)
                        .await;
                    (url, depth, result)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((url, depth, Ok(links))) => {
                    let pages = collector.record_page().await;
                    let mut discovered = 0usize;
                    for link in links {
                        if collector.insert(&link).await {
                            discovered += 1;
                            events
                                .url_discovered(&link, depth + 1, collector.len().await, Tier::Html)
                                .await;
                            if depth + 1 <= config.depth {
                                frontier.push_back((link, depth + 1));
                            }
                        }
                    }
                    events
                        .progress(
                            &format!("Crawled {url} ({discovered} new links)"),
                            Some(&url),
                            Some(depth),
                            collector.len().await,
                            pages,
                            Some(Tier::Html),
                        )
                        .await;
                }
                Ok((url, _depth, Err(e))) => {
                    tracing::warn!(url = %url, error = %e, "Page fetch failed");
                    events.error(&format!("Failed to fetch {url}: {e}")).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Walker task panicked");
                }
            }
        }
    }

    /// Fetch one page and return its filtered same-host links.
    async fn fetch_page(
        &self,
        url: &str,
        delay: Duration,
        rate_per_second: u32,
        collector: &Arc<UrlCollector>,
        allowed: &HashSet<String>,
    ) -> Result<Vec<String>, String> {
        // Racy pre-check: a request already in flight when the cap latches
        // may still complete, bounded by the parallelism.
        if collector.is_stopped().await {
            return Ok(Vec::new());
        }

        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default();
        let limiter = self.host_limiter(&host, rate_per_second).await;
        limiter.until_ready().await;

        // Base delay plus equal jitter.
        let jitter_ms = if delay.as_millis() > 0 {
            rand::rng().random_range(0..=delay.as_millis() as u64)
        } else {
            0
        };
        tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;

        let mut request = self.client.get(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }
        // Force raw HTML so the body is parseable as-is.
        request = request.header("Accept-Encoding", "identity");

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {}", status.as_u16()));
        }

        let final_url = response.url().clone();
        let body = response.text().await.map_err(|e| e.to_string())?;

        Ok(extract_links(&body, &final_url, allowed))
    }

    async fn host_limiter(&self, host: &str, rate_per_second: u32) -> Arc<HostLimiter> {
        {
            let limiters = self.limiters.read().await;
            if let Some(limiter) = limiters.get(host) {
                return limiter.clone();
            }
        }

        let mut limiters = self.limiters.write().await;
        limiters
            .entry(host.to_string())
            .or_insert_with(|| {
                let rate = NonZeroU32::new(rate_per_second.max(1)).unwrap_or(nonzero_ext::nonzero!(1u32));
                Arc::new(RateLimiter::direct(Quota::per_second(rate)))
            })
            .clone()
    }
}

/// Requests per second implied by the base delay.
fn rate_from_delay(delay: Duration) -> u32 {
    let ms = delay.as_millis() as u64;
    if ms == 0 {
        10
    } else {
        ((1000 / ms).max(1)) as u32
    }
}

/// The seed host plus its `www.` toggle, lowercased.
pub fn allowed_hosts(seed: &Url) -> HashSet<String> {
    let mut hosts = HashSet::new();
    if let Some(host) = seed.host_str() {
        let host = host.to_lowercase();
        match host.strip_prefix("www.") {
            Some(bare) => {
                hosts.insert(bare.to_string());
                hosts.insert(host.clone());
            }
            None => {
                hosts.insert(format!("www.{host}"));
                hosts.insert(host.clone());
            }
        }
    }
    hosts
}

/// Extract, canonicalize, and filter same-host links from an HTML document.
pub fn extract_links(html: &str, base: &Url, allowed: &HashSet<String>) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("valid selector");

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(canonical) = canonicalize_link(href, base, allowed) else {
            continue;
        };
        if seen.insert(canonical.clone()) {
            out.push(canonical);
        }
    }
    out
}

/// Canonicalize an href: trim whitespace and control characters, resolve
/// against the base, drop the fragment, keep `scheme://host/path[?query]`.
/// Returns None for off-host links and deny-listed targets.
pub fn canonicalize_link(href: &str, base: &Url, allowed: &HashSet<String>) -> Option<String> {
    let cleaned: String = href
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let lowered = cleaned.to_lowercase();
    for prefix in DENY_HREF_PREFIXES {
        if lowered.starts_with(prefix) {
            return None;
        }
    }

    let mut resolved = base.join(&cleaned).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);

    let host = resolved.host_str()?.to_lowercase();
    if !allowed.contains(&host) {
        return None;
    }

    let path = resolved.path().to_lowercase();
    for prefix in DENY_PATH_PREFIXES {
        if path.starts_with(prefix) {
            return None;
        }
    }
    if let Some(ext) = path.rsplit('.').next() {
        if path.contains('.') && DENY_EXTENSIONS.contains(&ext) {
            return None;
        }
    }

    Some(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/docs/").unwrap()
    }

    fn hosts() -> HashSet<String> {
        allowed_hosts(&Url::parse("https://example.com/").unwrap())
    }

    #[test]
    fn test_allowed_hosts_toggle() {
        let hosts = hosts();
        assert!(hosts.contains("example.com"));
        assert!(hosts.contains("www.example.com"));

        let www = allowed_hosts(&Url::parse("https://www.example.com/").unwrap());
        assert!(www.contains("example.com"));
        assert!(www.contains("www.example.com"));
    }

    #[test]
    fn test_canonicalize_strips_fragment() {
        let url = canonicalize_link("/page#section", &base(), &hosts()).unwrap();
        assert_eq!(url, "https://example.com/page");
    }

    #[test]
    fn test_canonicalize_keeps_query() {
        let url = canonicalize_link("/search?q=rust", &base(), &hosts()).unwrap();
        assert_eq!(url, "https://example.com/search?q=rust");
    }

    #[test]
    fn test_canonicalize_relative() {
        let url = canonicalize_link("guide.html", &base(), &hosts()).unwrap();
        assert_eq!(url, "https://example.com/docs/guide.html");
    }

    #[test]
    fn test_off_host_rejected() {
        assert!(canonicalize_link("https://other.com/page", &base(), &hosts()).is_none());
    }

    #[test]
    fn test_www_sibling_allowed() {
        let url = canonicalize_link("https://www.example.com/page", &base(), &hosts()).unwrap();
        assert_eq!(url, "https://www.example.com/page");
    }

    #[test]
    fn test_deny_schemes() {
        for href in ["mailto:x@example.com", "tel:+123", "javascript:void(0)", "#top"] {
            assert!(canonicalize_link(href, &base(), &hosts()).is_none(), "{href}");
        }
    }

    #[test]
    fn test_deny_extensions() {
        for href in ["/logo.png", "/video.mp4", "/styles.css", "/app.js", "/report.docx", "/backup.tar.gz"] {
            assert!(canonicalize_link(href, &base(), &hosts()).is_none(), "{href}");
        }
        assert!(canonicalize_link("/page.html", &base(), &hosts()).is_some());
    }

    #[test]
    fn test_deny_path_prefixes() {
        for href in ["/admin/users", "/login", "/api/v1/x", "/assets/app", "/static/x", "/images/hero"] {
            assert!(canonicalize_link(href, &base(), &hosts()).is_none(), "{href}");
        }
    }

    #[test]
    fn test_control_chars_removed() {
        let url = canonicalize_link("  /pa\u{0}ge\t ", &base(), &hosts()).unwrap();
        assert_eq!(url, "https://example.com/page");
    }

    #[test]
    fn test_extract_links_dedup_within_page() {
        let html = r#"<a href="/a">1</a><a href="/a">2</a><a href="/b">3</a>"#;
        let links = extract_links(html, &base(), &hosts());
        assert_eq!(
            links,
            vec!["https://example.com/a", "https://example.com/b"]
        );
    }

    #[test]
    fn test_extract_links_filters() {
        let html = r#"
            <a href="/keep">keep</a>
            <a href="/logo.svg">img</a>
            <a href="mailto:a@b.c">mail</a>
            <a href="https://elsewhere.org/">ext</a>
        "#;
        let links = extract_links(html, &base(), &hosts());
        assert_eq!(links, vec!["https://example.com/keep"]);
    }

    #[test]
    fn test_rate_from_delay() {
        assert_eq!(rate_from_delay(Duration::from_millis(200)), 5);
        assert_eq!(rate_from_delay(Duration::from_millis(2000)), 1);
        assert_eq!(rate_from_delay(Duration::ZERO), 10);
    }

    #[tokio::test]
    async fn test_collector_dedup_and_order() {
        let collector = UrlCollector::new(10);
        assert!(collector.insert("https://example.com/a").await);
        assert!(!collector.insert("https://example.com/a").await);
        assert!(collector.insert("https://example.com/b").await);
        assert_eq!(
            collector.into_urls().await,
            vec!["https://example.com/a", "https://example.com/b"]
        );
    }

    #[tokio::test]
    async fn test_collector_cap_latches_stop() {
        let collector = UrlCollector::new(2);
        assert!(collector.insert("https://example.com/a").await);
        assert!(collector.insert("https://example.com/b").await);
        assert!(collector.is_stopped().await);
        assert!(!collector.insert("https://example.com/c").await);
        assert_eq!(collector.len().await, 2);
    }

    #[tokio::test]
    async fn test_collector_page_counter() {
        let collector = UrlCollector::new(10);
        assert_eq!(collector.record_page().await, 1);
        assert_eq!(collector.record_page().await, 2);
        assert_eq!(collector.page_count().await, 2);
    }
}
