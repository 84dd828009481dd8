use rand::seq::IndexedRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// How long a fetched catalog stays fresh before a background refresh runs.
const CATALOG_TTL: Duration = Duration::from_secs(3600);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Static fallback pool of modern desktop user agents.
const FALLBACK_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.0.0",
];

struct Catalog {
    user_agents: Vec<String>,
    header_sets: Vec<HashMap<String, String>>,
    fetched_at: Option<Instant>,
}

impl Catalog {
    fn fallback() -> Self {
        Catalog {
            user_agents: FALLBACK_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            header_sets: vec![baseline_headers()],
            fetched_at: None,
        }
    }

    fn is_stale(&self) -> bool {
        match self.fetched_at {
            Some(at) => at.elapsed() > CATALOG_TTL,
            None => true,
        }
    }
}

/// Baseline browser header set used when the upstream catalog is unavailable.
fn baseline_headers() -> HashMap<String, String> {
    let mut h = HashMap::new();
    h.insert("Accept".to_string(), "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8".to_string());
    h.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());
    h.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
    h.insert("DNT".to_string(), "1".to_string());
    h.insert("Sec-Fetch-Dest".to_string(), "document".to_string());
    h.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
    h.insert("Sec-Fetch-Site".to_string(), "none".to_string());
    h.insert("Sec-Fetch-User".to_string(), "?1".to_string());
    h.insert(
        "Upgrade-Insecure-Requests".to_string(),
        "1".to_string(),
    );
    h.insert("Connection".to_string(), "keep-alive".to_string());
    h
}

#[derive(Debug, Deserialize)]
struct UserAgentResponse {
    result: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HeaderSetResponse {
    result: Vec<HashMap<String, String>>,
}

/// Process-wide supplier of randomized browser fingerprints.
///
/// Reads clone an `Arc` snapshot of the catalog; a background task replaces
/// the snapshot wholesale when it goes stale. Upstream failures keep the
/// previous catalog.
pub struct FingerprintProvider {
    catalog: RwLock<Arc<Catalog>>,
    refreshing: AtomicBool,
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl FingerprintProvider {
    pub fn new(api_url: &str, api_key: &str) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .unwrap_or_default();

        Arc::new(FingerprintProvider {
            catalog: RwLock::new(Arc::new(Catalog::fallback())),
            refreshing: AtomicBool::new(false),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    /// A random user agent from the current catalog.
    pub fn user_agent(self: &Arc<Self>) -> String {
        self.maybe_refresh();
        let catalog = self.snapshot();
        catalog
            .user_agents
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENTS[0].to_string())
    }

    /// A random full browser header set, always including a User-Agent.
    pub fn browser_headers(self: &Arc<Self>) -> HashMap<String, String> {
        self.maybe_refresh();
        let catalog = self.snapshot();
        let mut headers = catalog
            .header_sets
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(baseline_headers);
        headers
            .entry("User-Agent".to_string())
            .or_insert_with(|| self.user_agent_no_refresh());
        headers
    }

    /// User agents for the aggressive extraction tier: the whole catalog.
    pub fn user_agent_profiles(self: &Arc<Self>) -> Vec<String> {
        self.snapshot().user_agents.clone()
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| Arc::new(Catalog::fallback()))
    }

    fn user_agent_no_refresh(&self) -> String {
        self.snapshot()
            .user_agents
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENTS[0].to_string())
    }

    /// Kick off a background refresh when the catalog is stale. Only one
    /// refresh runs at a time; callers never wait on it.
    fn maybe_refresh(self: &Arc<Self>) {
        if self.api_key.is_empty() || !self.snapshot().is_stale() {
            return;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let provider = self.clone();
        tokio::spawn(async move {
            match provider.fetch_catalog().await {
                Ok(catalog) => {
                    if let Ok(mut guard) = provider.catalog.write() {
                        *guard = Arc::new(catalog);
                    }
                    tracing::info!("Fingerprint catalog refreshed");
                }
                Err(e) => {
                    // Keep serving the previous catalog.
                    tracing::warn!(error = %e, "Fingerprint catalog refresh failed");
                }
            }
            provider.refreshing.store(false, Ordering::Release);
        });
    }

    async fn fetch_catalog(&self) -> Result<Catalog, reqwest::Error> {
        let ua_url = format!("{}/user-agents?api_key={}", self.api_url, self.api_key);
        let headers_url = format!("{}/browser-headers?api_key={}", self.api_url, self.api_key);

        let agents: UserAgentResponse = self
            .client
            .get(&ua_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let header_sets: HeaderSetResponse = self
            .client
            .get(&headers_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let user_agents = if agents.result.is_empty() {
            FALLBACK_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            agents.result
        };
        let header_sets = if header_sets.result.is_empty() {
            vec![baseline_headers()]
        } else {
            header_sets.result
        };

        Ok(Catalog {
            user_agents,
            header_sets,
            fetched_at: Some(Instant::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_pool_size() {
        assert!(FALLBACK_USER_AGENTS.len() >= 8);
    }

    #[tokio::test]
    async fn test_user_agent_from_fallback() {
        let provider = FingerprintProvider::new("", "");
        let ua = provider.user_agent();
        assert!(FALLBACK_USER_AGENTS.contains(&ua.as_str()));
    }

    #[tokio::test]
    async fn test_browser_headers_include_user_agent() {
        let provider = FingerprintProvider::new("", "");
        let headers = provider.browser_headers();
        assert!(headers.contains_key("User-Agent"));
        assert!(headers.contains_key("Accept"));
        assert!(headers.contains_key("Accept-Language"));
        assert!(headers.contains_key("Upgrade-Insecure-Requests"));
    }

    #[test]
    fn test_catalog_staleness() {
        let fallback = Catalog::fallback();
        assert!(fallback.is_stale());

        let fresh = Catalog {
            user_agents: vec!["ua".to_string()],
            header_sets: vec![],
            fetched_at: Some(Instant::now()),
        };
        assert!(!fresh.is_stale());
    }

    #[test]
    fn test_catalog_response_parsing() {
        let json = r#"{"result":["ua-1","ua-2"]}"#;
        let parsed: UserAgentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result.len(), 2);

        let json = r#"{"result":[{"Accept":"text/html","User-Agent":"ua-1"}]}"#;
        let parsed: HeaderSetResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.result[0]["Accept"], "text/html");
    }
}
