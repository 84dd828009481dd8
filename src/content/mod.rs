pub mod markdown;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::fingerprint::FingerprintProvider;
use crate::models::ContentResponse;
use crate::renderer::HeadlessRenderer;

/// Markdown shorter than this (trimmed) does not count as a successful
/// extraction and the next tier runs.
const MIN_MARKDOWN_CHARS: usize = 100;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Fallback UA profiles to rotate through in the aggressive tier.
const AGGRESSIVE_ATTEMPTS: usize = 6;

/// Fetches a single URL through escalating strategies and emits Markdown:
/// headless render, then a plain browser-headed GET, then an aggressive pass
/// rotating fingerprints with escalating pacing.
pub struct ContentExtractor {
    fingerprints: Arc<FingerprintProvider>,
    renderer: Option<HeadlessRenderer>,
    plain_client: reqwest::Client,
    aggressive_client: reqwest::Client,
}

impl ContentExtractor {
    pub fn new(fingerprints: Arc<FingerprintProvider>, renderer: Option<HeadlessRenderer>) -> Self {
        let plain_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_default();
        let aggressive_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();

        ContentExtractor {
            fingerprints,
            renderer,
            plain_client,
            aggressive_client,
        }
    }

    /// Extract one URL. Never returns an Err: total failure is a
    /// `ContentResponse` whose error field concatenates per-tier reasons.
    pub async fn extract(&self, url: &str) -> ContentResponse {
        let mut failures: Vec<String> = Vec::new();
        let mut last_status: u16 = 0;

        // Tier 1: rendered fetch.
        if let Some(renderer) = &self.renderer {
            match renderer.render(url, Duration::from_secs(30)).await {
                Ok(html) => {
                    let md = markdown::html_to_markdown(&html);
                    if md.trim().len() > MIN_MARKDOWN_CHARS {
                        return ContentResponse {
                            url: url.to_string(),
                            status_code: 200,
                            content_type: "text/html".to_string(),
                            size: md.len(),
                            markdown: md,
                            headers: HashMap::new(),
                            error: String::new(),
                        };
                    }
                    failures.push("rendered output below content threshold".to_string());
                }
                Err(e) => failures.push(format!("rendered fetch: {e}")),
            }
        }

        // Tier 2: plain HTTP with browser headers.
        match self.plain_fetch(url).await {
            Ok(fetched) => {
                last_status = fetched.status;
                if fetched.status == 403 || fetched.status == 429 {
                    failures.push(format!("blocked with status {}", fetched.status));
                } else if !(200..300).contains(&fetched.status) {
                    failures.push(format!("http status {}", fetched.status));
                } else if let Some(resp) = build_response(&fetched, &mut failures) {
                    return resp;
                }
            }
            Err(e) => failures.push(format!("http fetch: {e}")),
        }

        // Tier 3: aggressive fingerprint rotation.
        match self.aggressive_fetch(url).await {
            Ok(fetched) => {
                last_status = fetched.status;
                let md = if is_html(&fetched.content_type) {
                    markdown::html_to_markdown(&fetched.body)
                } else {
                    fetched.body.clone()
                };
                return ContentResponse {
                    url: fetched.final_url.clone(),
                    status_code: fetched.status,
                    content_type: fetched.content_type.clone(),
                    size: md.len(),
                    markdown: md,
                    headers: fetched.headers.clone(),
                    error: String::new(),
                };
            }
            Err(e) => failures.push(format!("aggressive fetch: {e}")),
        }

        ContentResponse::failure(url, last_status, failures.join("; "))
    }

    async fn plain_fetch(&self, url: &str) -> Result<Fetched, String> {
        let mut request = self.plain_client.get(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }
        request = request.header("Accept-Encoding", "identity");

        let response = request.send().await.map_err(|e| e.to_string())?;
        Fetched::from_response(response).await
    }

    /// Rotate user-agent profiles with escalating pacing and referer
    /// rotation until one answers 2xx.
    async fn aggressive_fetch(&self, url: &str) -> Result<Fetched, String> {
        let profiles = self.fingerprints.user_agent_profiles();
        let mut last_error = "no user-agent profiles available".to_string();

        for (attempt, ua) in profiles.iter().take(AGGRESSIVE_ATTEMPTS).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            let mut request = self
                .aggressive_client
                .get(url)
                .header("User-Agent", ua.as_str())
                .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
                .header("Accept-Language", "en-US,en;q=0.9")
                .header("Accept-Encoding", "identity");

            if attempt >= 3 {
                request = request.header("Referer", "https://www.bing.com/");
            } else if attempt >= 1 {
                request = request.header("Referer", "https://www.google.com/");
            }

            if ua.contains("Chrome") {
                request = request
                    .header("Sec-Fetch-Dest", "document")
                    .header("Sec-Fetch-Mode", "navigate")
                    .header("Sec-Fetch-Site", "cross-site")
                    .header("Sec-Fetch-User", "?1");
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        return Fetched::from_response(response).await;
                    }
                    last_error = format!("status {status} on attempt {}", attempt + 1);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(last_error)
    }
}

struct Fetched {
    status: u16,
    content_type: String,
    body: String,
    headers: HashMap<String, String>,
    final_url: String,
}

impl Fetched {
    async fn from_response(response: reqwest::Response) -> Result<Fetched, String> {
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), v.to_string());
            }
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(Fetched {
            status,
            content_type,
            body,
            headers,
            final_url,
        })
    }
}

fn is_html(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html") || ct.contains("application/xhtml") || ct.is_empty()
}

/// Turn a 2xx plain fetch into a response, or record why it fell short.
fn build_response(fetched: &Fetched, failures: &mut Vec<String>) -> Option<ContentResponse> {
    if is_html(&fetched.content_type) {
        let md = markdown::html_to_markdown(&fetched.body);
        if md.trim().len() > MIN_MARKDOWN_CHARS {
            return Some(ContentResponse {
                url: fetched.final_url.clone(),
                status_code: fetched.status,
                content_type: fetched.content_type.clone(),
                size: md.len(),
                markdown: md,
                headers: fetched.headers.clone(),
                error: String::new(),
            });
        }
        failures.push("converted markdown below content threshold".to_string());
        None
    } else {
        // Non-HTML payloads pass through verbatim with their content type.
        Some(ContentResponse {
            url: fetched.final_url.clone(),
            status_code: fetched.status,
            content_type: fetched.content_type.clone(),
            size: fetched.body.len(),
            markdown: fetched.body.clone(),
            headers: fetched.headers.clone(),
            error: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_html() {
        assert!(is_html("text/html; charset=utf-8"));
        assert!(is_html("application/xhtml+xml"));
        assert!(is_html(""));
        assert!(!is_html("application/json"));
        assert!(!is_html("text/plain"));
    }

    #[test]
    fn test_build_response_html_below_threshold() {
        let fetched = Fetched {
            status: 200,
            content_type: "text/html".to_string(),
            body: "<html><body><p>tiny</p></body></html>".to_string(),
            headers: HashMap::new(),
            final_url: "https://example.com/".to_string(),
        };
        let mut failures = Vec::new();
        assert!(build_response(&fetched, &mut failures).is_none());
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_build_response_non_html_verbatim() {
        let body = r#"{"key":"value"}"#;
        let fetched = Fetched {
            status: 200,
            content_type: "application/json".to_string(),
            body: body.to_string(),
            headers: HashMap::new(),
            final_url: "https://example.com/data.json".to_string(),
        };
        let mut failures = Vec::new();
        let resp = build_response(&fetched, &mut failures).unwrap();
        assert_eq!(resp.markdown, body);
        assert_eq!(resp.content_type, "application/json");
        assert!(resp.is_success());
        assert!(failures.is_empty());
    }

    #[test]
    fn test_build_response_html_success() {
        let long_para = "This paragraph carries enough prose to clear the minimum content threshold used by the extractor tiers. ".repeat(3);
        let body = format!("<html><head><title>Doc</title></head><body><p>{long_para}</p></body></html>");
        let fetched = Fetched {
            status: 200,
            content_type: "text/html".to_string(),
            body,
            headers: HashMap::new(),
            final_url: "https://example.com/doc".to_string(),
        };
        let mut failures = Vec::new();
        let resp = build_response(&fetched, &mut failures).unwrap();
        assert!(resp.markdown.starts_with("# Doc"));
        assert_eq!(resp.size, resp.markdown.len());
    }

    #[tokio::test]
    async fn test_extract_total_failure_concatenates_reasons() {
        let fingerprints = FingerprintProvider::new("", "");
        // Port 9 (discard) refuses connections immediately.
        let extractor = ContentExtractor::new(fingerprints, None);
        let resp = extractor.extract("http://127.0.0.1:9/").await;
        assert!(!resp.is_success());
        assert!(resp.error.contains("http fetch"));
        assert!(resp.error.contains("aggressive fetch"));
        assert!(resp.error.contains("; "));
    }
}
