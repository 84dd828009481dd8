use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::fingerprint::FingerprintProvider;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REDIRECTS: usize = 5;

/// Record of a reachability probe: which URL was asked for, which variant
/// answered, and the last error seen along the way.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub original_url: String,
    pub fallback_url: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Finds a reachable variant of a URL by permuting the `www.` prefix and
/// upgrading http to https.
pub struct ReachabilityProber {
    client: reqwest::Client,
    fingerprints: Arc<FingerprintProvider>,
}

impl ReachabilityProber {
    pub fn new(fingerprints: Arc<FingerprintProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_default();

        ReachabilityProber {
            client,
            fingerprints,
        }
    }

    /// Try the original URL, then its fallback variants in order. The first
    /// reachable variant wins; when none answers the original URL is returned
    /// with `success = false`.
    pub async fn find(&self, original: &str) -> (String, ProbeOutcome) {
        let mut last_error = None;

        for candidate in candidates(original) {
            match self.try_url(&candidate).await {
                Ok(final_url) => {
                    if final_url != original {
                        tracing::info!(original = %original, chosen = %final_url, "Reachability fallback chosen");
                    }
                    let outcome = ProbeOutcome {
                        original_url: original.to_string(),
                        fallback_url: final_url.clone(),
                        success: true,
                        error: last_error,
                    };
                    return (final_url, outcome);
                }
                Err(e) => {
                    tracing::debug!(url = %candidate, error = %e, "Probe failed");
                    last_error = Some(e);
                }
            }
        }

        let outcome = ProbeOutcome {
            original_url: original.to_string(),
            fallback_url: original.to_string(),
            success: false,
            error: last_error,
        };
        (original.to_string(), outcome)
    }

    /// Probe one candidate; Ok carries the final URL after redirects.
    async fn try_url(&self, url: &str) -> Result<String, String> {
        // Human-like pause before the probe request.
        let pause = rand::rng().random_range(0..1000);
        tokio::time::sleep(Duration::from_millis(pause)).await;

        let mut request = self.client.get(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();

        if status.is_success() || status.is_redirection() {
            Ok(response.url().to_string())
        } else if status.as_u16() == 403 {
            Err(format!("access forbidden (403) at {url}"))
        } else {
            Err(format!("unexpected status {} at {url}", status.as_u16()))
        }
    }
}

/// Candidate URLs in probe order: the original, the `www.` toggle, and for
/// http schemes the https upgrade of both host variants.
pub fn candidates(original: &str) -> Vec<String> {
    let mut out = vec![original.to_string()];

    let parsed = match Url::parse(original) {
        Ok(u) => u,
        Err(_) => return out,
    };
    let host = match parsed.host_str() {
        Some(h) => h.to_string(),
        None => return out,
    };

    let toggled_host = toggle_www(&host);
    if let Some(u) = with_host(&parsed, &toggled_host) {
        push_unique(&mut out, u);
    }

    if parsed.scheme() == "http" {
        for h in [host.as_str(), toggled_host.as_str()] {
            if let Some(u) = with_scheme_host(&parsed, "https", h) {
                push_unique(&mut out, u);
            }
        }
    }

    out
}

fn toggle_www(host: &str) -> String {
    match host.strip_prefix("www.") {
        Some(bare) => bare.to_string(),
        None => format!("www.{host}"),
    }
}

fn with_host(url: &Url, host: &str) -> Option<String> {
    let mut u = url.clone();
    u.set_host(Some(host)).ok()?;
    Some(u.to_string())
}

fn with_scheme_host(url: &Url, scheme: &str, host: &str) -> Option<String> {
    let mut u = url.clone();
    u.set_scheme(scheme).ok()?;
    u.set_host(Some(host)).ok()?;
    Some(u.to_string())
}

fn push_unique(out: &mut Vec<String>, url: String) {
    if !out.contains(&url) {
        out.push(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_http_bare_host() {
        let c = candidates("http://example.com/page");
        assert_eq!(
            c,
            vec![
                "http://example.com/page",
                "http://www.example.com/page",
                "https://example.com/page",
                "https://www.example.com/page",
            ]
        );
    }

    #[test]
    fn test_candidates_https_www_host() {
        let c = candidates("https://www.example.com/");
        assert_eq!(
            c,
            vec!["https://www.example.com/", "https://example.com/"]
        );
    }

    #[test]
    fn test_candidates_invalid_url_passthrough() {
        let c = candidates("not a url");
        assert_eq!(c, vec!["not a url"]);
    }

    #[test]
    fn test_toggle_www() {
        assert_eq!(toggle_www("example.com"), "www.example.com");
        assert_eq!(toggle_www("www.example.com"), "example.com");
    }

    #[test]
    fn test_candidates_are_unique() {
        for seed in ["http://example.com/", "https://www.a.io/x?q=1"] {
            let c = candidates(seed);
            let mut dedup = c.clone();
            dedup.dedup();
            assert_eq!(c.len(), dedup.len());
        }
    }
}
