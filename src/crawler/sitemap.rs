use async_recursion::async_recursion;
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::fingerprint::FingerprintProvider;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Conventional sitemap locations probed during discovery.
const WELL_KNOWN_PATHS: &[&str] = &[
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemaps.xml",
    "/sitemap/sitemap.xml",
];

#[derive(Error, Debug)]
pub enum SitemapError {
    #[error("Failed to fetch sitemap: {0}")]
    Fetch(String),
    #[error("Malformed sitemap XML at {0}")]
    Malformed(String),
    #[error("Gzip decode failed: {0}")]
    Gzip(String),
}

/// Discovers and parses sitemaps: conventional paths, robots.txt directives,
/// url-sets and recursive sitemap-indexes, with transparent gzip handling.
pub struct SitemapResolver {
    client: reqwest::Client,
    fingerprints: Arc<FingerprintProvider>,
    loc_re: Regex,
}

impl SitemapResolver {
    pub fn new(fingerprints: Arc<FingerprintProvider>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();

        SitemapResolver {
            client,
            fingerprints,
            loc_re: Regex::new(r"<loc>\s*(.*?)\s*</loc>").expect("valid regex"),
        }
    }

    /// Find sitemap URLs for a reachable base: probe conventional paths with
    /// HEAD, then mine robots.txt `Sitemap:` directives.
    pub async fn discover(&self, base: &Url) -> Vec<String> {
        let mut found = Vec::new();

        for path in WELL_KNOWN_PATHS {
            if let Ok(candidate) = base.join(path) {
                if self.head_ok(candidate.as_str()).await {
                    found.push(candidate.to_string());
                }
            }
        }

        for url in self.sitemaps_from_robots(base).await {
            if !found.contains(&url) {
                found.push(url);
            }
        }

        tracing::info!(base = %base, count = found.len(), "Sitemap discovery complete");
        found
    }

    /// Mine robots.txt for `Sitemap:` directives without probing the results.
    /// This is the fallback path when the base host itself is unreachable.
    pub async fn sitemaps_from_robots(&self, base: &Url) -> Vec<String> {
        let robots_url = match base.join("/robots.txt") {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };

        let body = match self.fetch_text(robots_url.as_str()).await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(url = %robots_url, error = %e, "robots.txt fetch failed");
                return Vec::new();
            }
        };

        robots_sitemap_directives(&body, base)
    }

    /// Fetch and parse a sitemap into its URLs. Sitemap-indexes recurse into
    /// each child; child fetch failures log and continue.
    #[async_recursion]
    pub async fn parse(&self, sitemap_url: &str) -> Result<Vec<String>, SitemapError> {
        let xml = self.fetch_sitemap_body(sitemap_url).await?;

        if xml.contains("<sitemapindex") {
            let children = extract_locs(&self.loc_re, &xml);
            let mut urls = Vec::new();
            for child in children {
                match self.parse(&child).await {
                    Ok(mut child_urls) => urls.append(&mut child_urls),
                    Err(e) => {
                        tracing::warn!(sitemap = %child, error = %e, "Child sitemap failed, continuing");
                    }
                }
            }
            Ok(urls)
        } else if xml.contains("<urlset") {
            Ok(extract_locs(&self.loc_re, &xml))
        } else {
            Err(SitemapError::Malformed(sitemap_url.to_string()))
        }
    }

    async fn head_ok(&self, url: &str) -> bool {
        let mut request = self.client.head(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(_) => false,
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String, SitemapError> {
        let mut request = self.client.get(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| SitemapError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SitemapError::Fetch(format!(
                "status {} from {url}",
                resp.status().as_u16()
            )));
        }
        resp.text().await.map_err(|e| SitemapError::Fetch(e.to_string()))
    }

    /// Fetch raw sitemap bytes and gunzip when the payload carries the gzip
    /// magic (covers `.xml.gz` bodies the transport did not decode).
    async fn fetch_sitemap_body(&self, url: &str) -> Result<String, SitemapError> {
        let mut request = self.client.get(url);
        for (name, value) in self.fingerprints.browser_headers() {
            request = request.header(name, value);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| SitemapError::Fetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(SitemapError::Fetch(format!(
                "status {} from {url}",
                resp.status().as_u16()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SitemapError::Fetch(e.to_string()))?;
        decode_body(&bytes)
    }
}

/// Gunzip when the gzip magic is present, else decode as UTF-8.
fn decode_body(bytes: &[u8]) -> Result<String, SitemapError> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(|e| SitemapError::Gzip(e.to_string()))?;
        Ok(out)
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Extract non-empty `<loc>` values from sitemap XML.
fn extract_locs(re: &Regex, xml: &str) -> Vec<String> {
    re.captures_iter(xml)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|loc| !loc.is_empty())
        .collect()
}

/// Scan robots.txt content for `Sitemap:` directives (case-insensitive,
/// leading whitespace tolerated); relative values resolve against the base.
fn robots_sitemap_directives(content: &str, base: &Url) -> Vec<String> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim_start();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("sitemap") {
            continue;
        }
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let resolved = if value.starts_with("http://") || value.starts_with("https://") {
            value.to_string()
        } else {
            match base.join(value) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            }
        };
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn loc_re() -> Regex {
        Regex::new(r"<loc>\s*(.*?)\s*</loc>").unwrap()
    }

    #[test]
    fn test_extract_locs_urlset() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/</loc></url>
  <url><loc>https://example.com/über-uns</loc></url>
  <url><loc>  https://example.com/blog  </loc></url>
</urlset>"#;
        let urls = extract_locs(&loc_re(), xml);
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[1], "https://example.com/über-uns");
        assert_eq!(urls[2], "https://example.com/blog");
    }

    #[test]
    fn test_extract_locs_skips_empty() {
        let xml = "<urlset><url><loc></loc></url><url><loc>https://a.com/x</loc></url></urlset>";
        let urls = extract_locs(&loc_re(), xml);
        assert_eq!(urls, vec!["https://a.com/x"]);
    }

    #[test]
    fn test_robots_sitemap_directives() {
        let base = Url::parse("https://example.com/").unwrap();
        let robots = "User-agent: *\nDisallow: /admin\n  sitemap: https://example.com/sitemap.xml\nSITEMAP: /relative-sitemap.xml\nSitemap:\n";
        let found = robots_sitemap_directives(robots, &base);
        assert_eq!(
            found,
            vec![
                "https://example.com/sitemap.xml",
                "https://example.com/relative-sitemap.xml",
            ]
        );
    }

    #[test]
    fn test_robots_duplicate_directives_deduped() {
        let base = Url::parse("https://example.com/").unwrap();
        let robots = "Sitemap: https://example.com/s.xml\nSitemap: https://example.com/s.xml\n";
        let found = robots_sitemap_directives(robots, &base);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_decode_body_plain() {
        let xml = "<urlset></urlset>";
        assert_eq!(decode_body(xml.as_bytes()).unwrap(), xml);
    }

    #[test]
    fn test_decode_body_gzip() {
        let xml = "<urlset><url><loc>https://example.com/page</loc></url></urlset>";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(&compressed).unwrap();
        assert_eq!(decoded, xml);
    }

    #[test]
    fn test_decode_body_corrupt_gzip_errors() {
        let bytes = [0x1f, 0x8b, 0x00, 0x01, 0x02];
        assert!(decode_body(&bytes).is_err());
    }

    #[test]
    fn test_sitemapindex_detection() {
        let index = r#"<sitemapindex><sitemap><loc>https://a.com/s1.xml</loc></sitemap></sitemapindex>"#;
        assert!(index.contains("<sitemapindex"));
        let children = extract_locs(&loc_re(), index);
        assert_eq!(children, vec!["https://a.com/s1.xml"]);
    }
}
