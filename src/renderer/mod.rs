use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::workers::browser_pool::{BrowserPool, BrowserPoolError};

/// Rendered DOM shorter than this (trimmed) is treated as a failed render.
const MIN_RENDERED_BYTES: usize = 100;
/// Pause between incremental scroll steps to let lazy content load.
const SCROLL_PAUSE: Duration = Duration::from_millis(800);
const SCROLL_STEPS: usize = 5;
const SETTLE_PAUSE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Pool(#[from] BrowserPoolError),
    #[error("Navigation failed: {0}")]
    Navigation(String),
    #[error("Navigation timed out after {0}s")]
    Timeout(u64),
    #[error("Rendered DOM too small ({0} bytes)")]
    EmptyRender(usize),
    #[error("Page operation failed: {0}")]
    Page(String),
}

/// Renders a URL in a leased headless browser, scrolling to trigger lazy
/// content before extracting the DOM.
pub struct HeadlessRenderer {
    pool: Arc<BrowserPool>,
}

impl HeadlessRenderer {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        HeadlessRenderer { pool }
    }

    pub async fn render(&self, url: &str, timeout: Duration) -> Result<String, RendererError> {
        let lease = self.pool.get().await?;

        let page = lease
            .browser()
            .new_page("about:blank")
            .await
            .map_err(|e| RendererError::Page(e.to_string()))?;

        let result = self.render_on_page(&page, url, timeout).await;

        if let Err(e) = page.close().await {
            tracing::debug!(url = %url, error = %e, "Page close failed");
        }

        result
    }

    async fn render_on_page(
        &self,
        page: &chromiumoxide::page::Page,
        url: &str,
        timeout: Duration,
    ) -> Result<String, RendererError> {
        tokio::time::timeout(timeout, page.goto(url))
            .await
            .map_err(|_| RendererError::Timeout(timeout.as_secs()))?
            .map_err(|e| RendererError::Navigation(e.to_string()))?;

        // Load-event waits fail on some hostile pages; the scroll pass below
        // still produces usable DOM, so log and continue.
        if let Err(e) = page.wait_for_navigation().await {
            tracing::debug!(url = %url, error = %e, "wait_for_navigation failed");
        }

        for _ in 0..SCROLL_STEPS {
            if let Err(e) = page
                .evaluate("window.scrollBy(0, window.innerHeight)")
                .await
            {
                tracing::debug!(url = %url, error = %e, "Scroll step failed");
            }
            tokio::time::sleep(SCROLL_PAUSE).await;
        }

        if let Err(e) = page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
        {
            tracing::debug!(url = %url, error = %e, "Terminal scroll failed");
        }
        tokio::time::sleep(SETTLE_PAUSE).await;

        let html = page
            .content()
            .await
            .map_err(|e| RendererError::Page(e.to_string()))?;

        let trimmed_len = html.trim().len();
        if trimmed_len < MIN_RENDERED_BYTES {
            return Err(RendererError::EmptyRender(trimmed_len));
        }

        Ok(html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_render_threshold() {
        // The threshold guards against about:blank and error interstitials.
        assert_eq!(MIN_RENDERED_BYTES, 100);
        let tiny = "<html></html>";
        assert!(tiny.trim().len() < MIN_RENDERED_BYTES);
    }

    #[test]
    fn test_error_display() {
        let e = RendererError::EmptyRender(12);
        assert!(e.to_string().contains("12 bytes"));
        let e = RendererError::Timeout(30);
        assert!(e.to_string().contains("30s"));
    }
}
