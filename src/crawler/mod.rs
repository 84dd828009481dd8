pub mod probe;
pub mod sitemap;
pub mod walker;

use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::bus::{EventBus, JobEvents};
use crate::fingerprint::FingerprintProvider;
use crate::jobs::JobRegistry;
use crate::models::{generate_id, CrawlRequest, CrawlResult, CrawlSettings, Tier};
use crate::renderer::HeadlessRenderer;
use crate::workers::browser_pool::BrowserPool;
use self::probe::ReachabilityProber;
use self::sitemap::SitemapResolver;
use self::walker::{
    allowed_hosts, canonicalize_link, extract_links, HtmlWalker, UrlCollector, WalkerConfig,
};

/// The HTML and headless tiers only run while discovery sits below this yield.
const FALLBACK_TIER_THRESHOLD: usize = 10;

/// Everything a crawl executor needs, shared process-wide.
pub struct CrawlContext {
    pub fingerprints: Arc<FingerprintProvider>,
    pub registry: Arc<JobRegistry>,
    pub bus: Option<Arc<EventBus>>,
    pub browser_pool: Arc<BrowserPool>,
}

/// Detach a crawl executor for an accepted job. The task owns the job's
/// lifecycle from here to its terminal state.
pub fn spawn_crawl(ctx: Arc<CrawlContext>, job_id: String, request: CrawlRequest) {
    tokio::spawn(async move {
        execute_crawl(ctx, job_id, request).await;
    });
}

/// Run the tiered discovery pipeline for one job and drive it to a terminal
/// state. Individual tier failures become error events; only an unreachable
/// seed with no robots-derived sitemaps fails the job.
pub async fn execute_crawl(ctx: Arc<CrawlContext>, job_id: String, request: CrawlRequest) {
    let start = Instant::now();
    let events = JobEvents::new(ctx.bus.clone(), &job_id);
    let plan = request.tier_plan();
    let prober = ReachabilityProber::new(ctx.fingerprints.clone());
    let resolver = SitemapResolver::new(ctx.fingerprints.clone());

    events
        .progress("Probing seed reachability", Some(&request.url), None, 0, 0, None)
        .await;

    let (target_url, outcome) = prober.find(&request.url).await;

    // Unreachable seed: fall back to sitemaps mined from robots.txt alone.
    let mut robots_only_sitemaps: Vec<String> = Vec::new();
    if !outcome.success {
        if let Ok(base) = Url::parse(&request.url) {
            robots_only_sitemaps = resolver.sitemaps_from_robots(&base).await;
        }
        if robots_only_sitemaps.is_empty() {
            let detail = outcome
                .error
                .as_deref()
                .unwrap_or("no response from any variant");
            let diagnostic = format!(
                "Seed URL {} is unreachable and all fallbacks are inaccessible: {detail}",
                request.url
            );
            tracing::warn!(job_id = %job_id, "{diagnostic}");
            ctx.registry.fail(&job_id, &diagnostic).await;
            // Terminal event only after the registry made the state observable.
            events.error(&diagnostic).await;
            return;
        }
        tracing::info!(
            job_id = %job_id,
            sitemaps = robots_only_sitemaps.len(),
            "Seed unreachable, proceeding with robots-derived sitemaps"
        );
    }

    let Ok(target_parsed) = Url::parse(&target_url) else {
        let diagnostic = format!("Target URL {target_url} is not parseable");
        ctx.registry.fail(&job_id, &diagnostic).await;
        events.error(&diagnostic).await;
        return;
    };

    let collector = UrlCollector::new(request.max_urls);
    let allowed = allowed_hosts(&target_parsed);
    if outcome.success {
        collector.insert(&target_url).await;
    }

    // Tier 1: sitemap discovery. Forced on when running from robots-derived
    // sitemaps, since no other tier can work without a reachable seed.
    if plan.sitemap || !robots_only_sitemaps.is_empty() {
        ctx.registry
            .update_progress(&job_id, "Discovering sitemaps")
            .await;
        events
            .tier_switch(Tier::Sitemap, "Starting sitemap tier", collector.len().await)
            .await;

        let sitemaps = if robots_only_sitemaps.is_empty() {
            resolver.discover(&target_parsed).await
        } else {
            robots_only_sitemaps.clone()
        };

        'sitemaps: for sitemap_url in &sitemaps {
            events
                .sitemap_discovered(sitemap_url, collector.len().await)
                .await;
            match resolver.parse(sitemap_url).await {
                Ok(urls) => {
                    for raw in urls {
                        let Some(canonical) = canonicalize_link(&raw, &target_parsed, &allowed)
                        else {
                            continue;
                        };
                        if collector.insert(&canonical).await {
                            events
                                .url_discovered(&canonical, 0, collector.len().await, Tier::Sitemap)
                                .await;
                        }
                        if collector.is_stopped().await {
                            break 'sitemaps;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, sitemap = %sitemap_url, error = %e, "Sitemap tier error");
                    events
                        .error(&format!("Sitemap {sitemap_url} failed: {e}"))
                        .await;
                }
            }
        }
    }

    // Tier 2: HTML link walk, only while sitemap yield stayed thin.
    if plan.html
        && outcome.success
        && collector.len().await < FALLBACK_TIER_THRESHOLD
        && !collector.is_stopped().await
    {
        ctx.registry
            .update_progress(&job_id, "Walking HTML links")
            .await;
        events
            .tier_switch(Tier::Html, "Starting HTML tier", collector.len().await)
            .await;

        let walker = Arc::new(HtmlWalker::new(ctx.fingerprints.clone()));
        let config = WalkerConfig {
            depth: request.depth,
            workers: request.workers,
            delay: request.delay_duration(),
        };
        walker.walk(&target_parsed, &config, &collector, &events).await;
    }

    // Tier 3: headless render of the seed when both cheap tiers came up short.
    if plan.headless
        && outcome.success
        && collector.len().await < FALLBACK_TIER_THRESHOLD
        && !collector.is_stopped().await
    {
        ctx.registry
            .update_progress(&job_id, "Rendering with headless browser")
            .await;
        events
            .tier_switch(Tier::Headless, "Starting headless tier", collector.len().await)
            .await;

        let renderer = HeadlessRenderer::new(ctx.browser_pool.clone());
        match renderer
            .render(&target_url, Duration::from_secs(request.headless_timeout))
            .await
        {
            Ok(html) => {
                for link in extract_links(&html, &target_parsed, &allowed) {
                    if collector.insert(&link).await {
                        events
                            .url_discovered(&link, 1, collector.len().await, Tier::Headless)
                            .await;
                    }
                    if collector.is_stopped().await {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Headless tier error");
                events.error(&format!("Headless tier failed: {e}")).await;
            }
        }
    }

    if collector.is_stopped().await {
        events
            .progress(
                &format!("URL cap reached, result truncated to {}", request.max_urls),
                None,
                None,
                collector.len().await,
                collector.page_count().await,
                None,
            )
            .await;
    }

    let urls = collector.into_urls().await;
    let elapsed = start.elapsed().as_secs_f64();
    let total = urls.len();
    let result = CrawlResult {
        id: generate_id(),
        target_url: target_url.clone(),
        duration: format!("{elapsed:.2}s"),
        total_urls: total,
        urls_per_second: format!("{:.2}", total as f64 / elapsed.max(0.001)),
        settings: CrawlSettings {
            depth: request.depth,
            workers: request.workers,
            max_urls: request.max_urls,
            sitemap_enabled: plan.sitemap,
            html_enabled: plan.html,
            headless_enabled: plan.headless,
        },
        urls,
    };

    tracing::info!(
        job_id = %job_id,
        target = %target_url,
        urls = total,
        elapsed_s = elapsed,
        "Crawl complete"
    );

    ctx.registry.complete(&job_id, result).await;
    // Terminal event strictly after the registry update.
    events.completed(total).await;
}
