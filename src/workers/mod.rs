pub mod browser_pool;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::content::ContentExtractor;
use crate::models::ContentResponse;
use self::browser_pool::BrowserPool;

/// Sentinel surfaced to the API as HTTP 503.
pub const OVERLOADED: &str = "system overloaded";

const SUBMIT_DEADLINE: Duration = Duration::from_secs(5);
/// Per-URL share of the overall batch deadline.
const PER_URL_BUDGET: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WorkerPoolError {
    #[error("{OVERLOADED}")]
    Overloaded,
    #[error("Batch deadline exceeded after {0}s")]
    DeadlineExceeded(u64),
    #[error("Worker pool is shut down")]
    ShutDown,
}

struct PoolJob {
    url: String,
    index: usize,
    reply: oneshot::Sender<(usize, ContentResponse)>,
}

/// Process-wide bounded pool multiplexing content extraction over the shared
/// headless-browser pool, with admission control for incoming batches.
pub struct WorkerPool {
    workers: usize,
    tx: mpsc::Sender<PoolJob>,
    idle: Arc<AtomicUsize>,
    browser_pool: Arc<BrowserPool>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create the pool with automatic sizing from CPU count and process RSS.
    pub fn new(extractor: Arc<ContentExtractor>, browser_pool: Arc<BrowserPool>) -> Arc<Self> {
        Self::with_size(sized_workers(), extractor, browser_pool)
    }

    pub fn with_size(
        workers: usize,
        extractor: Arc<ContentExtractor>,
        browser_pool: Arc<BrowserPool>,
    ) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<PoolJob>(2 * workers);
        let rx = Arc::new(Mutex::new(rx));
        let idle = Arc::new(AtomicUsize::new(workers));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let idle = idle.clone();
            let extractor = extractor.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, idle, extractor, shutdown).await;
            }));
        }

        tracing::info!(workers = workers, browsers = browser_pool.capacity(), "Worker pool started");

        Arc::new(WorkerPool {
            workers,
            tx,
            idle,
            browser_pool,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    pub fn browser_pool(&self) -> Arc<BrowserPool> {
        self.browser_pool.clone()
    }

    /// Process a batch of URLs. Responses are returned in input order
    /// regardless of completion order.
    ///
    /// Admission: the batch is accepted outright when enough workers are
    /// idle; otherwise it retries at a quarter of the pool's concurrency,
    /// and refuses with the overload sentinel when even that is impossible.
    pub async fn process_content_urls(
        &self,
        urls: &[String],
        concurrency: Option<usize>,
    ) -> Result<Vec<ContentResponse>, WorkerPoolError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerPoolError::ShutDown);
        }
        let n = urls.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let required = n.div_ceil(10).max(2);
        let idle = self.idle_workers();
        let mut limit = if idle >= required {
            n
        } else {
            let reduced = self.workers / 4;
            if reduced < 1 {
                tracing::warn!(idle = idle, required = required, "Batch refused, pool overloaded");
                return Err(WorkerPoolError::Overloaded);
            }
            tracing::info!(idle = idle, reduced = reduced, "Admission reduced batch concurrency");
            reduced
        };
        if let Some(cap) = concurrency {
            limit = limit.min(cap.max(1));
        }

        let deadline = PER_URL_BUDGET * n as u32;
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut join_set: JoinSet<Option<(usize, ContentResponse)>> = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let tx = self.tx.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let (reply, rx) = oneshot::channel();
                let job = PoolJob {
                    url: url.clone(),
                    index,
                    reply,
                };
                match tokio::time::timeout(SUBMIT_DEADLINE, tx.send(job)).await {
                    Err(_) => Some((
                        index,
                        ContentResponse::failure(&url, 0, "submit deadline exceeded".to_string()),
                    )),
                    Ok(Err(_)) => Some((
                        index,
                        ContentResponse::failure(&url, 0, "worker pool shut down".to_string()),
                    )),
                    Ok(Ok(())) => rx.await.ok(),
                }
            });
        }

        let mut slots: Vec<Option<ContentResponse>> = vec![None; n];
        let collect = async {
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Some((index, response))) => slots[index] = Some(response),
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "Batch task panicked"),
                }
            }
        };

        let deadline_hit = tokio::time::timeout(deadline, collect).await.is_err();

        let results: Vec<ContentResponse> = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    ContentResponse::failure(&urls[i], 0, "batch deadline exceeded".to_string())
                })
            })
            .collect();

        if deadline_hit {
            tracing::warn!(urls = n, completed = results.iter().filter(|r| r.is_success()).count(), "Batch deadline exceeded");
            return Err(WorkerPoolError::DeadlineExceeded(deadline.as_secs()));
        }

        Ok(results)
    }

    /// Stop accepting work, drain workers, then close the browser pool.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        self.browser_pool.shutdown().await;
        tracing::info!("Worker pool shut down");
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<PoolJob>>>,
    idle: Arc<AtomicUsize>,
    extractor: Arc<ContentExtractor>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                job = guard.recv() => job,
            }
        };
        let Some(job) = job else { break };

        idle.fetch_sub(1, Ordering::AcqRel);
        let response = extractor.extract(&job.url).await;
        if job.reply.send((job.index, response)).is_err() {
            tracing::debug!(worker = worker_id, "Batch caller gone before reply");
        }
        idle.fetch_add(1, Ordering::AcqRel);
    }
    tracing::debug!(worker = worker_id, "Worker exiting");
}

/// Pool sizing: `min(2·CPU, RSS/100MiB, 50)` clamped to [5, 50]. A missing
/// RSS reading falls back to the CPU term.
pub fn sized_workers() -> usize {
    let cpu_term = 2 * num_cpus::get();
    let mut size = cpu_term;
    if let Some(rss) = process_rss_bytes() {
        size = size.min((rss / (100 * 1024 * 1024)) as usize);
    }
    size.min(50).clamp(5, 50)
}

/// Browser pool capacity derived from worker count.
pub fn browser_pool_size(workers: usize) -> usize {
    (workers / 2).max(1)
}

fn process_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintProvider;

    fn test_pool(workers: usize) -> Arc<WorkerPool> {
        let fingerprints = FingerprintProvider::new("", "");
        let extractor = Arc::new(ContentExtractor::new(fingerprints, None));
        WorkerPool::with_size(workers, extractor, BrowserPool::new(2))
    }

    #[test]
    fn test_sizing_clamps() {
        let size = sized_workers();
        assert!((5..=50).contains(&size));
    }

    #[test]
    fn test_browser_pool_size() {
        assert_eq!(browser_pool_size(10), 5);
        assert_eq!(browser_pool_size(1), 1);
        assert_eq!(browser_pool_size(0), 1);
    }

    #[test]
    fn test_admission_arithmetic() {
        // required idle workers for a batch of n URLs
        let required = |n: usize| n.div_ceil(10).max(2);
        assert_eq!(required(1), 2);
        assert_eq!(required(10), 2);
        assert_eq!(required(25), 3);
        assert_eq!(required(100), 10);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let pool = test_pool(5);
        let results = pool.process_content_urls(&[], None).await.unwrap();
        assert!(results.is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_counter_starts_full() {
        let pool = test_pool(6);
        assert_eq!(pool.idle_workers(), 6);
        assert_eq!(pool.workers(), 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_results_ordered_by_input() {
        // Unreachable loopback port fails fast; exercise ordering without
        // real network traffic.
        let pool = test_pool(5);
        let urls = vec![
            "http://127.0.0.1:9/a".to_string(),
            "http://127.0.0.1:9/b".to_string(),
            "http://127.0.0.1:9/c".to_string(),
        ];
        let results = pool.process_content_urls(&urls, None).await.unwrap();
        assert_eq!(results.len(), 3);
        for (result, url) in results.iter().zip(&urls) {
            assert_eq!(&result.url, url);
            assert!(!result.is_success());
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_batches() {
        let pool = test_pool(5);
        pool.shutdown().await;
        let err = pool
            .process_content_urls(&["http://127.0.0.1:9/".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerPoolError::ShutDown));
    }
}
