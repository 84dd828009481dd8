use chromiumoxide::browser::{Browser, BrowserConfigBuilder};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default per-CDP-operation timeout.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum BrowserPoolError {
    #[error("Browser pool exhausted ({0} instances busy)")]
    Exhausted(usize),
    #[error("Browser launch failed: {0}")]
    Launch(String),
}

struct Slot {
    id: u64,
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    busy: bool,
}

/// Lazily-grown pool of headless browser instances.
///
/// `get` hands out the first idle instance, launching a new one while under
/// the cap; exhaustion is an immediate error rather than a wait. Instances
/// are leased exclusively — a browser page is not safe for concurrent use.
pub struct BrowserPool {
    max: usize,
    slots: Mutex<Vec<Slot>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl BrowserPool {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(BrowserPool {
            max: max.max(1),
            slots: Mutex::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Lease a browser. The lease returns the instance to the pool on drop.
    pub async fn get(self: &Arc<Self>) -> Result<BrowserLease, BrowserPoolError> {
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.iter_mut().find(|s| !s.busy) {
            slot.busy = true;
            return Ok(BrowserLease {
                id: slot.id,
                browser: slot.browser.clone(),
                pool: self.clone(),
            });
        }

        if slots.len() >= self.max {
            return Err(BrowserPoolError::Exhausted(slots.len()));
        }

        let (browser, handler) = launch_browser().await?;
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let browser = Arc::new(browser);
        slots.push(Slot {
            id,
            browser: browser.clone(),
            handler,
            busy: true,
        });
        tracing::info!(id = id, total = slots.len(), cap = self.max, "Launched pooled browser");

        Ok(BrowserLease {
            id,
            browser,
            pool: self.clone(),
        })
    }

    async fn release_owned(self: Arc<Self>, id: u64) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
            slot.busy = false;
        }
    }

    /// Close every browser and abort its event handler.
    pub async fn shutdown(&self) {
        let mut slots = self.slots.lock().await;
        for mut slot in slots.drain(..) {
            if let Some(browser) = Arc::get_mut(&mut slot.browser) {
                if let Err(e) = browser.close().await {
                    tracing::warn!(id = slot.id, error = %e, "Browser close failed");
                }
                let _ = browser.wait().await;
            } else {
                tracing::warn!(id = slot.id, "Browser still leased at shutdown");
            }
            slot.handler.abort();
        }
        tracing::info!("Browser pool shut down");
    }
}

/// Exclusive lease on one pooled browser; returns it on drop.
pub struct BrowserLease {
    id: u64,
    browser: Arc<Browser>,
    pool: Arc<BrowserPool>,
}

impl BrowserLease {
    pub fn browser(&self) -> &Browser {
        &self.browser
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let id = self.id;
        tokio::spawn(async move {
            pool.release_owned(id).await;
        });
    }
}

/// Launch a headless browser with the hardened argument set and spawn its
/// CDP event handler task.
async fn launch_browser() -> Result<(Browser, JoinHandle<()>), BrowserPoolError> {
    let config = BrowserConfigBuilder::default()
        .request_timeout(OPERATION_TIMEOUT)
        .arg("--headless")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-gpu")
        .arg("--disable-web-security")
        .arg("--disable-background-timer-throttling")
        .arg("--disable-backgrounding-occluded-windows")
        .arg("--disable-renderer-backgrounding")
        .build()
        .map_err(BrowserPoolError::Launch)?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| BrowserPoolError::Launch(e.to_string()))?;

    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                tracing::debug!(error = %e, "Browser handler event error");
            }
        }
    });

    Ok((browser, handler_task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_floor() {
        let pool = BrowserPool::new(0);
        assert_eq!(pool.capacity(), 1);
        let pool = BrowserPool::new(8);
        assert_eq!(pool.capacity(), 8);
    }

    #[tokio::test]
    async fn test_empty_pool_size() {
        let pool = BrowserPool::new(4);
        assert_eq!(pool.size().await, 0);
    }
}
