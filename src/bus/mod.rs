use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::models::{CrawlEvent, EventType, Tier};

/// In-flight events buffered per WebSocket subscriber before the consumer
/// side backpressures.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus connection failed: {0}")]
    Connect(String),
    #[error("Bus publish failed: {0}")]
    Publish(String),
}

/// Topic-routed crawl-event fan-out over the message bus.
///
/// Topics follow `crawler.<job_id>.<event_type>`. Publishes are
/// fire-and-forget: a sick bus must never stall crawl progress, so failures
/// log, drop the connection, and the next publish reconnects.
pub struct EventBus {
    client: redis::Client,
    publish_conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl EventBus {
    pub async fn connect(url: &str) -> Result<Arc<Self>, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BusError::Connect("connect timeout".to_string()))?
            .map_err(|e| BusError::Connect(e.to_string()))?;

        Ok(Arc::new(EventBus {
            client,
            publish_conn: Mutex::new(Some(conn)),
        }))
    }

    /// Publish an event to its job topic. Errors are logged and swallowed.
    pub async fn publish(&self, event: &CrawlEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize event");
                return;
            }
        };
        let topic = format!(
            "crawler.{}.{}",
            event.job_id,
            event.event_type.routing_segment()
        );

        if let Err(e) = self.publish_raw(&topic, &payload).await {
            tracing::warn!(topic = %topic, error = %e, "Event publish failed, dropping event");
        }
    }

    async fn publish_raw(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut guard = self.publish_conn.lock().await;

        if guard.is_none() {
            let conn = tokio::time::timeout(
                CONNECT_TIMEOUT,
                self.client.get_multiplexed_async_connection(),
            )
            .await
            .map_err(|_| BusError::Connect("reconnect timeout".to_string()))?
            .map_err(|e| BusError::Connect(e.to_string()))?;
            *guard = Some(conn);
        }

        let conn = guard.as_mut().expect("connection just ensured");
        let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(conn)
            .await;

        if let Err(e) = result {
            // Drop the connection so the next publish re-establishes it.
            *guard = None;
            return Err(BusError::Publish(e.to_string()));
        }
        Ok(())
    }

    /// Subscribe to one job's event stream. The returned receiver is bounded;
    /// a slow consumer backpressures the relay task. The relay exits on the
    /// stop token, on a terminal event, or when the receiver is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        job_id: &str,
        stop: CancellationToken,
    ) -> mpsc::Receiver<CrawlEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let client = self.client.clone();
        let pattern = format!("crawler.{job_id}.*");
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Bus subscribe failed");
                    return;
                }
            };
            if let Err(e) = pubsub.psubscribe(&pattern).await {
                tracing::warn!(job_id = %job_id, error = %e, "Pattern subscribe failed");
                return;
            }

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(error = %e, "Unreadable bus payload, skipping");
                                continue;
                            }
                        };
                        let event: CrawlEvent = match serde_json::from_str(&payload) {
                            Ok(e) => e,
                            Err(e) => {
                                tracing::warn!(error = %e, "Undecodable event, skipping");
                                continue;
                            }
                        };
                        let terminal = event.event_type.is_terminal();
                        if tx.send(event).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(job_id = %job_id, "Bus subscriber exiting");
        });

        rx
    }

    pub async fn ping(&self) -> bool {
        let mut guard = self.publish_conn.lock().await;
        match guard.as_mut() {
            Some(conn) => redis::cmd("PING")
                .query_async::<String>(conn)
                .await
                .is_ok(),
            None => false,
        }
    }
}

/// Per-job event emitter handed to the tiers. A missing bus degrades to
/// debug logging so crawls proceed without fan-out.
#[derive(Clone)]
pub struct JobEvents {
    bus: Option<Arc<EventBus>>,
    job_id: String,
}

impl JobEvents {
    pub fn new(bus: Option<Arc<EventBus>>, job_id: &str) -> Self {
        JobEvents {
            bus,
            job_id: job_id.to_string(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn progress(
        &self,
        message: &str,
        url: Option<&str>,
        depth: Option<u32>,
        total: usize,
        page_count: usize,
        tier: Option<Tier>,
    ) {
        let mut event = CrawlEvent::new(EventType::Progress, &self.job_id);
        event.progress = Some(message.to_string());
        event.url = url.map(|u| u.to_string());
        event.depth = depth;
        event.total = Some(total);
        event.page_count = Some(page_count);
        event.tier = tier;
        self.emit(event).await;
    }

    pub async fn url_discovered(&self, url: &str, depth: u32, total: usize, tier: Tier) {
        let mut event = CrawlEvent::new(EventType::UrlDiscovered, &self.job_id);
        event.url = Some(url.to_string());
        event.depth = Some(depth);
        event.total = Some(total);
        event.tier = Some(tier);
        self.emit(event).await;
    }

    pub async fn sitemap_discovered(&self, sitemap_url: &str, total: usize) {
        let mut event = CrawlEvent::new(EventType::SitemapDiscovered, &self.job_id);
        event.url = Some(sitemap_url.to_string());
        event.progress = Some(format!("Found sitemap {sitemap_url}"));
        event.total = Some(total);
        event.tier = Some(Tier::Sitemap);
        self.emit(event).await;
    }

    pub async fn tier_switch(&self, tier: Tier, message: &str, total: usize) {
        let mut event = CrawlEvent::new(EventType::TierSwitch, &self.job_id);
        event.progress = Some(message.to_string());
        event.total = Some(total);
        event.tier = Some(tier);
        self.emit(event).await;
    }

    pub async fn completed(&self, total: usize) {
        let mut event = CrawlEvent::new(EventType::Completed, &self.job_id);
        event.progress = Some("Crawl completed".to_string());
        event.total = Some(total);
        self.emit(event).await;
    }

    pub async fn error(&self, message: &str) {
        let mut event = CrawlEvent::new(EventType::Error, &self.job_id);
        event.error = Some(message.to_string());
        self.emit(event).await;
    }

    async fn emit(&self, event: CrawlEvent) {
        match &self.bus {
            Some(bus) => bus.publish(&event).await,
            None => {
                tracing::debug!(job_id = %self.job_id, event = ?event.event_type, "No bus, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_without_bus_do_not_panic() {
        let events = JobEvents::new(None, "job-x");
        events
            .progress("working", Some("https://example.com"), Some(0), 1, 1, None)
            .await;
        events
            .url_discovered("https://example.com/a", 1, 2, Tier::Html)
            .await;
        events.completed(2).await;
        events.error("boom").await;
    }

    #[test]
    fn test_topic_format() {
        let event = CrawlEvent::new(EventType::UrlDiscovered, "job-1");
        let topic = format!(
            "crawler.{}.{}",
            event.job_id,
            event.event_type.routing_segment()
        );
        assert_eq!(topic, "crawler.job-1.url_discovered");
    }

    #[test]
    fn test_tier_variants_route_as_progress() {
        for t in [EventType::SitemapDiscovered, EventType::TierSwitch] {
            let event = CrawlEvent::new(t, "j");
            assert_eq!(event.event_type.routing_segment(), "progress");
        }
    }
}
