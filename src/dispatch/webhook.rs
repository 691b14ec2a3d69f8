//! Webhook fan-out
//!
//! One POST per configured URL per event, fire-and-forget. Failures are
//! logged and counted, never retried. At most `max_in_flight` deliveries
//! run at once; the rest wait for a permit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;

use crate::error::{RelayError, Result};
use crate::types::Event;

/// Content type sent with every delivery
pub const WEBHOOK_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Default cap on concurrent deliveries
pub const MAX_IN_FLIGHT: usize = 64;

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Posts events to a fixed set of URLs
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    urls: Arc<Vec<String>>,
    counters: Arc<Counters>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl WebhookSender {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        Self::with_limit(urls, timeout, MAX_IN_FLIGHT)
    }

    /// Sender running at most `max_in_flight` deliveries at once
    pub fn with_limit(urls: Vec<String>, timeout: Duration, max_in_flight: usize) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let max_in_flight = max_in_flight.max(1);
        Ok(Self {
            client,
            urls: Arc::new(urls),
            counters: Arc::new(Counters::default()),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Deliveries currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// (delivered, failed) totals
    pub fn totals(&self) -> (u64, u64) {
        (
            self.counters.delivered.load(Ordering::Relaxed),
            self.counters.failed.load(Ordering::Relaxed),
        )
    }

    /// Spawn one delivery per URL and return immediately
    pub fn fan_out(&self, event: &Event) {
        if self.urls.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode event for webhooks");
                return;
            }
        };

        for url in self.urls.iter() {
            let sender = self.clone();
            let url = url.clone();
            let body = body.clone();
            tokio::spawn(async move {
                // the semaphore is never closed
                let Ok(_permit) = sender.permits.clone().acquire_owned().await else {
                    return;
                };
                match sender.deliver(&url, body).await {
                    Ok(()) => {
                        sender.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        sender.counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(url = %url, error = %e, "webhook delivery dropped");
                    }
                }
            });
        }
    }

    /// POST one encoded event to `url`
    pub async fn deliver(&self, url: &str, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, WEBHOOK_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::Webhook {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Webhook {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        tracing::debug!(url = %url, status = status.as_u16(), "webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, EventType, Payload};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> Event {
        let mut payload = Payload::new();
        payload.insert("path".into(), json!("/a"));
        Event::new(Category::Dav, EventType::Mkdir, "MKCOL", payload)
    }

    #[tokio::test]
    async fn test_deliver_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", WEBHOOK_CONTENT_TYPE))
            .and(body_json(json!({
                "category": "dav",
                "type": "mkdir",
                "method": "MKCOL",
                "payload": {"path": "/a"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/hook", server.uri());
        let sender = WebhookSender::new(vec![url.clone()], Duration::from_secs(5)).unwrap();
        let body = serde_json::to_vec(&event()).unwrap();
        sender.deliver(&url, body).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = WebhookSender::new(vec![server.uri()], Duration::from_secs(5)).unwrap();
        let err = sender.deliver(&server.uri(), b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, RelayError::Webhook { .. }));
    }

    #[tokio::test]
    async fn test_fan_out_counts_each_url() {
        let ok = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ok)
            .await;
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;

        let sender =
            WebhookSender::new(vec![ok.uri(), failing.uri()], Duration::from_secs(5)).unwrap();
        sender.fan_out(&event());

        for _ in 0..100 {
            if sender.totals() == (1, 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sender.totals(), (1, 1));
    }

    #[tokio::test]
    async fn test_fan_out_caps_concurrent_deliveries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
            .mount(&server)
            .await;

        let sender =
            WebhookSender::with_limit(vec![server.uri()], Duration::from_secs(5), 2).unwrap();
        for _ in 0..5 {
            sender.fan_out(&event());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sender.in_flight(), 2);
        let received = server.received_requests().await.unwrap_or_default();
        assert_eq!(received.len(), 2);

        for _ in 0..200 {
            if sender.totals() == (5, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sender.totals(), (5, 0));
        assert_eq!(sender.in_flight(), 0);
    }
}
