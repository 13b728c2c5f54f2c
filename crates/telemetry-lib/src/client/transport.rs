//! Delivery transports
//!
//! Two kinds of transport exist:
//! - [`Transport`]: a request/response send whose result is observable
//! - [`BestEffortTransport`]: a fire-and-forget send that survives teardown
//!   and reports nothing back
//!
//! HTTP implementations talk to the ingestion routes; loopback
//! implementations call an in-process [`IngestionGate`] and are used by the
//! server-side simulator and tests.

use crate::error::{PipelineError, Result};
use crate::models::{EventBatch, IngestAck, RateLimitedBody};
use crate::server::{ClientIdentity, IngestRequest, IngestResponse, IngestionGate};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Request/response transport to an ingestion route
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Send the batch and wait for the gate's answer
    async fn send(&self, batch: &EventBatch) -> Result<IngestAck>;
}

/// Fire-and-forget transport
pub trait BestEffortTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Hand the batch to the platform. `true` means the send was accepted
    /// for transmission; nothing is known about its arrival.
    fn send_and_forget(&self, batch: &EventBatch) -> bool;
}

/// JSON POST of `{ "events": [...] }` to an ingestion route
pub struct HttpTransport {
    name: String,
    client: Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(name: impl Into<String>, url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Self::with_client(name, url, client)
    }

    pub fn with_client(name: impl Into<String>, url: &str, client: Client) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid ingestion URL {}", url))?;
        Ok(Self {
            name: name.into(),
            client,
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &EventBatch) -> Result<IngestAck> {
        let response = self
            .client
            .post(self.url.clone())
            .json(batch)
            .send()
            .await
            .map_err(|e| PipelineError::transport(&self.name, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header_hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body_hint = response
                .json::<RateLimitedBody>()
                .await
                .ok()
                .map(|b| b.retry_after_seconds);
            return Err(PipelineError::RateLimited {
                retry_after_secs: header_hint.or(body_hint).unwrap_or(1),
            });
        }

        if status == StatusCode::SERVICE_UNAVAILABLE {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Storage(format!("{}: {}", self.name, body)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::transport(
                &self.name,
                format!("HTTP {}: {}", status, body),
            ));
        }

        // A 2xx without a readable body still means the gate took the batch
        Ok(response.json::<IngestAck>().await.unwrap_or(IngestAck {
            accepted: batch.len(),
            ..Default::default()
        }))
    }
}

/// Beacon-style send: a detached POST whose response is never observed
pub struct BeaconTransport {
    client: Client,
    url: Url,
}

impl BeaconTransport {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        let url = Url::parse(url).with_context(|| format!("Invalid beacon URL {}", url))?;
        Ok(Self { client, url })
    }
}

impl BestEffortTransport for BeaconTransport {
    fn name(&self) -> &str {
        "beacon"
    }

    fn send_and_forget(&self, batch: &EventBatch) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let request = self.client.post(self.url.clone()).json(batch);
        let events = batch.len();
        // Detached on purpose: unload must not cancel it
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                debug!(error = %e, events, "Beacon send failed");
            }
        });
        true
    }
}

/// In-process transport straight into an [`IngestionGate`]
pub struct LoopbackTransport {
    name: String,
    route: String,
    client: ClientIdentity,
    gate: Arc<IngestionGate>,
    blocked: Arc<AtomicBool>,
}

impl LoopbackTransport {
    pub fn new(
        name: impl Into<String>,
        route: impl Into<String>,
        client: ClientIdentity,
        gate: Arc<IngestionGate>,
    ) -> Self {
        Self {
            name: name.into(),
            route: route.into(),
            client,
            gate,
            blocked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a blocking switch with other transports
    pub fn with_block_switch(mut self, blocked: Arc<AtomicBool>) -> Self {
        self.blocked = blocked;
        self
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    fn request(&self, batch: &EventBatch) -> IngestRequest {
        IngestRequest {
            route: self.route.clone(),
            client: self.client.clone(),
            batch: batch.clone(),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &EventBatch) -> Result<IngestAck> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(PipelineError::transport(&self.name, "blocked by client filter"));
        }

        match self.gate.ingest(self.request(batch)).await {
            IngestResponse::Accepted { ack, .. } => Ok(ack),
            IngestResponse::RateLimited {
                retry_after_secs, ..
            } => Err(PipelineError::RateLimited { retry_after_secs }),
            IngestResponse::Invalid(message) => Err(PipelineError::transport(&self.name, message)),
            IngestResponse::StorageFailed(message) => Err(PipelineError::Storage(message)),
        }
    }
}

/// In-process beacon into an [`IngestionGate`]
pub struct LoopbackBeacon {
    route: String,
    client: ClientIdentity,
    gate: Arc<IngestionGate>,
    blocked: Arc<AtomicBool>,
    sent: AtomicUsize,
}

impl LoopbackBeacon {
    pub fn new(route: impl Into<String>, client: ClientIdentity, gate: Arc<IngestionGate>) -> Self {
        Self {
            route: route.into(),
            client,
            gate,
            blocked: Arc::new(AtomicBool::new(false)),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn with_block_switch(mut self, blocked: Arc<AtomicBool>) -> Self {
        self.blocked = blocked;
        self
    }

    /// Number of batches handed off, including silently lost ones
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl BestEffortTransport for LoopbackBeacon {
    fn name(&self) -> &str {
        "beacon"
    }

    fn send_and_forget(&self, batch: &EventBatch) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        self.sent.fetch_add(1, Ordering::SeqCst);
        // A blocked beacon still "succeeds" from the sender's point of view
        if self.blocked.load(Ordering::SeqCst) {
            return true;
        }
        let gate = Arc::clone(&self.gate);
        let request = IngestRequest {
            route: self.route.clone(),
            client: self.client.clone(),
            batch: batch.clone(),
        };
        handle.spawn(async move {
            gate.ingest(request).await;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Payload, TelemetryEvent};

    fn batch(n: usize) -> EventBatch {
        EventBatch::new(
            (0..n)
                .map(|i| TelemetryEvent {
                    event_id: format!("e-{}", i),
                    name: "page_view".to_string(),
                    category: "navigation".to_string(),
                    session_id: "s1".to_string(),
                    page: "/".to_string(),
                    timestamp: 1_000 + i as i64,
                    payload: Payload::new(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_http_transport_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/analytics/events")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accepted":2,"duplicates":0,"invalid":0}"#)
            .create_async()
            .await;

        let url = format!("{}/api/analytics/events", server.url());
        let transport = HttpTransport::new("primary", &url).unwrap();
        let ack = transport.send(&batch(2)).await.unwrap();

        assert_eq!(ack.accepted, 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_transport_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/analytics/events")
            .with_status(429)
            .with_header("retry-after", "7")
            .with_body(r#"{"error":"Rate limit exceeded","retryAfterSeconds":7}"#)
            .create_async()
            .await;

        let url = format!("{}/api/analytics/events", server.url());
        let transport = HttpTransport::new("primary", &url).unwrap();
        let err = transport.send(&batch(1)).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::RateLimited {
                retry_after_secs: 7
            }
        ));
    }

    #[tokio::test]
    async fn test_http_transport_server_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/collect/b")
            .with_status(503)
            .create_async()
            .await;

        let url = format!("{}/api/collect/b", server.url());
        let transport = HttpTransport::new("alternate", &url).unwrap();
        let err = transport.send(&batch(1)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_transport_bad_request() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/analytics/events")
            .with_status(400)
            .create_async()
            .await;

        let url = format!("{}/api/analytics/events", server.url());
        let transport = HttpTransport::new("primary", &url).unwrap();
        let err = transport.send(&batch(1)).await.unwrap_err();

        assert!(matches!(err, PipelineError::Transport { .. }));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(HttpTransport::new("primary", "not a url").is_err());
    }

    #[test]
    fn test_beacon_without_runtime_reports_not_sent() {
        let beacon = BeaconTransport::new("http://127.0.0.1:9/api/collect/b").unwrap();
        assert!(!beacon.send_and_forget(&batch(1)));
    }
}
