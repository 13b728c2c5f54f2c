//! Offline queue flushing
//!
//! A flush run purges expired entries, settles beacon sends whose
//! verification window elapsed, then replays eligible entries oldest first
//! in batches until the queue is drained or a batch fails.

use super::delivery::{DeliveryOutcome, DeliveryStrategySelector};
use super::queue::OfflineQueue;
use crate::error::{PipelineError, Result};
use crate::models::{EventBatch, VerifyRequest, VerifyResponse};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// What started a flush run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Interval,
    Reconnect,
    Visible,
    Manual,
    Startup,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interval => "interval",
            Self::Reconnect => "reconnect",
            Self::Visible => "visible",
            Self::Manual => "manual",
            Self::Startup => "startup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Period of the interval trigger
    pub interval: Duration,
    /// Events per replayed batch
    pub max_batch_events: usize,
    /// Upper bound on batches replayed by one run
    pub max_batches_per_run: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_batch_events: 50,
            max_batches_per_run: 20,
        }
    }
}

/// Summary of one flush run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    /// Entries dropped for exceeding retention
    pub purged: usize,
    /// Beacon sends the gate confirmed, removed without resending
    pub verified: usize,
    /// Beacon sends that were not confirmed and go back to retry
    pub released: usize,
    pub delivered: usize,
    pub assumed: usize,
    pub failed: usize,
    /// A batch failed and the run stopped before draining the queue
    pub stopped_early: bool,
    pub remaining: usize,
}

impl FlushReport {
    fn new(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            purged: 0,
            verified: 0,
            released: 0,
            delivered: 0,
            assumed: 0,
            failed: 0,
            stopped_early: false,
            remaining: 0,
        }
    }
}

/// Asks the gate which events it has stored
#[async_trait]
pub trait DeliveryVerifier: Send + Sync {
    async fn confirm(&self, event_ids: &[String]) -> Result<Vec<String>>;
}

/// Verifier backed by `POST /api/analytics/verify`
pub struct HttpVerifier {
    client: Client,
    url: Url,
}

impl HttpVerifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;
        let url = Url::parse(url).with_context(|| format!("Invalid verify URL {}", url))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DeliveryVerifier for HttpVerifier {
    async fn confirm(&self, event_ids: &[String]) -> Result<Vec<String>> {
        let request = VerifyRequest {
            event_ids: event_ids.to_vec(),
        };
        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::transport("verify", e.to_string()))?;

        if !response.status().is_success() {
            return Err(PipelineError::transport(
                "verify",
                format!("HTTP {}", response.status()),
            ));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::transport("verify", e.to_string()))?;
        Ok(body.confirmed)
    }
}

/// Replays the offline queue through the delivery strategies
pub struct FlushManager {
    config: FlushConfig,
    verifier: Option<Arc<dyn DeliveryVerifier>>,
}

impl FlushManager {
    pub fn new(config: FlushConfig) -> Self {
        Self {
            config,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DeliveryVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Run one flush. Only persistence failures are returned as errors;
    /// delivery failures are recorded on the entries and in the report.
    pub async fn run(
        &self,
        trigger: FlushTrigger,
        selector: &DeliveryStrategySelector,
        queue: &mut OfflineQueue,
        now: i64,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::new(trigger);

        report.purged = queue.purge_expired(now)?;
        self.settle_beacon_sends(queue, now, &mut report).await?;

        let window = selector.config().verification_window;
        for _ in 0..self.config.max_batches_per_run {
            let entries = queue.dequeue_batch(self.config.max_batch_events, now);
            if entries.is_empty() {
                break;
            }

            let batch = EventBatch::new(entries.into_iter().map(|e| e.event).collect());
            let ids = batch.event_ids();

            match selector.attempt(&batch).await {
                DeliveryOutcome::Succeeded { .. } => {
                    queue.remove(&ids)?;
                    report.delivered += ids.len();
                }
                DeliveryOutcome::Assumed { .. } => {
                    queue.park_for_verification(&ids, now, window)?;
                    report.assumed += ids.len();
                }
                DeliveryOutcome::Failed { attempts, .. } => {
                    queue.mark_failed(&ids, now)?;
                    report.failed += ids.len();
                    report.stopped_early = true;
                    debug!(attempts, events = ids.len(), "Replay failed, stopping flush");
                    break;
                }
            }
        }

        report.remaining = queue.len();
        if report.delivered + report.assumed + report.failed + report.purged > 0 {
            info!(
                trigger = %trigger,
                delivered = report.delivered,
                assumed = report.assumed,
                failed = report.failed,
                purged = report.purged,
                remaining = report.remaining,
                "Flush completed"
            );
        }
        Ok(report)
    }

    /// Remove confirmed beacon sends; release the rest for resending
    async fn settle_beacon_sends(
        &self,
        queue: &mut OfflineQueue,
        now: i64,
        report: &mut FlushReport,
    ) -> Result<()> {
        let due = queue.due_for_verification(now);
        if due.is_empty() {
            return Ok(());
        }

        let confirmed: HashSet<String> = match &self.verifier {
            Some(verifier) => match verifier.confirm(&due).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, pending = due.len(), "Beacon verification failed, resending");
                    HashSet::new()
                }
            },
            None => HashSet::new(),
        };

        let (confirmed, unconfirmed): (Vec<String>, Vec<String>) =
            due.into_iter().partition(|id| confirmed.contains(id));

        if !confirmed.is_empty() {
            report.verified = queue.remove(&confirmed)?;
        }
        if !unconfirmed.is_empty() {
            queue.release_unverified(&unconfirmed)?;
            report.released = unconfirmed.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::blocker::BlockerDetector;
    use crate::client::delivery::{DeliveryConfig, StrategyDescriptor};
    use crate::client::queue::{BackoffPolicy, QueueConfig};
    use crate::client::store::MemoryQueueStore;
    use crate::client::transport::{BestEffortTransport, Transport};
    use crate::models::{IngestAck, Payload, TelemetryEvent};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Network transport whose availability is switched by the test
    struct Switchable {
        up: AtomicBool,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Switchable {
        fn name(&self) -> &str {
            "primary"
        }

        async fn send(&self, batch: &EventBatch) -> Result<IngestAck> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(PipelineError::transport("primary", "offline"));
            }
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(IngestAck {
                accepted: batch.len(),
                ..Default::default()
            })
        }
    }

    struct DroppingBeacon;

    impl BestEffortTransport for DroppingBeacon {
        fn name(&self) -> &str {
            "beacon"
        }

        fn send_and_forget(&self, _batch: &EventBatch) -> bool {
            true
        }
    }

    struct FixedVerifier(Vec<String>);

    #[async_trait]
    impl DeliveryVerifier for FixedVerifier {
        async fn confirm(&self, event_ids: &[String]) -> Result<Vec<String>> {
            Ok(event_ids
                .iter()
                .filter(|id| self.0.contains(id))
                .cloned()
                .collect())
        }
    }

    fn event(id: &str) -> TelemetryEvent {
        TelemetryEvent {
            event_id: id.to_string(),
            name: "checkout_start".to_string(),
            category: "shop".to_string(),
            session_id: "s1".to_string(),
            page: "/checkout".to_string(),
            timestamp: 1_700_000_000_000,
            payload: Payload::new(),
        }
    }

    fn network_only(transport: Arc<Switchable>) -> DeliveryStrategySelector {
        DeliveryStrategySelector::new(
            vec![StrategyDescriptor::network("primary", transport)],
            DeliveryConfig::default(),
            Arc::new(BlockerDetector::disabled()),
        )
    }

    fn switchable(up: bool) -> Arc<Switchable> {
        Arc::new(Switchable {
            up: AtomicBool::new(up),
            batches: AtomicUsize::new(0),
        })
    }

    fn queue() -> OfflineQueue {
        let config = QueueConfig {
            backoff: BackoffPolicy {
                jitter_ratio: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        OfflineQueue::open(config, Box::new(MemoryQueueStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_flush_replays_in_batches() {
        let transport = switchable(true);
        let selector = network_only(transport.clone());
        let mut queue = queue();
        let events: Vec<TelemetryEvent> = (0..5).map(|i| event(&format!("e{}", i))).collect();
        queue.enqueue_all(events, 0).unwrap();

        let manager = FlushManager::new(FlushConfig {
            max_batch_events: 2,
            ..Default::default()
        });
        let report = manager
            .run(FlushTrigger::Manual, &selector, &mut queue, 60_000)
            .await
            .unwrap();

        assert_eq!(report.delivered, 5);
        assert_eq!(report.remaining, 0);
        assert_eq!(transport.batches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_flush_skips_ineligible_entries() {
        let selector = network_only(switchable(true));
        let mut queue = queue();
        queue.enqueue(event("a"), 0).unwrap();

        let report = FlushManager::new(FlushConfig::default())
            .run(FlushTrigger::Interval, &selector, &mut queue, 1_000)
            .await
            .unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_failed_replay_backs_off_and_stops() {
        let selector = network_only(switchable(false));
        let mut queue = queue();
        queue.enqueue_all(vec![event("a"), event("b")], 0).unwrap();

        let manager = FlushManager::new(FlushConfig {
            max_batch_events: 1,
            ..Default::default()
        });
        let report = manager
            .run(FlushTrigger::Reconnect, &selector, &mut queue, 10_000)
            .await
            .unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.get("a").unwrap().attempt_count, 2);
        assert_eq!(queue.get("b").unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_flush_purges_expired_entries() {
        let selector = network_only(switchable(true));
        let mut queue = queue();
        queue.enqueue(event("old"), 0).unwrap();

        let eight_days = 8 * 24 * 60 * 60 * 1000;
        let report = FlushManager::new(FlushConfig::default())
            .run(FlushTrigger::Startup, &selector, &mut queue, eight_days)
            .await
            .unwrap();

        assert_eq!(report.purged, 1);
        assert_eq!(report.delivered, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_beacon_sends_are_removed() {
        let selector = network_only(switchable(false));
        let mut queue = queue();
        queue
            .park_new(vec![event("a"), event("b")], 0, Duration::from_secs(300))
            .unwrap();

        let manager = FlushManager::new(FlushConfig::default())
            .with_verifier(Arc::new(FixedVerifier(vec!["a".to_string()])));
        let report = manager
            .run(FlushTrigger::Interval, &selector, &mut queue, 300_000)
            .await
            .unwrap();

        assert_eq!(report.verified, 1);
        assert_eq!(report.released, 1);
        assert!(!queue.contains("a"));
        // Unconfirmed event was retried and failed again
        let b = queue.get("b").unwrap();
        assert!(!b.awaiting_verification);
        assert_eq!(b.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_beacon_replay_parks_again() {
        let selector = DeliveryStrategySelector::new(
            vec![
                StrategyDescriptor::network("primary", switchable(false)),
                StrategyDescriptor::beacon(Arc::new(DroppingBeacon)),
            ],
            DeliveryConfig::default(),
            Arc::new(BlockerDetector::disabled()),
        );
        let mut queue = queue();
        queue.enqueue(event("a"), 0).unwrap();

        let report = FlushManager::new(FlushConfig::default())
            .run(FlushTrigger::Visible, &selector, &mut queue, 5_000)
            .await
            .unwrap();

        assert_eq!(report.assumed, 1);
        assert!(queue.get("a").unwrap().awaiting_verification);
    }

    #[tokio::test]
    async fn test_http_verifier() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/analytics/verify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"confirmed":["a"]}"#)
            .create_async()
            .await;

        let verifier =
            HttpVerifier::new(&format!("{}/api/analytics/verify", server.url())).unwrap();
        let confirmed = verifier
            .confirm(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(confirmed, vec!["a".to_string()]);
    }
}
