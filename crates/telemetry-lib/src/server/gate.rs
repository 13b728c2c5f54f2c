//! Ingestion gate
//!
//! Every request, including one whose body does not decode, is checked
//! against the rate limiter before anything else. Admitted batches are
//! shape-checked, de-duplicated by `eventId` and handed to the
//! [`EventStore`]. Each request produces one performance sample for the
//! analyzer.
//!
//! Ids are claimed before the store call. A request that meets ids another
//! request is still storing waits for that store to settle, so concurrent
//! deliveries of one event store it once.

use super::analyzer::PerformanceAnalyzer;
use super::dedup::{Claim, RecentIdCache, DEFAULT_DEDUP_TTL};
use super::limiter::{AdmissionDecision, RateLimiter};
use super::storage::EventStore;
use crate::clock::{system_clock, SharedClock};
use crate::health::{components, HealthRegistry};
use crate::models::{
    EventBatch, IngestAck, PerformanceSample, SampleOutcome, TelemetryEvent,
};
use crate::observability::{PipelineMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Headers consulted for the client address, in order
pub const CLIENT_ADDR_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "cf-connecting-ip",
];

/// Header carrying an authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Who sent a request, as far as the gate can tell
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub addr: Option<String>,
    pub user: Option<String>,
}

impl ClientIdentity {
    pub fn new(addr: Option<String>, user: Option<String>) -> Self {
        Self { addr, user }
    }

    pub fn from_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: Some(addr.into()),
            user: None,
        }
    }

    /// Build from request headers. `get` returns a header value by
    /// lowercase name; `x-forwarded-for` contributes its first hop.
    pub fn from_headers<'a, F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let addr = CLIENT_ADDR_HEADERS.iter().find_map(|name| {
            get(name)
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        });
        let user = get(USER_ID_HEADER)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self { addr, user }
    }
}

/// How endpoint keys are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One window per route
    Route,
    /// One window per route and client address
    #[default]
    RouteAndClient,
    /// One window per route and user, falling back to the client address
    RouteAndUser,
}

impl KeyStrategy {
    pub fn key(&self, route: &str, client: &ClientIdentity) -> String {
        let subject = match self {
            Self::Route => None,
            Self::RouteAndClient => client.addr.as_deref().map(|a| format!("ip:{}", coarse_id(a))),
            Self::RouteAndUser => client
                .user
                .as_deref()
                .map(|u| format!("user:{}", coarse_id(u)))
                .or_else(|| client.addr.as_deref().map(|a| format!("ip:{}", coarse_id(a)))),
        };
        match subject {
            Some(subject) => format!("{}|{}", route, subject),
            None if *self == Self::Route => route.to_string(),
            None => format!("{}|anonymous", route),
        }
    }
}

/// Short stable digest so raw addresses never end up in limiter state or logs
fn coarse_id(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub key_strategy: KeyStrategy,
    /// How long stored ids are remembered
    pub dedup_ttl: Duration,
    /// Requests with more events are refused whole
    pub max_events_per_request: usize,
    /// How long a request waits on ids another request is still storing
    pub in_flight_wait: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::default(),
            dedup_ttl: DEFAULT_DEDUP_TTL,
            max_events_per_request: 500,
            in_flight_wait: Duration::from_secs(5),
        }
    }
}

/// One ingestion call
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub route: String,
    pub client: ClientIdentity,
    pub batch: EventBatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestResponse {
    Accepted {
        ack: IngestAck,
        decision: AdmissionDecision,
    },
    RateLimited {
        retry_after_secs: u64,
        decision: AdmissionDecision,
    },
    /// The request itself is unusable
    Invalid(String),
    /// The analytics store failed or the events are still being stored by
    /// another request; the client should retry
    StorageFailed(String),
}

impl IngestResponse {
    pub fn decision(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "admitted",
            Self::RateLimited { .. } => "rejected",
            Self::Invalid(_) => "invalid",
            Self::StorageFailed(_) => "storage_failed",
        }
    }
}

/// Server-side shape check, the same rules the collector applies
pub fn is_well_formed(event: &TelemetryEvent) -> bool {
    event.shape_error().is_none()
}

pub struct IngestionGate {
    config: GateConfig,
    limiter: Arc<RateLimiter>,
    analyzer: Arc<PerformanceAnalyzer>,
    store: Arc<dyn EventStore>,
    recent: RecentIdCache,
    clock: SharedClock,
    health: Option<HealthRegistry>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl IngestionGate {
    pub fn builder(store: Arc<dyn EventStore>) -> IngestionGateBuilder {
        IngestionGateBuilder::new(store)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn analyzer(&self) -> &Arc<PerformanceAnalyzer> {
        &self.analyzer
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub async fn ingest(&self, request: IngestRequest) -> IngestResponse {
        self.handle(&request.route, &request.client, Ok(request.batch))
            .await
    }

    /// A request whose body could not be decoded. It still counts against
    /// the caller's window and still produces a performance sample.
    pub async fn reject_malformed(
        &self,
        route: &str,
        client: &ClientIdentity,
        reason: impl Into<String>,
    ) -> IngestResponse {
        self.handle(route, client, Err(reason.into())).await
    }

    async fn handle(
        &self,
        route: &str,
        client: &ClientIdentity,
        body: std::result::Result<EventBatch, String>,
    ) -> IngestResponse {
        let started = Instant::now();
        let now = self.clock.now_ms();

        let key = self.config.key_strategy.key(route, client);
        let decision = self.limiter.check(route, &key, now);

        let (response, outcome) = if !decision.admitted {
            self.logger
                .log_rate_limited(route, &key, decision.retry_after_secs);
            (
                IngestResponse::RateLimited {
                    retry_after_secs: decision.retry_after_secs,
                    decision,
                },
                SampleOutcome::Rejected,
            )
        } else {
            match body {
                Ok(batch) => self.admit(route, batch, decision, now).await,
                Err(reason) => {
                    debug!(route = %route, reason = %reason, "Malformed batch refused");
                    (
                        IngestResponse::Invalid(format!("malformed batch: {}", reason)),
                        SampleOutcome::Error,
                    )
                }
            }
        };

        let elapsed = started.elapsed();
        self.analyzer.record(PerformanceSample {
            route: route.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            outcome,
            timestamp: now,
        });
        self.metrics
            .observe_ingest(route, response.decision(), elapsed);
        self.report_limiter_health().await;
        response
    }

    async fn admit(
        &self,
        route: &str,
        batch: EventBatch,
        decision: AdmissionDecision,
        now: i64,
    ) -> (IngestResponse, SampleOutcome) {
        if batch.len() > self.config.max_events_per_request {
            let message = format!(
                "batch of {} events exceeds limit of {}",
                batch.len(),
                self.config.max_events_per_request
            );
            return (IngestResponse::Invalid(message), SampleOutcome::Error);
        }

        let mut ack = IngestAck::default();
        let mut in_batch = HashSet::new();
        let mut pending = Vec::with_capacity(batch.len());

        for event in batch.events {
            if !is_well_formed(&event) {
                ack.invalid += 1;
                continue;
            }
            if !in_batch.insert(event.event_id.clone()) {
                ack.duplicates += 1;
                continue;
            }
            pending.push(event);
        }

        let deadline = tokio::time::Instant::now() + self.config.in_flight_wait;
        while !pending.is_empty() {
            // Registered before claiming so a release in between is not missed
            let settled = self.recent.settled();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let (reservation, claims) = {
                let ids: Vec<&str> = pending.iter().map(|e| e.event_id.as_str()).collect();
                self.recent.reserve(&ids, self.clock.now_ms())
            };

            let mut fresh = Vec::with_capacity(pending.len());
            let mut waiting = Vec::new();
            for (event, claim) in pending.drain(..).zip(claims) {
                match claim {
                    Claim::Reserved => fresh.push(event),
                    Claim::Seen => ack.duplicates += 1,
                    Claim::InFlight => waiting.push(event),
                }
            }

            if !fresh.is_empty() {
                if let Err(e) = self.store.store(&fresh).await {
                    // Unclaimed so a retry can store them
                    drop(reservation);
                    let message = format!("{:#}", e);
                    self.logger.log_storage_failure(route, fresh.len(), &message);
                    self.metrics.inc_storage_failures();
                    if let Some(health) = &self.health {
                        health.set_degraded(components::STORAGE, message.clone()).await;
                    }
                    return (IngestResponse::StorageFailed(message), SampleOutcome::Error);
                }
                reservation.confirm(self.clock.now_ms());
                ack.accepted += fresh.len();
                if let Some(health) = &self.health {
                    health.set_healthy(components::STORAGE).await;
                }
            }

            if waiting.is_empty() {
                break;
            }

            debug!(
                route = %route,
                waiting = waiting.len(),
                in_flight = self.recent.in_flight(),
                "Waiting for another request to store the same events"
            );
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                let message = format!(
                    "{} events are still being stored by another request",
                    waiting.len()
                );
                warn!(route = %route, waiting = waiting.len(), "Gave up waiting on in-flight events");
                self.metrics
                    .add_events(ack.accepted, ack.duplicates, ack.invalid);
                if let Some(health) = &self.health {
                    health.set_degraded(components::INGESTION, message.clone()).await;
                }
                return (IngestResponse::StorageFailed(message), SampleOutcome::Error);
            }
            pending = waiting;
        }

        self.metrics
            .add_events(ack.accepted, ack.duplicates, ack.invalid);
        if let Some(health) = &self.health {
            health.set_healthy(components::INGESTION).await;
        }
        debug!(
            route = %route,
            store = self.store.name(),
            accepted = ack.accepted,
            duplicates = ack.duplicates,
            invalid = ack.invalid,
            "Batch ingested"
        );

        (IngestResponse::Accepted { ack, decision }, SampleOutcome::Success)
    }

    /// A disabled limiter serves, without the protection it is there for
    async fn report_limiter_health(&self) {
        let Some(health) = &self.health else {
            return;
        };
        if self.limiter.is_enabled() {
            health.set_healthy(components::LIMITER).await;
        } else {
            health
                .set_degraded(components::LIMITER, "rate limiter disabled")
                .await;
        }
    }

    /// Which of the ids were stored within the dedup TTL
    pub fn verify(&self, event_ids: &[String]) -> Vec<String> {
        self.recent.confirmed(event_ids, self.clock.now_ms())
    }
}

pub struct IngestionGateBuilder {
    store: Arc<dyn EventStore>,
    config: GateConfig,
    limiter: Option<Arc<RateLimiter>>,
    analyzer: Option<Arc<PerformanceAnalyzer>>,
    clock: Option<SharedClock>,
    health: Option<HealthRegistry>,
}

impl IngestionGateBuilder {
    fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            config: GateConfig::default(),
            limiter: None,
            analyzer: None,
            clock: None,
            health: None,
        }
    }

    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn analyzer(mut self, analyzer: Arc<PerformanceAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> IngestionGate {
        IngestionGate {
            recent: RecentIdCache::new(self.config.dedup_ttl),
            config: self.config,
            limiter: self.limiter.unwrap_or_default(),
            analyzer: self.analyzer.unwrap_or_default(),
            store: self.store,
            clock: self.clock.unwrap_or_else(system_clock),
            health: self.health,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("gate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{LimiterConfig, Payload};
    use crate::server::limiter::LimiterTable;
    use crate::server::storage::MemoryEventStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROUTE: &str = "/api/analytics/events";
    const ALTERNATE: &str = "/api/collect/b";

    /// Memory store whose writes take a while and can fail a set number of times
    struct SlowStore {
        inner: MemoryEventStore,
        delay: Duration,
        failures_left: AtomicUsize,
    }

    impl SlowStore {
        fn new(delay: Duration, failures: usize) -> Self {
            Self {
                inner: MemoryEventStore::new(),
                delay,
                failures_left: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl EventStore for SlowStore {
        fn name(&self) -> &str {
            "slow"
        }

        async fn store(&self, events: &[TelemetryEvent]) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                anyhow::bail!("analytics store unavailable");
            }
            self.inner.store(events).await
        }
    }

    fn slow_gate(store: Arc<SlowStore>) -> IngestionGate {
        IngestionGate::builder(store)
            .clock(Arc::new(ManualClock::new(1_000_000)))
            .build()
    }

    fn request_on(route: &str, ids: &[&str]) -> IngestRequest {
        IngestRequest {
            route: route.to_string(),
            ..request(ids)
        }
    }

    fn event(id: &str) -> TelemetryEvent {
        TelemetryEvent {
            event_id: id.to_string(),
            name: "add_to_cart".to_string(),
            category: "shop".to_string(),
            session_id: "s1".to_string(),
            page: "/product/7".to_string(),
            timestamp: 1_700_000_000_000,
            payload: Payload::new(),
        }
    }

    fn request(ids: &[&str]) -> IngestRequest {
        IngestRequest {
            route: ROUTE.to_string(),
            client: ClientIdentity::from_addr("203.0.113.9"),
            batch: EventBatch::new(ids.iter().map(|id| event(id)).collect()),
        }
    }

    fn gate(max_requests: u32) -> (IngestionGate, Arc<MemoryEventStore>, ManualClock) {
        let store = Arc::new(MemoryEventStore::new());
        let clock = ManualClock::new(1_000_000);
        let limiter = Arc::new(RateLimiter::new(
            LimiterTable::default().with_route(ROUTE, LimiterConfig::new(max_requests, 60)),
        ));
        let gate = IngestionGate::builder(store.clone())
            .limiter(limiter)
            .clock(Arc::new(clock.clone()))
            .build();
        (gate, store, clock)
    }

    #[tokio::test]
    async fn test_accepts_and_stores() {
        let (gate, store, _clock) = gate(10);
        let response = gate.ingest(request(&["a", "b"])).await;

        assert!(matches!(response, IngestResponse::Accepted { ref ack, .. } if ack.accepted == 2));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicates_are_not_stored_twice() {
        let (gate, store, _clock) = gate(10);
        gate.ingest(request(&["a", "b"])).await;
        let response = gate.ingest(request(&["b", "c", "c"])).await;

        match response {
            IngestResponse::Accepted { ack, .. } => {
                assert_eq!(ack.accepted, 1);
                assert_eq!(ack.duplicates, 2);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(store.count_of("b"), 1);
    }

    #[tokio::test]
    async fn test_invalid_events_are_counted() {
        let (gate, store, _clock) = gate(10);
        let mut req = request(&["a"]);
        let mut broken = event("");
        broken.name = String::new();
        req.batch.events.push(broken);

        let response = gate.ingest(req).await;
        assert!(matches!(response, IngestResponse::Accepted { ref ack, .. } if ack.invalid == 1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_skips_storage() {
        let (gate, store, _clock) = gate(1);
        gate.ingest(request(&["a"])).await;
        let response = gate.ingest(request(&["b"])).await;

        assert!(matches!(response, IngestResponse::RateLimited { retry_after_secs, .. } if retry_after_secs >= 1));
        assert_eq!(store.count_of("b"), 0);

        let stats = gate.analyzer().stats(ROUTE, 1_000_000);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.rejected_count, 1);
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_remember_ids() {
        let (gate, store, _clock) = gate(10);
        store.set_fail_writes(true);
        let response = gate.ingest(request(&["a"])).await;
        assert!(matches!(response, IngestResponse::StorageFailed(_)));
        assert!(gate.verify(&["a".to_string()]).is_empty());

        store.set_fail_writes(false);
        let response = gate.ingest(request(&["a"])).await;
        assert!(matches!(response, IngestResponse::Accepted { ref ack, .. } if ack.accepted == 1));
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_health() {
        let store = Arc::new(MemoryEventStore::new());
        let health = HealthRegistry::for_gate().await;
        let gate = IngestionGate::builder(store.clone())
            .health(health.clone())
            .build();

        store.set_fail_writes(true);
        gate.ingest(request(&["a"])).await;
        assert_eq!(
            health.status_of(components::STORAGE).await,
            Some(crate::health::ComponentStatus::Degraded)
        );
    }

    #[tokio::test]
    async fn test_verify_forgets_after_ttl() {
        let (gate, _store, clock) = gate(10);
        gate.ingest(request(&["a"])).await;
        assert_eq!(gate.verify(&["a".to_string()]), vec!["a".to_string()]);

        clock.advance(Duration::from_secs(16 * 60));
        assert!(gate.verify(&["a".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_is_invalid() {
        let (gate, store, _clock) = gate(10);
        let ids: Vec<String> = (0..501).map(|i| format!("e{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        assert!(matches!(gate.ingest(request(&refs)).await, IngestResponse::Invalid(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_timestamp_is_invalid() {
        let (gate, store, _clock) = gate(10);
        let mut req = request(&["a"]);
        let mut stale = event("b");
        stale.timestamp = 0;
        req.batch.events.push(stale);

        let response = gate.ingest(req).await;
        assert!(matches!(response, IngestResponse::Accepted { ref ack, .. } if ack.accepted == 1 && ack.invalid == 1));
        assert_eq!(store.count_of("b"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_deliveries_store_once() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(100), 0));
        let gate = slow_gate(store.clone());

        let (first, second) = tokio::join!(
            gate.ingest(request_on(ROUTE, &["a"])),
            gate.ingest(request_on(ALTERNATE, &["a"])),
        );

        assert_eq!(store.inner.count_of("a"), 1);
        let acks: Vec<IngestAck> = [first, second]
            .into_iter()
            .map(|response| match response {
                IngestResponse::Accepted { ack, .. } => ack,
                other => panic!("unexpected response {:?}", other),
            })
            .collect();
        assert_eq!(acks.iter().map(|a| a.accepted).sum::<usize>(), 1);
        assert_eq!(acks.iter().map(|a| a.duplicates).sum::<usize>(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_request_stores_after_failed_store() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(100), 1));
        let gate = slow_gate(store.clone());

        let (first, second) = tokio::join!(
            gate.ingest(request_on(ROUTE, &["a"])),
            gate.ingest(request_on(ALTERNATE, &["a"])),
        );

        assert!(matches!(first, IngestResponse::StorageFailed(_)));
        assert!(matches!(second, IngestResponse::Accepted { ref ack, .. } if ack.accepted == 1));
        assert_eq!(store.inner.count_of("a"), 1);
        assert_eq!(gate.verify(&["a".to_string()]), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_releases_its_ids() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(100), 0));
        let gate = slow_gate(store.clone());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), gate.ingest(request(&["a"]))).await;
        assert!(cancelled.is_err());
        assert_eq!(gate.recent.in_flight(), 0);

        let response = gate.ingest(request(&["a"])).await;
        assert!(matches!(response, IngestResponse::Accepted { ref ack, .. } if ack.accepted == 1));
        assert_eq!(store.inner.count_of("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_waiting_on_stuck_store() {
        let store = Arc::new(SlowStore::new(Duration::from_secs(60), 0));
        let health = HealthRegistry::for_gate().await;
        let gate = Arc::new(
            IngestionGate::builder(store.clone())
                .clock(Arc::new(ManualClock::new(1_000_000)))
                .health(health.clone())
                .build(),
        );

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.ingest(request_on(ROUTE, &["a"])).await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let started = tokio::time::Instant::now();
        let second = gate.ingest(request_on(ALTERNATE, &["a"])).await;
        assert!(matches!(second, IngestResponse::StorageFailed(ref m) if m.contains("another request")));
        assert!(started.elapsed() >= gate.config().in_flight_wait);
        assert_eq!(
            health.status_of(components::INGESTION).await,
            Some(crate::health::ComponentStatus::Degraded)
        );

        first.abort();
    }

    #[tokio::test]
    async fn test_malformed_body_counts_against_limiter() {
        let (gate, store, _clock) = gate(1);
        let client = ClientIdentity::from_addr("203.0.113.9");

        let first = gate.reject_malformed(ROUTE, &client, "expected value").await;
        assert!(matches!(first, IngestResponse::Invalid(ref m) if m.contains("malformed")));
        let second = gate.reject_malformed(ROUTE, &client, "expected value").await;
        assert!(matches!(second, IngestResponse::RateLimited { .. }));
        assert!(matches!(gate.ingest(request(&["a"])).await, IngestResponse::RateLimited { .. }));
        assert!(store.is_empty());

        let stats = gate.analyzer().stats(ROUTE, 1_000_000);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.rejected_count, 2);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test]
    async fn test_limiter_health_follows_kill_switch() {
        let store = Arc::new(MemoryEventStore::new());
        let health = HealthRegistry::for_gate().await;
        let gate = IngestionGate::builder(store).health(health.clone()).build();

        gate.limiter().set_enabled(false);
        gate.ingest(request(&["a"])).await;
        assert_eq!(
            health.status_of(components::LIMITER).await,
            Some(crate::health::ComponentStatus::Degraded)
        );

        gate.limiter().set_enabled(true);
        gate.ingest(request(&["b"])).await;
        assert_eq!(
            health.status_of(components::LIMITER).await,
            Some(crate::health::ComponentStatus::Healthy)
        );
    }

    #[test]
    fn test_client_identity_from_headers() {
        let headers = [
            ("x-forwarded-for", "198.51.100.4, 10.0.0.1"),
            ("x-user-id", "u-42"),
        ];
        let client = ClientIdentity::from_headers(|name| {
            headers.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
        });

        assert_eq!(client.addr.as_deref(), Some("198.51.100.4"));
        assert_eq!(client.user.as_deref(), Some("u-42"));
    }

    #[test]
    fn test_key_strategies() {
        let client = ClientIdentity::new(Some("198.51.100.4".into()), Some("u-1".into()));
        let anonymous = ClientIdentity::from_addr("198.51.100.4");

        assert_eq!(KeyStrategy::Route.key(ROUTE, &client), ROUTE);
        let by_ip = KeyStrategy::RouteAndClient.key(ROUTE, &client);
        assert!(by_ip.starts_with("/api/analytics/events|ip:"));
        assert!(!by_ip.contains("198.51"));
        assert!(KeyStrategy::RouteAndUser.key(ROUTE, &client).contains("|user:"));
        assert_eq!(KeyStrategy::RouteAndUser.key(ROUTE, &anonymous), by_ip);
        assert!(KeyStrategy::RouteAndClient
            .key(ROUTE, &ClientIdentity::default())
            .ends_with("|anonymous"));
    }
}
