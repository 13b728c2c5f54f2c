//! Delivery strategy selection
//!
//! A batch walks an ordered list of strategies until one takes it:
//!
//! ```text
//! Pending -> Attempting(0) -> Attempting(1) -> ... -> Succeeded(i)
//!                                                   | Assumed(i)
//!                                                   | Failed
//! ```
//!
//! Network strategies report success; the beacon only reports that the send
//! was handed off, which ends in `Assumed`. [`DeliveryStrategySelector::deliver`]
//! adds the offline-queue discipline on top of a plain attempt.

use super::blocker::BlockerDetector;
use super::queue::OfflineQueue;
use super::transport::{BestEffortTransport, Transport};
use crate::error::{PipelineError, Result};
use crate::models::{EventBatch, IngestAck};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeouts and the verification window for delivery
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Per-attempt timeout for network strategies
    pub network_timeout: Duration,
    /// Shorter timeout used once blocking is suspected
    pub blocked_timeout: Duration,
    /// How long a beacon-sent event waits before it is verified or resent
    pub verification_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(5),
            blocked_timeout: Duration::from_millis(800),
            verification_window: Duration::from_secs(5 * 60),
        }
    }
}

/// How a strategy sends
#[derive(Clone)]
pub enum StrategyKind {
    Network(Arc<dyn Transport>),
    Beacon(Arc<dyn BestEffortTransport>),
}

impl fmt::Debug for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(t) => write!(f, "Network({})", t.name()),
            Self::Beacon(t) => write!(f, "Beacon({})", t.name()),
        }
    }
}

/// One entry in the ordered strategy list
#[derive(Debug, Clone)]
pub struct StrategyDescriptor {
    pub name: String,
    pub kind: StrategyKind,
    /// Overrides `network_timeout`; ignored for the beacon. Never exceeds
    /// `blocked_timeout` once blocking is suspected.
    pub timeout: Option<Duration>,
}

impl StrategyDescriptor {
    pub fn network(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            kind: StrategyKind::Network(transport),
            timeout: None,
        }
    }

    pub fn beacon(transport: Arc<dyn BestEffortTransport>) -> Self {
        Self {
            name: "beacon".to_string(),
            kind: StrategyKind::Beacon(transport),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_beacon(&self) -> bool {
        matches!(self.kind, StrategyKind::Beacon(_))
    }
}

/// Progress of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting(usize),
    Succeeded(usize),
    Assumed(usize),
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Assumed(_) | Self::Failed)
    }

    /// Next state when the current strategy did not take the batch
    fn advance(self, total: usize) -> Self {
        match self {
            Self::Attempting(i) if i + 1 < total => Self::Attempting(i + 1),
            Self::Pending if total > 0 => Self::Attempting(0),
            _ => Self::Failed,
        }
    }
}

/// Terminal result of a delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// A network strategy confirmed the batch
    Succeeded { strategy: String, ack: IngestAck },
    /// The beacon took the batch; arrival is unknown
    Assumed { strategy: String },
    /// Every strategy failed
    Failed {
        attempts: usize,
        /// Set when at least one strategy was refused with 429
        retry_after_secs: Option<u64>,
    },
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Assumed { .. } => "assumed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The failure as a pipeline error, if this outcome is one
    pub fn error(&self) -> Option<PipelineError> {
        match self {
            Self::Failed {
                retry_after_secs: Some(secs),
                ..
            } => Some(PipelineError::RateLimited {
                retry_after_secs: *secs,
            }),
            Self::Failed { attempts, .. } => {
                Some(PipelineError::DeliveryFailed { attempts: *attempts })
            }
            _ => None,
        }
    }
}

/// Walks the strategy list for each batch
pub struct DeliveryStrategySelector {
    strategies: Vec<StrategyDescriptor>,
    config: DeliveryConfig,
    detector: Arc<BlockerDetector>,
}

impl DeliveryStrategySelector {
    pub fn new(
        strategies: Vec<StrategyDescriptor>,
        config: DeliveryConfig,
        detector: Arc<BlockerDetector>,
    ) -> Self {
        Self {
            strategies,
            config,
            detector,
        }
    }

    /// Primary route, alternate route, then beacon
    pub fn with_default_order(
        primary: Arc<dyn Transport>,
        alternate: Arc<dyn Transport>,
        beacon: Arc<dyn BestEffortTransport>,
        config: DeliveryConfig,
        detector: Arc<BlockerDetector>,
    ) -> Self {
        Self::new(
            vec![
                StrategyDescriptor::network("primary", primary),
                StrategyDescriptor::network("alternate", alternate),
                StrategyDescriptor::beacon(beacon),
            ],
            config,
            detector,
        )
    }

    pub fn strategies(&self) -> &[StrategyDescriptor] {
        &self.strategies
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Cached blocker verdict, `None` before the first attempt
    pub fn blocked(&self) -> Option<bool> {
        self.detector.cached()
    }

    /// Run the state machine over every strategy, without touching the queue
    pub async fn attempt(&self, batch: &EventBatch) -> DeliveryOutcome {
        self.run(batch, |_| true).await
    }

    /// Attempt only the beacon strategies, used during teardown when
    /// network sends would be cancelled
    pub async fn attempt_beacon_only(&self, batch: &EventBatch) -> DeliveryOutcome {
        self.run(batch, StrategyDescriptor::is_beacon).await
    }

    /// Attempt delivery and apply the queue discipline to the outcome:
    /// failures are queued, beacon sends are parked for verification.
    pub async fn deliver(
        &self,
        batch: EventBatch,
        queue: &mut OfflineQueue,
        now: i64,
    ) -> Result<DeliveryOutcome> {
        let outcome = self.attempt(&batch).await;
        match &outcome {
            DeliveryOutcome::Succeeded { .. } => {}
            DeliveryOutcome::Assumed { .. } => {
                queue.park_new(batch.events, now, self.config.verification_window)?;
            }
            DeliveryOutcome::Failed { attempts, .. } => {
                let events = batch.len();
                let added = queue.enqueue_all(batch.events, now)?;
                warn!(events, added, attempts, "Delivery failed, events queued");
            }
        }
        Ok(outcome)
    }

    async fn run<F>(&self, batch: &EventBatch, include: F) -> DeliveryOutcome
    where
        F: Fn(&StrategyDescriptor) -> bool,
    {
        let candidates: Vec<&StrategyDescriptor> =
            self.strategies.iter().filter(|s| include(s)).collect();
        let blocked = self.detector.detect().await;

        let mut state = AttemptState::Pending.advance(candidates.len());
        let mut attempts = 0;
        let mut retry_after_secs = None;

        while let AttemptState::Attempting(i) = state {
            let strategy = candidates[i];
            attempts += 1;

            match &strategy.kind {
                StrategyKind::Network(transport) => {
                    let timeout = self.network_timeout(strategy, blocked);
                    match tokio::time::timeout(timeout, transport.send(batch)).await {
                        Ok(Ok(ack)) => {
                            if ack.invalid > 0 {
                                warn!(
                                    strategy = %strategy.name,
                                    invalid = ack.invalid,
                                    "Gate refused malformed events"
                                );
                            }
                            debug!(
                                strategy = %strategy.name,
                                accepted = ack.accepted,
                                duplicates = ack.duplicates,
                                "Batch delivered"
                            );
                            return DeliveryOutcome::Succeeded {
                                strategy: strategy.name.clone(),
                                ack,
                            };
                        }
                        Ok(Err(PipelineError::RateLimited {
                            retry_after_secs: secs,
                        })) => {
                            debug!(strategy = %strategy.name, retry_after_secs = secs, "Strategy rate limited");
                            retry_after_secs = Some(retry_after_secs.map_or(secs, |s: u64| s.max(secs)));
                        }
                        Ok(Err(e)) if e.is_retryable() => {
                            debug!(strategy = %strategy.name, error = %e, "Strategy failed");
                        }
                        Ok(Err(e)) => {
                            warn!(strategy = %strategy.name, error = %e, "Strategy failed permanently");
                        }
                        Err(_) => {
                            debug!(
                                strategy = %strategy.name,
                                timeout_ms = timeout.as_millis() as u64,
                                "Strategy timed out"
                            );
                        }
                    }
                }
                StrategyKind::Beacon(transport) => {
                    if transport.send_and_forget(batch) {
                        info!(strategy = %strategy.name, events = batch.len(), "Batch handed to beacon");
                        return DeliveryOutcome::Assumed {
                            strategy: strategy.name.clone(),
                        };
                    }
                    debug!(strategy = %strategy.name, "Beacon refused the batch");
                }
            }

            state = state.advance(candidates.len());
        }

        DeliveryOutcome::Failed {
            attempts,
            retry_after_secs,
        }
    }

    fn network_timeout(&self, strategy: &StrategyDescriptor, blocked: bool) -> Duration {
        match (blocked, strategy.timeout) {
            (true, Some(timeout)) => timeout.min(self.config.blocked_timeout),
            (true, None) => self.config.blocked_timeout,
            (false, timeout) => timeout.unwrap_or(self.config.network_timeout),
        }
    }
}
