//! Client pipeline actor
//!
//! One task owns the collector, the delivery selector, the offline queue and
//! the flush manager. Application code talks to it through a cloneable
//! [`PipelineHandle`]; only validation errors ever come back from `record`.

use super::collector::{validate_draft, CollectorConfig, EventCollector};
use super::delivery::{DeliveryConfig, DeliveryOutcome, DeliveryStrategySelector};
use super::flush::{DeliveryVerifier, FlushConfig, FlushManager, FlushReport, FlushTrigger};
use super::queue::{OfflineQueue, QueueStats};
use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use crate::models::{EventBatch, EventDraft};
use crate::observability::{PipelineMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Everything the client pipeline can be tuned with
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub collector: CollectorConfig,
    pub delivery: DeliveryConfig,
    pub flush: FlushConfig,
    /// How often batches are checked against the age threshold
    pub age_check_interval: Duration,
    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            delivery: DeliveryConfig::default(),
            flush: FlushConfig::default(),
            age_check_interval: Duration::from_secs(1),
            command_buffer: 256,
        }
    }
}

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub pending_events: usize,
    pub sessions: usize,
    pub queue: QueueStats,
    /// `None` until blocker detection has run
    pub blocked: Option<bool>,
}

/// What happened to pending batches on unload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// Events written to the queue before any send
    pub parked: usize,
    /// Batches the beacon accepted
    pub beaconed: usize,
}

enum Command {
    Record(EventDraft),
    Flush {
        trigger: FlushTrigger,
        reply: Option<oneshot::Sender<Result<FlushReport>>>,
    },
    Stats(oneshot::Sender<PipelineStats>),
    Unload(oneshot::Sender<UnloadReport>),
}

/// Cloneable handle to a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Command>,
    collector_config: CollectorConfig,
}

impl PipelineHandle {
    /// Validate and submit an event. Validation happens here, on the
    /// caller's side, so a malformed event is never queued.
    pub async fn record(&self, draft: EventDraft) -> Result<()> {
        validate_draft(&draft, &self.collector_config)?;
        self.send(Command::Record(draft)).await
    }

    /// Hand off pending batches and replay the offline queue now
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Flush {
            trigger: FlushTrigger::Manual,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| PipelineError::PipelineClosed)?
    }

    /// Connectivity came back
    pub async fn notify_reconnect(&self) -> Result<()> {
        self.signal(FlushTrigger::Reconnect).await
    }

    /// The page or app became visible again
    pub async fn notify_visible(&self) -> Result<()> {
        self.signal(FlushTrigger::Visible).await
    }

    /// Tear down: park pending batches, send them by beacon only, stop
    pub async fn unload(&self) -> Result<UnloadReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unload(reply)).await?;
        rx.await.map_err(|_| PipelineError::PipelineClosed)
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| PipelineError::PipelineClosed)
    }

    async fn signal(&self, trigger: FlushTrigger) -> Result<()> {
        self.send(Command::Flush {
            trigger,
            reply: None,
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PipelineError::PipelineClosed)
    }
}

/// The pipeline actor
pub struct TelemetryPipeline {
    config: PipelineConfig,
    collector: EventCollector,
    selector: DeliveryStrategySelector,
    queue: OfflineQueue,
    flusher: FlushManager,
    clock: SharedClock,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl TelemetryPipeline {
    pub fn new(
        config: PipelineConfig,
        selector: DeliveryStrategySelector,
        queue: OfflineQueue,
        clock: SharedClock,
    ) -> Self {
        Self {
            collector: EventCollector::new(config.collector.clone(), clock.clone()),
            flusher: FlushManager::new(config.flush.clone()),
            config,
            selector,
            queue,
            clock,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("client"),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DeliveryVerifier>) -> Self {
        self.flusher = FlushManager::new(self.config.flush.clone()).with_verifier(verifier);
        self
    }

    /// Start the actor task
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> (PipelineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_buffer);
        let handle = PipelineHandle {
            tx,
            collector_config: self.config.collector.clone(),
        };
        let task = tokio::spawn(self.run(rx, shutdown));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            queued = self.queue.len(),
            flush_interval_secs = self.config.flush.interval.as_secs(),
            "Starting telemetry pipeline"
        );

        // Replay whatever survived the last session
        if !self.queue.is_empty() {
            let _ = self.flush(FlushTrigger::Startup).await;
        }

        let mut flush_ticker = interval_at(
            Instant::now() + self.config.flush.interval,
            self.config.flush.interval,
        );
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut age_ticker = interval(self.config.age_check_interval);
        age_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Unload(reply)) => {
                            let report = self.unload().await;
                            let _ = reply.send(report);
                            break;
                        }
                        Some(command) => self.handle(command).await,
                        None => {
                            self.drain().await;
                            break;
                        }
                    }
                }
                _ = flush_ticker.tick() => {
                    let _ = self.flush(FlushTrigger::Interval).await;
                }
                _ = age_ticker.tick() => {
                    let now = self.clock.now_ms();
                    for batch in self.collector.take_due(now) {
                        self.deliver(batch).await;
                    }
                }
                _ = shutdown.recv() => {
                    self.drain().await;
                    break;
                }
            }
        }

        self.logger.log_pipeline_stopped(self.queue.len());
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Record(draft) => match self.collector.record(draft) {
                Ok(Some(batch)) => self.deliver(batch).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Event rejected by collector"),
            },
            Command::Flush { trigger, reply } => {
                if trigger == FlushTrigger::Manual {
                    for batch in self.collector.drain_all() {
                        self.deliver(batch).await;
                    }
                }
                let result = self.flush(trigger).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Unload(_) => {}
        }
    }

    async fn deliver(&mut self, batch: EventBatch) {
        let now = self.clock.now_ms();
        let events = batch.len();
        match self.selector.deliver(batch, &mut self.queue, now).await {
            Ok(outcome) => self.record_outcome(&outcome, events),
            Err(e) => {
                // Events that could not be queued are lost
                error!(error = %e, events, "Failed to queue undelivered events");
                self.metrics.inc_persistence_errors();
            }
        }
        self.metrics.set_queue_depth(self.queue.len() as i64);
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> Result<FlushReport> {
        let now = self.clock.now_ms();
        let dropped_before = self.queue.dropped_total();
        let result = self
            .flusher
            .run(trigger, &self.selector, &mut self.queue, now)
            .await;

        match &result {
            Ok(report) => {
                if report.purged > 0 {
                    self.logger
                        .log_retention_drop(report.purged, self.queue.config().retention);
                }
                self.metrics.observe_flush(report);
            }
            Err(e) => {
                error!(error = %e, trigger = %trigger, "Flush aborted");
                self.metrics.inc_persistence_errors();
            }
        }
        self.metrics
            .inc_queue_drops(self.queue.dropped_total() - dropped_before);
        self.metrics.set_queue_depth(self.queue.len() as i64);
        result
    }

    /// Park first, then beacon; network sends would not survive teardown
    async fn unload(&mut self) -> UnloadReport {
        let now = self.clock.now_ms();
        let window = self.selector.config().verification_window;
        let mut report = UnloadReport::default();

        for batch in self.collector.drain_all() {
            let ids = batch.event_ids();
            match self.queue.park_new(batch.events.clone(), now, window) {
                Ok(parked) => report.parked += parked,
                Err(e) => error!(error = %e, events = ids.len(), "Failed to park events on unload"),
            }

            let outcome = self.selector.attempt_beacon_only(&batch).await;
            self.record_outcome(&outcome, ids.len());
            match outcome {
                DeliveryOutcome::Assumed { .. } => report.beaconed += 1,
                _ => {
                    // Nothing left the device; retry these normally next session
                    if let Err(e) = self.queue.release_unverified(&ids) {
                        error!(error = %e, "Failed to release parked events");
                    }
                }
            }
        }

        info!(
            parked = report.parked,
            beaconed = report.beaconed,
            "Telemetry pipeline unloaded"
        );
        report
    }

    /// Deliver everything still pending, then stop
    async fn drain(&mut self) {
        for batch in self.collector.drain_all() {
            self.deliver(batch).await;
        }
    }

    fn record_outcome(&self, outcome: &DeliveryOutcome, events: usize) {
        self.metrics.inc_delivery_outcome(outcome.label(), events);
        if let DeliveryOutcome::Succeeded { ack, .. } = outcome {
            if ack.invalid > 0 {
                self.metrics.inc_delivery_outcome("refused", ack.invalid);
            }
        }
        self.logger.log_delivery_outcome(outcome, events);
    }

    fn stats(&self) -> PipelineStats {
        let state = self.collector.state();
        PipelineStats {
            pending_events: state.pending_events(),
            sessions: state.session_count(),
            queue: self.queue.stats(self.clock.now_ms()),
            blocked: self.selector.blocked(),
        }
    }
}
