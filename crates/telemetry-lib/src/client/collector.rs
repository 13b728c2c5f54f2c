//! Event collection into per-session batches
//!
//! The collector validates events synchronously, assigns missing ids and
//! timestamps, and accumulates them per session. A batch that reaches the
//! size or age threshold is swapped out whole and handed back to the caller
//! for delivery, so an event is never in two batches at once.

use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use crate::models::{EventBatch, EventDraft, TelemetryEvent};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Default batch size threshold
const DEFAULT_MAX_BATCH_EVENTS: usize = 50;

/// Largest accepted serialized payload (16 KiB)
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// Configuration for the event collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Batch is handed off once it holds this many events
    pub max_batch_events: usize,
    /// Batch is handed off once its first event is this old
    pub max_batch_age: Duration,
    /// Maximum length of an event name
    pub max_name_len: usize,
    /// Maximum serialized payload size in bytes
    pub max_payload_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_batch_events: DEFAULT_MAX_BATCH_EVENTS,
            max_batch_age: Duration::from_secs(10),
            max_name_len: 64,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Batch under construction for one session
#[derive(Debug, Clone, Default)]
struct SessionBatch {
    events: Vec<TelemetryEvent>,
    /// Local clock reading when the first event was appended
    opened_at: i64,
}

impl SessionBatch {
    fn last_timestamp(&self) -> Option<i64> {
        self.events.last().map(|e| e.timestamp)
    }
}

/// All collector state, owned by a single collector instance
#[derive(Debug, Clone, Default)]
pub struct CollectorState {
    sessions: HashMap<String, SessionBatch>,
}

impl CollectorState {
    pub fn pending_events(&self) -> usize {
        self.sessions.values().map(|b| b.events.len()).sum()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Validate the fields every event must carry
pub fn validate_draft(draft: &EventDraft, config: &CollectorConfig) -> Result<()> {
    let name = draft.name.trim();
    if name.is_empty() {
        return Err(PipelineError::validation("event name is required"));
    }
    if name.len() > config.max_name_len {
        return Err(PipelineError::validation(format!(
            "event name exceeds {} characters",
            config.max_name_len
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
    {
        return Err(PipelineError::validation(format!(
            "event name {:?} contains unsupported characters",
            name
        )));
    }
    if draft.session_id.trim().is_empty() {
        return Err(PipelineError::validation("session id is required"));
    }
    if let Some(id) = &draft.event_id {
        if id.trim().is_empty() {
            return Err(PipelineError::validation("event id must not be blank"));
        }
    }
    if let Some(timestamp) = draft.timestamp {
        if timestamp <= 0 {
            return Err(PipelineError::validation(format!(
                "timestamp must be positive, got {}",
                timestamp
            )));
        }
    }

    let payload_size = serde_json::to_vec(&draft.payload)
        .map_err(|e| PipelineError::validation(format!("payload is not serializable: {}", e)))?
        .len();
    if payload_size > config.max_payload_bytes {
        return Err(PipelineError::validation(format!(
            "payload is {} bytes, limit is {}",
            payload_size, config.max_payload_bytes
        )));
    }

    Ok(())
}

/// Accumulates events into per-session batches
pub struct EventCollector {
    config: CollectorConfig,
    clock: SharedClock,
    state: CollectorState,
}

impl EventCollector {
    pub fn new(config: CollectorConfig, clock: SharedClock) -> Self {
        Self::with_state(config, clock, CollectorState::default())
    }

    /// Resume from a previously extracted state
    pub fn with_state(config: CollectorConfig, clock: SharedClock, state: CollectorState) -> Self {
        Self {
            config,
            clock,
            state,
        }
    }

    pub fn into_state(self) -> CollectorState {
        self.state
    }

    pub fn state(&self) -> &CollectorState {
        &self.state
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Record an event.
    ///
    /// Returns the session's batch when this event made it ready for
    /// delivery; the collector has already started a fresh batch by then.
    pub fn record(&mut self, draft: EventDraft) -> Result<Option<EventBatch>> {
        validate_draft(&draft, &self.config)?;

        let now = self.clock.now_ms();
        let session_id = draft.session_id.clone();
        let last = self
            .state
            .sessions
            .get(&session_id)
            .and_then(SessionBatch::last_timestamp);

        let mut timestamp = draft.timestamp.unwrap_or(now);
        if let Some(last) = last {
            if timestamp < last {
                debug!(
                    session_id = %session_id,
                    timestamp,
                    last,
                    "Clamping out-of-order event timestamp"
                );
                timestamp = last;
            }
        }

        let event = TelemetryEvent {
            event_id: draft
                .event_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: draft.name.trim().to_string(),
            category: draft.category,
            session_id: session_id.clone(),
            page: draft.page,
            timestamp,
            payload: draft.payload,
        };
        // Same rules the gate applies; catches a clock that reads zero
        if let Some(reason) = event.shape_error() {
            return Err(PipelineError::validation(reason));
        }

        let batch = self.state.sessions.entry(session_id.clone()).or_default();
        if batch.events.is_empty() {
            batch.opened_at = now;
        }
        batch.events.push(event);

        if self.flush_ready(&session_id, now) {
            return Ok(self.take_session(&session_id));
        }
        Ok(None)
    }

    /// True when the session's batch hit the size or age threshold
    pub fn flush_ready(&self, session_id: &str, now: i64) -> bool {
        match self.state.sessions.get(session_id) {
            Some(batch) if !batch.events.is_empty() => {
                batch.events.len() >= self.config.max_batch_events
                    || now - batch.opened_at >= self.config.max_batch_age.as_millis() as i64
            }
            _ => false,
        }
    }

    /// Swap out every batch whose age threshold has elapsed
    pub fn take_due(&mut self, now: i64) -> Vec<EventBatch> {
        let due: Vec<String> = self
            .state
            .sessions
            .keys()
            .filter(|session| self.flush_ready(session, now))
            .cloned()
            .collect();

        due.iter()
            .filter_map(|session| self.take_session(session))
            .collect()
    }

    /// Swap out every non-empty batch regardless of thresholds
    pub fn drain_all(&mut self) -> Vec<EventBatch> {
        std::mem::take(&mut self.state.sessions)
            .into_values()
            .filter(|b| !b.events.is_empty())
            .map(|b| EventBatch::new(b.events))
            .collect()
    }

    fn take_session(&mut self, session_id: &str) -> Option<EventBatch> {
        let batch = self.state.sessions.remove(session_id)?;
        if batch.events.is_empty() {
            return None;
        }
        Some(EventBatch::new(batch.events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn collector(max_events: usize) -> (EventCollector, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let config = CollectorConfig {
            max_batch_events: max_events,
            max_batch_age: Duration::from_secs(10),
            ..Default::default()
        };
        (EventCollector::new(config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_record_assigns_id_and_timestamp() {
        let (mut collector, _clock) = collector(10);
        let handed_off = collector
            .record(EventDraft::new("page_view", "s1").page("/"))
            .unwrap();
        assert!(handed_off.is_none());

        let batches = collector.drain_all();
        let event = &batches[0].events[0];
        assert!(!event.event_id.is_empty());
        assert_eq!(event.timestamp, 1_000_000);
    }

    #[test]
    fn test_missing_session_is_rejected() {
        let (mut collector, _clock) = collector(10);
        let err = collector.record(EventDraft::new("page_view", "")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(collector.state().pending_events(), 0);
    }

    #[test]
    fn test_bad_name_is_rejected() {
        let (mut collector, _clock) = collector(10);
        assert!(collector.record(EventDraft::new("  ", "s1")).is_err());
        assert!(collector.record(EventDraft::new("add to cart", "s1")).is_err());
    }

    #[test]
    fn test_non_positive_timestamp_is_rejected() {
        let (mut collector, _clock) = collector(10);
        for timestamp in [0, -5] {
            let err = collector
                .record(EventDraft::new("page_view", "s1").timestamp(timestamp))
                .unwrap_err();
            assert!(matches!(err, PipelineError::Validation(_)));
        }
        assert_eq!(collector.state().pending_events(), 0);
    }

    #[test]
    fn test_zero_clock_reading_is_rejected() {
        let clock = ManualClock::new(0);
        let mut collector = EventCollector::new(CollectorConfig::default(), Arc::new(clock));
        assert!(matches!(
            collector.record(EventDraft::new("page_view", "s1")),
            Err(PipelineError::Validation(_))
        ));
        assert_eq!(collector.state().session_count(), 0);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let (mut collector, _clock) = collector(10);
        let draft = EventDraft::new("search", "s1").with("q", "x".repeat(20 * 1024));
        assert!(matches!(
            collector.record(draft),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_size_threshold_swaps_batch() {
        let (mut collector, _clock) = collector(3);
        assert!(collector.record(EventDraft::new("a", "s1")).unwrap().is_none());
        assert!(collector.record(EventDraft::new("b", "s1")).unwrap().is_none());
        let batch = collector.record(EventDraft::new("c", "s1")).unwrap().unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(collector.state().pending_events(), 0);

        // Next event starts a fresh batch
        collector.record(EventDraft::new("d", "s1")).unwrap();
        assert_eq!(collector.state().pending_events(), 1);
    }

    #[test]
    fn test_age_threshold() {
        let (mut collector, clock) = collector(100);
        collector.record(EventDraft::new("a", "s1")).unwrap();
        collector.record(EventDraft::new("b", "s2")).unwrap();

        assert!(collector.take_due(clock.now_ms()).is_empty());
        clock.advance(Duration::from_secs(11));
        let due = collector.take_due(clock.now_ms());
        assert_eq!(due.len(), 2);
        assert_eq!(collector.state().session_count(), 0);
    }

    #[test]
    fn test_sessions_are_batched_separately() {
        let (mut collector, _clock) = collector(2);
        collector.record(EventDraft::new("a", "s1")).unwrap();
        collector.record(EventDraft::new("b", "s2")).unwrap();
        let batch = collector.record(EventDraft::new("c", "s1")).unwrap().unwrap();

        assert!(batch.events.iter().all(|e| e.session_id == "s1"));
        assert_eq!(collector.state().pending_events(), 1);
    }

    #[test]
    fn test_timestamps_non_decreasing_within_batch() {
        let (mut collector, _clock) = collector(10);
        collector
            .record(EventDraft::new("a", "s1").timestamp(500))
            .unwrap();
        collector
            .record(EventDraft::new("b", "s1").timestamp(400))
            .unwrap();

        let batch = collector.drain_all().remove(0);
        assert_eq!(batch.events[1].timestamp, 500);
    }

    #[test]
    fn test_state_round_trips_through_owner() {
        let (mut collector, clock) = collector(10);
        collector.record(EventDraft::new("a", "s1")).unwrap();
        let state = collector.into_state();

        let resumed =
            EventCollector::with_state(CollectorConfig::default(), Arc::new(clock), state);
        assert_eq!(resumed.state().pending_events(), 1);
    }
}
