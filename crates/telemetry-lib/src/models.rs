//! Core data models for the telemetry pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form event payload
pub type Payload = BTreeMap<String, serde_json::Value>;

/// A single telemetry event as delivered to the ingestion gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Client-generated unique id, used for de-duplication on replay
    pub event_id: String,
    /// Event name, e.g. `page_view` or `add_to_cart`
    pub name: String,
    #[serde(default)]
    pub category: String,
    pub session_id: String,
    #[serde(default)]
    pub page: String,
    /// Client clock, milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Payload,
}

impl TelemetryEvent {
    /// Why the gate would refuse this event, if it would. Shared by the
    /// collector and the gate so a recorded event is always storable.
    pub fn shape_error(&self) -> Option<&'static str> {
        if self.event_id.trim().is_empty() {
            Some("event id is required")
        } else if self.name.trim().is_empty() {
            Some("event name is required")
        } else if self.session_id.trim().is_empty() {
            Some("session id is required")
        } else if self.timestamp <= 0 {
            Some("timestamp must be positive")
        } else {
            None
        }
    }
}

/// An event as produced by application code, before the collector
/// assigns an id and a timestamp
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventDraft {
    pub event_id: Option<String>,
    pub name: String,
    pub category: String,
    pub session_id: String,
    pub page: String,
    pub timestamp: Option<i64>,
    pub payload: Payload,
}

impl EventDraft {
    pub fn new(name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn page(mut self, page: impl Into<String>) -> Self {
        self.page = page.into();
        self
    }

    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Ordered group of events handed to delivery as a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<TelemetryEvent>,
}

impl EventBatch {
    pub fn new(events: Vec<TelemetryEvent>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.events.iter().map(|e| e.event_id.clone()).collect()
    }
}

/// An undelivered event plus its retry bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub event: TelemetryEvent,
    pub attempt_count: u32,
    /// Earliest time (ms epoch) the entry may be retried
    pub next_eligible_at: i64,
    pub first_queued_at: i64,
    /// Set when the event went out through the beacon and its arrival is
    /// still unconfirmed
    #[serde(default)]
    pub awaiting_verification: bool,
}

impl QueueEntry {
    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.first_queued_at
    }

    pub fn is_eligible(&self, now: i64) -> bool {
        self.next_eligible_at <= now
    }
}

/// Per-route admission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl LimiterConfig {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub fn window_ms(&self) -> i64 {
        (self.window_seconds as i64).saturating_mul(1000)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::new(100, 60)
    }
}

/// Deployment environment of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Generous limits, analyzer cleanup allowed
    Development,
    #[default]
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Outcome of one completed ingestion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleOutcome {
    Success,
    Error,
    Rejected,
}

/// Timing observation for one request against one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub route: String,
    pub duration_ms: f64,
    pub outcome: SampleOutcome,
    pub timestamp: i64,
}

/// Body of a successful ingestion response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub accepted: usize,
    #[serde(default)]
    pub duplicates: usize,
    #[serde(default)]
    pub invalid: usize,
}

/// Body of a rate-limited ingestion response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedBody {
    pub error: String,
    pub retry_after_seconds: u64,
}

/// Request for confirming which events the gate has stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub event_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub confirmed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format_is_camel_case() {
        let event = TelemetryEvent {
            event_id: "e-1".to_string(),
            name: "add_to_cart".to_string(),
            category: "shop".to_string(),
            session_id: "s1".to_string(),
            page: "/product/42".to_string(),
            timestamp: 1_700_000_000_000,
            payload: Payload::new(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventId"], "e-1");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("event_id").is_none());
    }

    #[test]
    fn test_event_optional_fields_default() {
        let json = r#"{"eventId":"e-2","name":"page_view","sessionId":"s1","timestamp":5}"#;
        let event: TelemetryEvent = serde_json::from_str(json).unwrap();
        assert!(event.category.is_empty());
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_limiter_config_window_ms() {
        assert_eq!(LimiterConfig::new(10, 60).window_ms(), 60_000);
    }

    #[test]
    fn test_environment_parses_lowercase() {
        let env: Environment = serde_json::from_str("\"development\"").unwrap();
        assert_eq!(env, Environment::Development);
        assert!(Environment::default().is_production());
    }

    #[test]
    fn test_draft_builder() {
        let draft = EventDraft::new("add_to_cart", "s1")
            .category("shop")
            .with("productId", 42);
        assert_eq!(draft.payload["productId"], 42);
        assert!(draft.event_id.is_none());
    }
}
