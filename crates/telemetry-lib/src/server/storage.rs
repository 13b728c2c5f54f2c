//! Storage collaborators for admitted events

use crate::models::TelemetryEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Durable analytics store behind the ingestion gate
#[async_trait]
pub trait EventStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist the events; an error means none of them may be assumed stored
    async fn store(&self, events: &[TelemetryEvent]) -> Result<()>;
}

/// Keeps events in process memory
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<TelemetryEvent>>,
    fail_writes: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.events.read() {
            Ok(events) => events.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of stored events carrying the given id
    pub fn count_of(&self, event_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_id == event_id)
            .count()
    }

    pub fn conversion_summary(&self) -> ConversionSummary {
        ConversionSummary::from_events(&self.events())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, events: &[TelemetryEvent]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated analytics store outage");
        }
        let mut stored = self
            .events
            .write()
            .map_err(|_| anyhow::anyhow!("event store lock poisoned"))?;
        stored.extend_from_slice(events);
        Ok(())
    }
}

/// Appends events as JSON lines to a file
pub struct JsonlEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn store(&self, events: &[TelemetryEvent]) -> Result<()> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event).context("Failed to serialize event")?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open event log {:?}", self.path))?;
        file.write_all(&buf)
            .await
            .context("Failed to append events")?;
        file.sync_data().await.context("Failed to sync event log")?;

        debug!(path = %self.path.display(), events = events.len(), "Events appended");
        Ok(())
    }
}

/// Storefront funnel figures derived from stored events
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionSummary {
    pub cart_additions: usize,
    pub cart_removals: usize,
    pub checkout_starts: usize,
    pub checkout_completions: usize,
    pub product_views: usize,
    pub category_views: usize,
    pub search_queries: usize,
    /// Completions per checkout start, in percent
    pub conversion_rate: f64,
    pub average_order_value: f64,
    /// Cart additions that never reached a purchase, in percent
    pub cart_abandonment_rate: f64,
}

impl ConversionSummary {
    pub fn from_events(events: &[TelemetryEvent]) -> Self {
        let mut summary = Self::default();
        let mut order_total = 0.0;

        for event in events {
            match (event.category.as_str(), event.name.as_str()) {
                ("shop", "add_to_cart") => summary.cart_additions += 1,
                ("shop", "remove_from_cart") => summary.cart_removals += 1,
                ("shop", "begin_checkout") => summary.checkout_starts += 1,
                ("shop", "purchase") => {
                    summary.checkout_completions += 1;
                    order_total += event
                        .payload
                        .get("value")
                        .and_then(serde_json::Value::as_f64)
                        .unwrap_or(0.0);
                }
                ("shop", "search") => summary.search_queries += 1,
                ("navigation", _) if event.page.contains("/product/") => {
                    summary.product_views += 1
                }
                ("navigation", _) if event.page.contains("/category/") => {
                    summary.category_views += 1
                }
                _ => {}
            }
        }

        if summary.checkout_starts > 0 {
            summary.conversion_rate =
                summary.checkout_completions as f64 / summary.checkout_starts as f64 * 100.0;
        }
        if summary.cart_additions > 0 {
            summary.cart_abandonment_rate = summary
                .cart_additions
                .saturating_sub(summary.checkout_completions) as f64
                / summary.cart_additions as f64
                * 100.0;
        }
        if summary.checkout_completions > 0 {
            summary.average_order_value = order_total / summary.checkout_completions as f64;
        }
        summary
    }
}
