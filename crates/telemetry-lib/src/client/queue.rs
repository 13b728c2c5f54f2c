//! Durable offline queue for undelivered events
//!
//! This module provides the on-device queue used while ingestion is unreachable:
//! - Write-through persistence before every in-memory commit
//! - Capped exponential backoff with jitter per entry
//! - 7-day retention ceiling and a hard entry cap, both counted as drops

use super::store::DurableQueueStore;
use crate::error::{PipelineError, Result};
use crate::models::{QueueEntry, TelemetryEvent};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default retention ceiling (7 days)
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default maximum number of queued events
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Retry backoff for queued events
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Fraction of the delay applied as random jitter in both directions
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(10 * 60),
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay without jitter after `attempt` failed attempts
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    /// Jittered delay, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let factor = if ratio > 0.0 {
            rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio))
        } else {
            1.0
        };
        let jittered = Duration::from_millis((base * factor).round() as u64);
        jittered.min(self.max)
    }
}

/// Configuration for the offline queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Entries older than this are dropped instead of retried
    pub retention: Duration,
    /// Oldest entries are evicted beyond this size
    pub max_entries: usize,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            max_entries: DEFAULT_MAX_ENTRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub entries: usize,
    pub eligible: usize,
    pub awaiting_verification: usize,
    /// `firstQueuedAt` of the oldest entry
    pub oldest_queued_at: Option<i64>,
    /// Entries dropped by retention or the size cap since open
    pub dropped: u64,
}

/// Persistent queue of undelivered events
pub struct OfflineQueue {
    entries: Vec<QueueEntry>,
    config: QueueConfig,
    store: Box<dyn DurableQueueStore>,
    dropped: u64,
}

impl OfflineQueue {
    /// Open the queue, restoring whatever the store holds
    pub fn open(config: QueueConfig, store: Box<dyn DurableQueueStore>) -> Result<Self> {
        let loaded = store
            .load()
            .map_err(|e| PipelineError::Persistence(format!("{:#}", e)))?;

        let mut seen = HashSet::new();
        let mut entries: Vec<QueueEntry> = loaded
            .into_iter()
            .filter(|entry| seen.insert(entry.event.event_id.clone()))
            .collect();
        entries.sort_by_key(|e| e.first_queued_at);

        if !entries.is_empty() {
            info!(entries = entries.len(), "Restored offline queue");
        }

        Ok(Self {
            entries,
            config,
            store,
            dropped: 0,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.iter().any(|e| e.event.event_id == event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.event.event_id == event_id)
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Total entries dropped by retention or the size cap
    pub fn dropped_total(&self) -> u64 {
        self.dropped
    }

    /// Queue an event whose delivery just failed once
    pub fn enqueue(&mut self, event: TelemetryEvent, now: i64) -> Result<bool> {
        Ok(self.enqueue_all(vec![event], now)? == 1)
    }

    /// Queue events individually after a failed delivery. Events already
    /// queued are left untouched. Returns how many were added.
    pub fn enqueue_all(&mut self, events: Vec<TelemetryEvent>, now: i64) -> Result<usize> {
        let next_eligible_at = now + self.config.backoff.delay(1).as_millis() as i64;
        self.insert_new(events, now, |_| QueueEntry::failed_once(next_eligible_at))
    }

    /// Queue events that went out through the beacon and wait for
    /// confirmation before they are retried
    pub fn park_new(
        &mut self,
        events: Vec<TelemetryEvent>,
        now: i64,
        verification_window: Duration,
    ) -> Result<usize> {
        let next_eligible_at = now + verification_window.as_millis() as i64;
        self.insert_new(events, now, |_| QueueEntry::parked(next_eligible_at))
    }

    fn insert_new<F>(&mut self, events: Vec<TelemetryEvent>, now: i64, make: F) -> Result<usize>
    where
        F: Fn(&TelemetryEvent) -> PendingEntry,
    {
        let mut next = self.entries.clone();
        let mut ids: HashSet<String> = next.iter().map(|e| e.event.event_id.clone()).collect();
        let mut added = 0;

        for event in events {
            if !ids.insert(event.event_id.clone()) {
                debug!(event_id = %event.event_id, "Event already queued");
                continue;
            }
            let pending = make(&event);
            next.push(QueueEntry {
                event,
                attempt_count: pending.attempt_count,
                next_eligible_at: pending.next_eligible_at,
                first_queued_at: now,
                awaiting_verification: pending.awaiting_verification,
            });
            added += 1;
        }

        if added == 0 {
            return Ok(0);
        }

        let evicted = evict_over_capacity(&mut next, self.config.max_entries);
        self.commit(next)?;

        if evicted > 0 {
            self.dropped += evicted as u64;
            warn!(
                evicted,
                max_entries = self.config.max_entries,
                "Offline queue full, dropped oldest events"
            );
        }
        Ok(added)
    }

    /// Eligible entries (`nextEligibleAt <= now`), oldest first. Entries
    /// stay queued until [`remove`](Self::remove) or
    /// [`mark_failed`](Self::mark_failed).
    pub fn dequeue_batch(&self, limit: usize, now: i64) -> Vec<QueueEntry> {
        let mut eligible: Vec<&QueueEntry> =
            self.entries.iter().filter(|e| e.is_eligible(now)).collect();
        eligible.sort_by_key(|e| e.first_queued_at);
        eligible.into_iter().take(limit).cloned().collect()
    }

    /// Ids of beacon-sent entries whose verification window elapsed
    pub fn due_for_verification(&self, now: i64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.awaiting_verification && e.is_eligible(now))
            .map(|e| e.event.event_id.clone())
            .collect()
    }

    /// Delete delivered entries
    pub fn remove(&mut self, event_ids: &[String]) -> Result<usize> {
        let ids: HashSet<&str> = event_ids.iter().map(String::as_str).collect();
        let next: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|e| !ids.contains(e.event.event_id.as_str()))
            .cloned()
            .collect();
        let removed = self.entries.len() - next.len();
        if removed > 0 {
            self.commit(next)?;
        }
        Ok(removed)
    }

    /// Record another failed attempt and push the entries back
    pub fn mark_failed(&mut self, event_ids: &[String], now: i64) -> Result<()> {
        let ids: HashSet<&str> = event_ids.iter().map(String::as_str).collect();
        let backoff = &self.config.backoff;
        let mut next = self.entries.clone();
        let mut touched = false;

        for entry in next
            .iter_mut()
            .filter(|e| ids.contains(e.event.event_id.as_str()))
        {
            entry.attempt_count = entry.attempt_count.saturating_add(1);
            entry.next_eligible_at = now + backoff.delay(entry.attempt_count).as_millis() as i64;
            entry.awaiting_verification = false;
            touched = true;
        }

        if touched {
            self.commit(next)?;
        }
        Ok(())
    }

    /// Hold existing entries until their beacon send can be verified
    pub fn park_for_verification(
        &mut self,
        event_ids: &[String],
        now: i64,
        verification_window: Duration,
    ) -> Result<()> {
        let ids: HashSet<&str> = event_ids.iter().map(String::as_str).collect();
        let mut next = self.entries.clone();
        let mut touched = false;

        for entry in next
            .iter_mut()
            .filter(|e| ids.contains(e.event.event_id.as_str()))
        {
            entry.next_eligible_at = now + verification_window.as_millis() as i64;
            entry.awaiting_verification = true;
            touched = true;
        }

        if touched {
            self.commit(next)?;
        }
        Ok(())
    }

    /// Turn unconfirmed beacon entries back into ordinary retries
    pub fn release_unverified(&mut self, event_ids: &[String]) -> Result<()> {
        let ids: HashSet<&str> = event_ids.iter().map(String::as_str).collect();
        let mut next = self.entries.clone();
        let mut touched = false;

        for entry in next
            .iter_mut()
            .filter(|e| e.awaiting_verification && ids.contains(e.event.event_id.as_str()))
        {
            entry.awaiting_verification = false;
            touched = true;
        }

        if touched {
            self.commit(next)?;
        }
        Ok(())
    }

    /// Drop entries past the retention ceiling. Returns the number dropped.
    pub fn purge_expired(&mut self, now: i64) -> Result<usize> {
        let retention_ms = self.config.retention.as_millis() as i64;
        let (expired, kept): (Vec<QueueEntry>, Vec<QueueEntry>) = self
            .entries
            .iter()
            .cloned()
            .partition(|e| e.age_ms(now) > retention_ms);

        if expired.is_empty() {
            return Ok(0);
        }

        self.commit(kept)?;
        self.dropped += expired.len() as u64;

        for entry in &expired {
            let err = PipelineError::RetentionExpired {
                event_id: entry.event.event_id.clone(),
                age_secs: entry.age_ms(now) / 1000,
            };
            debug!(error = %err, attempts = entry.attempt_count, "Dropping expired event");
        }
        warn!(
            dropped = expired.len(),
            retention_secs = self.config.retention.as_secs(),
            "Purged expired events from offline queue"
        );
        Ok(expired.len())
    }

    pub fn stats(&self, now: i64) -> QueueStats {
        QueueStats {
            entries: self.entries.len(),
            eligible: self.entries.iter().filter(|e| e.is_eligible(now)).count(),
            awaiting_verification: self
                .entries
                .iter()
                .filter(|e| e.awaiting_verification)
                .count(),
            oldest_queued_at: self.entries.iter().map(|e| e.first_queued_at).min(),
            dropped: self.dropped,
        }
    }

    /// Write-ahead commit: persist first, then replace the in-memory state
    fn commit(&mut self, next: Vec<QueueEntry>) -> Result<()> {
        self.store
            .persist(&next)
            .map_err(|e| PipelineError::Persistence(format!("{:#}", e)))?;
        self.entries = next;
        Ok(())
    }
}

/// Retry bookkeeping for an entry about to be inserted
struct PendingEntry {
    attempt_count: u32,
    next_eligible_at: i64,
    awaiting_verification: bool,
}

impl QueueEntry {
    fn failed_once(next_eligible_at: i64) -> PendingEntry {
        PendingEntry {
            attempt_count: 1,
            next_eligible_at,
            awaiting_verification: false,
        }
    }

    fn parked(next_eligible_at: i64) -> PendingEntry {
        PendingEntry {
            attempt_count: 0,
            next_eligible_at,
            awaiting_verification: true,
        }
    }
}

fn evict_over_capacity(entries: &mut Vec<QueueEntry>, max_entries: usize) -> usize {
    if entries.len() <= max_entries {
        return 0;
    }
    entries.sort_by_key(|e| e.first_queued_at);
    let excess = entries.len() - max_entries;
    entries.drain(..excess);
    excess
}
