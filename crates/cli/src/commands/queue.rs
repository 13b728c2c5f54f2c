//! Offline queue inspection
//!
//! Reads a client's durable queue file directly; the file is never written.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;
use telemetry_lib::client::{DurableQueueStore, FileQueueStore, QueueConfig};
use telemetry_lib::QueueEntry;

use crate::output::{
    color_status, format_age_ms, format_timestamp_ms, print_json, print_table, OutputFormat,
};

/// Row for the queue entries table
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Event ID")]
    event_id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Session")]
    session: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "Next attempt")]
    next_attempt: String,
    #[tabled(rename = "State")]
    state: String,
}

/// Summary of a queue file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub entries: usize,
    pub eligible: usize,
    pub awaiting_verification: usize,
    /// Past the retention ceiling; dropped on the next flush
    pub expired: usize,
    pub oldest_queued_at: Option<i64>,
}

impl QueueSummary {
    pub fn from_entries(entries: &[QueueEntry], now: i64, retention: Duration) -> Self {
        let retention_ms = retention.as_millis() as i64;
        Self {
            entries: entries.len(),
            eligible: entries
                .iter()
                .filter(|e| !e.awaiting_verification && e.is_eligible(now))
                .count(),
            awaiting_verification: entries.iter().filter(|e| e.awaiting_verification).count(),
            expired: entries.iter().filter(|e| e.age_ms(now) > retention_ms).count(),
            oldest_queued_at: entries.iter().map(|e| e.first_queued_at).min(),
        }
    }
}

fn entry_state(entry: &QueueEntry, now: i64, retention_ms: i64) -> &'static str {
    if entry.age_ms(now) > retention_ms {
        "expired"
    } else if entry.awaiting_verification {
        "verifying"
    } else if entry.is_eligible(now) {
        "ready"
    } else {
        "waiting"
    }
}

/// Show what a queue file holds
pub fn inspect(path: &Path, limit: usize, format: OutputFormat) -> Result<()> {
    let store = FileQueueStore::new(path);
    let mut entries = store.load()?;
    entries.sort_by_key(|e| e.first_queued_at);

    let now = chrono::Utc::now().timestamp_millis();
    let retention = QueueConfig::default().retention;
    let summary = QueueSummary::from_entries(&entries, now, retention);

    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({
            "summary": summary,
            "entries": entries.iter().take(limit).collect::<Vec<_>>(),
        }));
    }

    println!("Queue: {}", path.display());
    println!(
        "Entries: {}   ready {}   verifying {}   expired {}",
        summary.entries, summary.eligible, summary.awaiting_verification, summary.expired
    );
    if let Some(oldest) = summary.oldest_queued_at {
        println!("Oldest: {}\n", format_timestamp_ms(oldest));
    }

    let retention_ms = retention.as_millis() as i64;
    let rows: Vec<EntryRow> = entries
        .iter()
        .take(limit)
        .map(|e| EntryRow {
            event_id: e.event_id().to_string(),
            name: e.event.name.clone(),
            session: e.event.session_id.clone(),
            attempts: e.attempt_count,
            age: format_age_ms(e.age_ms(now)),
            next_attempt: format_timestamp_ms(e.next_eligible_at),
            state: color_status(entry_state(e, now, retention_ms)),
        })
        .collect();
    print_table(rows, "Queue is empty");

    if entries.len() > limit {
        println!("\n... {} more", entries.len() - limit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_lib::TelemetryEvent;

    fn entry(id: &str, queued_at: i64, next: i64, verifying: bool) -> QueueEntry {
        QueueEntry {
            event: TelemetryEvent {
                event_id: id.to_string(),
                name: "page_view".to_string(),
                category: String::new(),
                session_id: "s1".to_string(),
                page: String::new(),
                timestamp: queued_at,
                payload: Default::default(),
            },
            attempt_count: 1,
            next_eligible_at: next,
            first_queued_at: queued_at,
            awaiting_verification: verifying,
        }
    }

    #[test]
    fn test_summary_counts() {
        let day = 86_400_000;
        let now = 10 * day;
        let entries = vec![
            entry("old", now - 8 * day, now - day, false),
            entry("ready", now - 1000, now - 1, false),
            entry("waiting", now - 1000, now + 5000, false),
            entry("beacon", now - 1000, now + 5000, true),
        ];

        let summary = QueueSummary::from_entries(&entries, now, Duration::from_secs(7 * 86_400));

        assert_eq!(summary.entries, 4);
        assert_eq!(summary.eligible, 2);
        assert_eq!(summary.awaiting_verification, 1);
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.oldest_queued_at, Some(now - 8 * day));
        assert_eq!(entry_state(&entries[0], now, 7 * day), "expired");
        assert_eq!(entry_state(&entries[3], now, 7 * day), "verifying");
    }
}
