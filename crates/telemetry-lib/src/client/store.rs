//! Durable storage behind the offline queue
//!
//! The queue hands the store a full snapshot on every mutation and only
//! commits in memory once the store returned. Stores:
//! - [`FileQueueStore`]: JSON snapshot written atomically (temp file, fsync, rename)
//! - [`MemoryQueueStore`]: process memory, with a failure switch for tests

use crate::models::QueueEntry;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Persistent backing for the offline queue
pub trait DurableQueueStore: Send + Sync {
    /// Load every persisted entry
    fn load(&self) -> Result<Vec<QueueEntry>>;

    /// Durably replace the persisted contents; must not return before the
    /// data would survive a crash
    fn persist(&self, entries: &[QueueEntry]) -> Result<()>;
}

impl<T: DurableQueueStore + ?Sized> DurableQueueStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Vec<QueueEntry>> {
        (**self).load()
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        (**self).persist(entries)
    }
}

/// Queue snapshot stored as a JSON file
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableQueueStore for FileQueueStore {
    fn load(&self) -> Result<Vec<QueueEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open queue file {:?}", self.path))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .context("Failed to read queue file")?;
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let entries: Vec<QueueEntry> =
            serde_json::from_slice(&data).context("Failed to deserialize queue data")?;

        info!(path = %self.path.display(), entries = entries.len(), "Loaded offline queue from disk");
        Ok(entries)
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let json = serde_json::to_vec(entries).context("Failed to serialize queue")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;

        file.write_all(&json).context("Failed to write queue data")?;
        file.sync_all().context("Failed to sync queue file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;

        debug!(path = %self.path.display(), entries = entries.len(), "Offline queue persisted");
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryQueueStore {
    entries: Mutex<Vec<QueueEntry>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate, as if entries survived a reload
    pub fn with_entries(entries: Vec<QueueEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Default::default()
        }
    }

    /// Make subsequent writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl DurableQueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.snapshot())
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("simulated storage failure");
        }
        let mut stored = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("queue store lock poisoned"))?;
        *stored = entries.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Payload, TelemetryEvent};
    use tempfile::TempDir;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry {
            event: TelemetryEvent {
                event_id: id.to_string(),
                name: "page_view".to_string(),
                category: "navigation".to_string(),
                session_id: "s1".to_string(),
                page: "/".to_string(),
                timestamp: 1_000,
                payload: Payload::new(),
            },
            attempt_count: 1,
            next_eligible_at: 2_000,
            first_queued_at: 1_000,
            awaiting_verification: false,
        }
    }

    #[test]
    fn test_file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileQueueStore::new(temp_dir.path().join("queue").join("offline.json"));

        assert!(store.load().unwrap().is_empty());

        store.persist(&[entry("a"), entry("b")]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].event.event_id, "b");
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offline.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(FileQueueStore::new(path).load().is_err());
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let store = MemoryQueueStore::new();
        store.persist(&[entry("a")]).unwrap();
        store.set_fail_writes(true);

        assert!(store.persist(&[]).is_err());
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.writes(), 1);
    }
}
