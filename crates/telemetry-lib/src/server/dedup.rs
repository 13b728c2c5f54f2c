//! Recently stored event ids
//!
//! The gate remembers ids for a TTL that outlasts the client's beacon
//! verification window, so a resent event is recognised as a duplicate and
//! a verification query can be answered.
//!
//! Ids are claimed before the store call and only become "seen" once the
//! store succeeded. A claim that is dropped without being confirmed is
//! released, so a failed or cancelled request never blocks a later one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Default id retention (15 minutes)
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on remembered ids
const DEFAULT_MAX_IDS: usize = 200_000;

/// How one id fared in [`RecentIdCache::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Claimed by this caller
    Reserved,
    /// Already stored within the TTL
    Seen,
    /// Claimed by another request whose store has not finished
    InFlight,
}

#[derive(Debug, Default)]
struct CacheState {
    seen: HashMap<String, i64>,
    /// Insertion order, used for expiry and eviction
    order: VecDeque<(String, i64)>,
    in_flight: HashSet<String>,
}

impl CacheState {
    fn expire(&mut self, now: i64, ttl_ms: i64) {
        while let Some((id, stored_at)) = self.order.front() {
            if now - *stored_at < ttl_ms {
                break;
            }
            // Only drop the map entry if it was not refreshed since
            if self.seen.get(id) == Some(stored_at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }

    fn evict_over(&mut self, max_ids: usize) {
        while self.seen.len() > max_ids {
            let Some((id, stored_at)) = self.order.pop_front() else {
                break;
            };
            if self.seen.get(&id) == Some(&stored_at) {
                self.seen.remove(&id);
            }
        }
    }
}

/// Ids claimed by one request. Dropping it without [`Reservation::confirm`]
/// releases the ids.
#[must_use]
pub struct Reservation<'a> {
    cache: &'a RecentIdCache,
    ids: Vec<String>,
}

impl Reservation<'_> {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The ids were stored; remember them from `now`
    pub fn confirm(mut self, now: i64) {
        let ids = std::mem::take(&mut self.ids);
        self.cache.settle(&ids, Some(now));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.cache.settle(&self.ids, None);
        }
    }
}

/// TTL cache of event ids the gate has stored
pub struct RecentIdCache {
    ttl: Duration,
    max_ids: usize,
    state: Mutex<CacheState>,
    settled: Notify,
}

impl RecentIdCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_IDS)
    }

    pub fn with_capacity(ttl: Duration, max_ids: usize) -> Self {
        Self {
            ttl,
            max_ids: max_ids.max(1),
            state: Mutex::new(CacheState::default()),
            settled: Notify::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Claim every id that is neither seen nor in flight, atomically.
    ///
    /// The returned claims line up with `event_ids`.
    pub fn reserve(&self, event_ids: &[&str], now: i64) -> (Reservation<'_>, Vec<Claim>) {
        let mut state = self.lock();
        state.expire(now, self.ttl.as_millis() as i64);

        let mut reserved = Vec::new();
        let claims = event_ids
            .iter()
            .map(|id| {
                if state.seen.contains_key(*id) {
                    Claim::Seen
                } else if state.in_flight.contains(*id) {
                    Claim::InFlight
                } else {
                    state.in_flight.insert(id.to_string());
                    reserved.push(id.to_string());
                    Claim::Reserved
                }
            })
            .collect();

        (
            Reservation {
                cache: self,
                ids: reserved,
            },
            claims,
        )
    }

    /// Resolves once some reservation is confirmed or released. Create it
    /// before calling [`reserve`](Self::reserve) and `enable` it, or a
    /// release in between is missed.
    pub fn settled(&self) -> Notified<'_> {
        self.settled.notified()
    }

    /// Confirm (`stored_at` set) or release the ids, then wake waiters
    fn settle(&self, ids: &[String], stored_at: Option<i64>) {
        {
            let mut state = self.lock();
            for id in ids {
                state.in_flight.remove(id);
            }
            if let Some(now) = stored_at {
                state.expire(now, self.ttl.as_millis() as i64);
                for id in ids {
                    state.seen.insert(id.clone(), now);
                    state.order.push_back((id.clone(), now));
                }
                state.evict_over(self.max_ids);
            }
        }
        self.settled.notify_waiters();
    }

    /// The subset of `event_ids` that is stored and still remembered
    pub fn confirmed(&self, event_ids: &[String], now: i64) -> Vec<String> {
        let mut state = self.lock();
        state.expire(now, self.ttl.as_millis() as i64);
        event_ids
            .iter()
            .filter(|id| state.seen.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self, now: i64) -> usize {
        let mut state = self.lock();
        state.expire(now, self.ttl.as_millis() as i64);
        state.seen.len()
    }

    /// Ids claimed by requests whose store has not finished
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

impl Default for RecentIdCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}
