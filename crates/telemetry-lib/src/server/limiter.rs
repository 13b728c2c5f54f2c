//! Sliding-window rate limiter
//!
//! One window per endpoint key holds the timestamps of admitted requests.
//! A request is admitted when fewer than `maxRequests` of them fall inside
//! `(now - window, now]`. The trim, count and record steps run while the
//! key's map entry is held, so concurrent requests for one key never
//! over-admit and pruning never detaches a window a check is writing to.
//!
//! Limits are read from an immutable [`LimiterTable`] snapshot; applying new
//! limits swaps the snapshot and only affects later checks.

use crate::models::LimiterConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Entries reported in each top-N list
const TOP_N: usize = 10;

/// Admitted-request timestamps for one endpoint key
#[derive(Debug, Default)]
pub struct EndpointWindow {
    timestamps: VecDeque<i64>,
    rejected: u64,
}

impl EndpointWindow {
    /// Drop timestamps at or before `now - window_ms`
    fn trim(&mut self, now: i64, window_ms: i64) {
        let cutoff = now - window_ms;
        while matches!(self.timestamps.front(), Some(&ts) if ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn oldest(&self) -> Option<i64> {
        self.timestamps.front().copied()
    }
}

/// Immutable per-route limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterTable {
    pub default: LimiterConfig,
    pub routes: BTreeMap<String, LimiterConfig>,
}

impl LimiterTable {
    pub fn new(default: LimiterConfig) -> Self {
        Self {
            default,
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, route: impl Into<String>, config: LimiterConfig) -> Self {
        self.routes.insert(route.into(), config);
        self
    }

    pub fn config_for(&self, route: &str) -> LimiterConfig {
        self.routes.get(route).copied().unwrap_or(self.default)
    }
}

impl Default for LimiterTable {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

/// Result of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub admitted: bool,
    pub limit: u32,
    /// Requests still admissible in the current window
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window
    pub reset_after_secs: u64,
    /// Only meaningful for rejections; at least 1
    pub retry_after_secs: u64,
}

/// Counters with the most rejected keys and busiest endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub enabled: bool,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub tracked_keys: usize,
    pub top_blocked_keys: Vec<(String, u64)>,
    pub top_endpoints: Vec<(String, u64)>,
}

/// Per-endpoint-key sliding window limiter
///
/// Per-key rejection counts live in the key's window and are forgotten with
/// it when the key goes idle.
pub struct RateLimiter {
    windows: DashMap<String, EndpointWindow>,
    table: RwLock<Arc<LimiterTable>>,
    enabled: AtomicBool,
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    requests_by_route: DashMap<String, u64>,
}

impl RateLimiter {
    pub fn new(table: LimiterTable) -> Self {
        Self {
            windows: DashMap::new(),
            table: RwLock::new(Arc::new(table)),
            enabled: AtomicBool::new(true),
            total: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            requests_by_route: DashMap::new(),
        }
    }

    /// Current limits snapshot
    pub fn configs(&self) -> Arc<LimiterTable> {
        match self.table.read() {
            Ok(table) => Arc::clone(&table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the limits of the given routes. Checks already past their
    /// snapshot read keep the old limits.
    pub fn apply(&self, updates: &BTreeMap<String, LimiterConfig>) -> Arc<LimiterTable> {
        let mut guard = match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = LimiterTable::clone(&guard);
        for (route, config) in updates {
            let previous = next.config_for(route);
            next.routes.insert(route.clone(), *config);
            info!(
                route = %route,
                old_max_requests = previous.max_requests,
                new_max_requests = config.max_requests,
                window_seconds = config.window_seconds,
                "Rate limit updated"
            );
        }
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        next
    }

    /// Admit everything while disabled
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            warn!(enabled, "Rate limiting toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Check and, when admitted, record one request for `key` on `route`
    pub fn check(&self, route: &str, key: &str, now: i64) -> AdmissionDecision {
        let config = self.configs().config_for(route);
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.requests_by_route.entry(route.to_string()).or_insert(0) += 1;

        if !self.is_enabled() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return AdmissionDecision {
                admitted: true,
                limit: config.max_requests,
                remaining: config.max_requests,
                reset_after_secs: config.window_seconds,
                retry_after_secs: 0,
            };
        }

        // Held until the decision is made
        let mut window = self.windows.entry(key.to_string()).or_default();

        let window_ms = config.window_ms();
        window.trim(now, window_ms);

        let count = window.len() as u64;
        if count < config.max_requests as u64 {
            window.timestamps.push_back(now);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            let oldest = window.oldest().unwrap_or(now);
            return AdmissionDecision {
                admitted: true,
                limit: config.max_requests,
                remaining: config.max_requests.saturating_sub(window.len() as u32),
                reset_after_secs: ceil_secs(oldest + window_ms - now),
                retry_after_secs: 0,
            };
        }

        window.rejected += 1;
        self.blocked.fetch_add(1, Ordering::Relaxed);

        let retry_after = window
            .oldest()
            .map(|oldest| ceil_secs(oldest + window_ms - now))
            .unwrap_or(1)
            .max(1);
        debug!(key = %key, route = %route, count, retry_after, "Request rejected");

        AdmissionDecision {
            admitted: false,
            limit: config.max_requests,
            remaining: 0,
            reset_after_secs: retry_after,
            retry_after_secs: retry_after,
        }
    }

    /// Rejections recorded against a key
    pub fn rejected_for(&self, key: &str) -> u64 {
        self.windows.get(key).map_or(0, |w| w.rejected())
    }

    /// Forget windows with no timestamps left inside their route's window
    pub fn prune_idle(&self, now: i64) -> usize {
        let longest = {
            let table = self.configs();
            table
                .routes
                .values()
                .chain(std::iter::once(&table.default))
                .map(LimiterConfig::window_ms)
                .max()
                .unwrap_or(0)
        };
        let mut pruned = 0;
        self.windows.retain(|_, window| {
            window.trim(now, longest);
            let idle = window.is_empty();
            pruned += usize::from(idle);
            !idle
        });
        pruned
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            enabled: self.is_enabled(),
            total_requests: self.total.load(Ordering::Relaxed),
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            blocked_requests: self.blocked.load(Ordering::Relaxed),
            tracked_keys: self.windows.len(),
            top_blocked_keys: top_n(
                self.windows
                    .iter()
                    .filter(|w| w.rejected() > 0)
                    .map(|w| (w.key().clone(), w.rejected())),
            ),
            top_endpoints: top_n(
                self.requests_by_route
                    .iter()
                    .map(|e| (e.key().clone(), *e.value())),
            ),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimiterTable::default())
    }
}

fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        return 0;
    }
    ((ms + 999) / 1000) as u64
}

fn top_n(counts: impl Iterator<Item = (String, u64)>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(TOP_N);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const ROUTE: &str = "/api/analytics/events";

    fn limiter(max_requests: u32, window_seconds: u64) -> RateLimiter {
        RateLimiter::new(
            LimiterTable::default().with_route(ROUTE, LimiterConfig::new(max_requests, window_seconds)),
        )
    }

    #[test]
    fn test_n_plus_one_rejects_once() {
        let limiter = limiter(5, 60);
        let decisions: Vec<bool> = (0..6)
            .map(|i| limiter.check(ROUTE, "k", 1_000 + i).admitted)
            .collect();

        assert_eq!(decisions, vec![true, true, true, true, true, false]);
        assert_eq!(limiter.rejected_for("k"), 1);
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = limiter(3, 10);
        for i in 0..3 {
            assert!(limiter.check(ROUTE, "k", i).admitted);
        }
        // Wait longer than the window
        for i in 0..3 {
            assert!(limiter.check(ROUTE, "k", 10_003 + i).admitted);
        }
        assert_eq!(limiter.stats().blocked_requests, 0);
    }

    #[test]
    fn test_retry_after_counts_to_oldest_expiry() {
        let limiter = limiter(2, 10);
        limiter.check(ROUTE, "k", 0);
        limiter.check(ROUTE, "k", 4_000);

        let decision = limiter.check(ROUTE, "k", 5_500);
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after_secs, 5);

        let decision = limiter.check(ROUTE, "k", 9_999);
        assert_eq!(decision.retry_after_secs, 1);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter(3, 60);
        assert_eq!(limiter.check(ROUTE, "k", 0).remaining, 2);
        assert_eq!(limiter.check(ROUTE, "k", 1).remaining, 1);
        assert_eq!(limiter.check(ROUTE, "k", 2).remaining, 0);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.check(ROUTE, "a", 0).admitted);
        assert!(limiter.check(ROUTE, "b", 0).admitted);
        assert!(!limiter.check(ROUTE, "a", 1).admitted);
    }

    #[test]
    fn test_unknown_route_uses_default() {
        let limiter = RateLimiter::new(LimiterTable::new(LimiterConfig::new(1, 60)));
        assert!(limiter.check("/other", "k", 0).admitted);
        assert!(!limiter.check("/other", "k", 1).admitted);
    }

    #[test]
    fn test_apply_affects_later_checks_only() {
        let limiter = limiter(1, 60);
        let snapshot = limiter.configs();
        assert!(limiter.check(ROUTE, "k", 0).admitted);

        let mut updates = BTreeMap::new();
        updates.insert(ROUTE.to_string(), LimiterConfig::new(3, 60));
        limiter.apply(&updates);

        assert_eq!(snapshot.config_for(ROUTE).max_requests, 1);
        assert!(limiter.check(ROUTE, "k", 1).admitted);
        assert_eq!(limiter.configs().config_for(ROUTE).max_requests, 3);
    }

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = limiter(1, 60);
        limiter.set_enabled(false);
        for i in 0..10 {
            assert!(limiter.check(ROUTE, "k", i).admitted);
        }
        limiter.set_enabled(true);
        assert!(limiter.check(ROUTE, "k", 20).admitted);
        assert!(!limiter.check(ROUTE, "k", 21).admitted);
    }

    #[test]
    fn test_concurrent_checks_never_over_admit() {
        let limiter = Arc::new(limiter(50, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..20)
                        .filter(|i| limiter.check(ROUTE, "shared", 1_000 + i).admitted)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_stats_top_lists() {
        let limiter = limiter(1, 60);
        for _ in 0..3 {
            limiter.check(ROUTE, "noisy", 0);
        }
        limiter.check(ROUTE, "quiet", 0);
        limiter.check(ROUTE, "quiet", 0);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.blocked_requests, 3);
        assert_eq!(stats.top_blocked_keys[0], ("noisy".to_string(), 2));
        assert_eq!(stats.top_endpoints[0], (ROUTE.to_string(), 5));
    }

    #[test]
    fn test_prune_idle_forgets_rejection_counts() {
        let limiter = limiter(1, 10);
        for key in ["a", "b", "c"] {
            limiter.check(ROUTE, key, 0);
            limiter.check(ROUTE, key, 1);
        }
        assert_eq!(limiter.stats().top_blocked_keys.len(), 3);

        assert_eq!(limiter.prune_idle(20_000), 3);
        let stats = limiter.stats();
        assert!(stats.top_blocked_keys.is_empty());
        assert_eq!(stats.blocked_requests, 3);
        assert_eq!(limiter.rejected_for("a"), 0);
    }

    #[test]
    fn test_checks_racing_prune_never_over_admit() {
        let limiter = Arc::new(limiter(50, 10));
        let pruner = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || {
                for _ in 0..500 {
                    limiter.prune_idle(1_000);
                }
            })
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..20)
                        .filter(|i| limiter.check(ROUTE, "shared", 1_000 + i).admitted)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        pruner.join().unwrap();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_prune_idle_windows() {
        let limiter = limiter(5, 10);
        limiter.check(ROUTE, "a", 0);
        limiter.check(ROUTE, "b", 50_000);

        assert_eq!(limiter.prune_idle(65_000), 1);
        assert_eq!(limiter.stats().tracked_keys, 1);
    }
}
