//! Endpoint performance analysis and limit recommendations
//!
//! Samples are kept per route in a bounded ring buffer. Statistics,
//! classification and recommendations are pure functions over the samples
//! inside the lookback window. Recommendations are advisory; nothing here
//! touches the live limiter.

use crate::error::{PipelineError, Result};
use crate::models::{Environment, LimiterConfig, PerformanceSample, SampleOutcome};
use crate::server::limiter::LimiterTable;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Classification thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning_error_rate: f64,
    pub critical_error_rate: f64,
    pub warning_p95_ms: f64,
    pub critical_p95_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_error_rate: 0.05,
            critical_error_rate: 0.15,
            warning_p95_ms: 500.0,
            critical_p95_ms: 1500.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Samples kept per route
    pub capacity: usize,
    /// Only samples this recent feed statistics
    pub lookback: Duration,
    /// Routes with fewer samples keep their limit
    pub min_samples: usize,
    pub min_limit: u32,
    pub max_limit: u32,
    /// Multiplier applied to a CRITICAL route's limit
    pub decrease_factor: f64,
    /// Multiplier applied when a healthy route is rejecting requests
    pub increase_factor: f64,
    pub thresholds: Thresholds,
    pub environment: Environment,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            lookback: Duration::from_secs(5 * 60),
            min_samples: 20,
            min_limit: 10,
            max_limit: 10_000,
            decrease_factor: 0.7,
            increase_factor: 1.25,
            thresholds: Thresholds::default(),
            environment: Environment::Production,
        }
    }
}

/// Health class of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Excellent,
    Warning,
    Critical,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Excellent => "EXCELLENT",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Rolling statistics for one route
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    /// All samples in the lookback window, rejections included
    pub count: usize,
    pub error_count: usize,
    pub rejected_count: usize,
    /// Errors over served (non-rejected) requests
    pub error_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl EndpointStats {
    pub fn served(&self) -> usize {
        self.count - self.rejected_count
    }
}

/// Statistics over a set of samples
pub fn compute_stats(samples: &[PerformanceSample]) -> EndpointStats {
    let mut durations = Vec::with_capacity(samples.len());
    let mut stats = EndpointStats {
        count: samples.len(),
        ..Default::default()
    };

    for sample in samples {
        match sample.outcome {
            SampleOutcome::Rejected => stats.rejected_count += 1,
            SampleOutcome::Error => {
                stats.error_count += 1;
                durations.push(sample.duration_ms);
            }
            SampleOutcome::Success => durations.push(sample.duration_ms),
        }
    }

    let served = stats.served();
    if served > 0 {
        stats.error_rate = stats.error_count as f64 / served as f64;
    }

    durations.sort_by(|a, b| a.total_cmp(b));
    stats.p50_ms = percentile(&durations, 50.0);
    stats.p95_ms = percentile(&durations, 95.0);
    stats
}

/// Nearest-rank percentile of sorted values
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn classify(stats: &EndpointStats, thresholds: &Thresholds) -> Classification {
    if stats.error_rate >= thresholds.critical_error_rate || stats.p95_ms >= thresholds.critical_p95_ms
    {
        Classification::Critical
    } else if stats.error_rate >= thresholds.warning_error_rate
        || stats.p95_ms >= thresholds.warning_p95_ms
    {
        Classification::Warning
    } else {
        Classification::Excellent
    }
}

/// Suggested limit for one route
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub route: String,
    pub classification: Classification,
    pub current: LimiterConfig,
    pub recommended: LimiterConfig,
    pub reason: String,
    pub stats: EndpointStats,
}

impl Recommendation {
    pub fn changes_limit(&self) -> bool {
        self.current != self.recommended
    }
}

/// Route status as shown in reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    pub route: String,
    pub classification: Classification,
    pub stats: EndpointStats,
}

/// Fixed-capacity sample history for one route
#[derive(Debug)]
struct SampleRing {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn recent(&self, since: i64) -> Vec<PerformanceSample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp > since)
            .cloned()
            .collect()
    }
}

/// Collects samples and turns them into advisory limits
pub struct PerformanceAnalyzer {
    config: AnalyzerConfig,
    routes: DashMap<String, Arc<Mutex<SampleRing>>>,
}

impl PerformanceAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            routes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn record(&self, sample: PerformanceSample) {
        let capacity = self.config.capacity;
        let ring = self
            .routes
            .entry(sample.route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SampleRing::new(capacity))))
            .value()
            .clone();
        let mut ring = match ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ring.push(sample);
    }

    /// Samples for a route inside the lookback window
    pub fn samples(&self, route: &str, now: i64) -> Vec<PerformanceSample> {
        let since = now - self.config.lookback.as_millis() as i64;
        let Some(ring) = self.routes.get(route).map(|r| Arc::clone(r.value())) else {
            return Vec::new();
        };
        let recent = match ring.lock() {
            Ok(guard) => guard.recent(since),
            Err(poisoned) => poisoned.into_inner().recent(since),
        };
        recent
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        routes.sort();
        routes
    }

    pub fn stats(&self, route: &str, now: i64) -> EndpointStats {
        compute_stats(&self.samples(route, now))
    }

    /// Classification of every route seen
    pub fn report(&self, now: i64) -> Vec<RouteStatus> {
        self.routes()
            .into_iter()
            .map(|route| {
                let stats = self.stats(&route, now);
                RouteStatus {
                    classification: classify(&stats, &self.config.thresholds),
                    route,
                    stats,
                }
            })
            .collect()
    }

    /// One recommendation per route that has samples or a configured limit
    pub fn analyze_and_recommend(&self, current: &LimiterTable, now: i64) -> Vec<Recommendation> {
        let routes: BTreeSet<String> = self
            .routes()
            .into_iter()
            .chain(current.routes.keys().cloned())
            .collect();

        routes
            .into_iter()
            .map(|route| {
                let stats = self.stats(&route, now);
                let recommendation = self.recommend(&route, current.config_for(&route), stats);
                if recommendation.changes_limit() {
                    debug!(
                        route = %recommendation.route,
                        classification = %recommendation.classification,
                        current = recommendation.current.max_requests,
                        recommended = recommendation.recommended.max_requests,
                        "Limit change recommended"
                    );
                }
                recommendation
            })
            .collect()
    }

    fn recommend(&self, route: &str, current: LimiterConfig, stats: EndpointStats) -> Recommendation {
        let classification = classify(&stats, &self.config.thresholds);
        let cfg = &self.config;

        let (max_requests, reason) = if stats.count < cfg.min_samples {
            (
                current.max_requests,
                format!("insufficient samples ({} < {})", stats.count, cfg.min_samples),
            )
        } else {
            match classification {
                Classification::Critical => {
                    let reduced = (current.max_requests as f64 * cfg.decrease_factor).floor() as u32;
                    (
                        reduced.max(cfg.min_limit),
                        format!(
                            "error rate {:.1}% / p95 {:.0}ms, shedding load",
                            stats.error_rate * 100.0,
                            stats.p95_ms
                        ),
                    )
                }
                Classification::Excellent if stats.rejected_count > 0 => {
                    let raised = (current.max_requests as f64 * cfg.increase_factor).ceil() as u32;
                    (
                        raised.min(cfg.max_limit),
                        format!(
                            "healthy with {} rejected requests, raising limit",
                            stats.rejected_count
                        ),
                    )
                }
                Classification::Excellent => {
                    (current.max_requests, "healthy with headroom".to_string())
                }
                Classification::Warning => (
                    current.max_requests,
                    "elevated latency or errors, holding".to_string(),
                ),
            }
        };

        Recommendation {
            route: route.to_string(),
            classification,
            current,
            recommended: LimiterConfig {
                max_requests,
                window_seconds: current.window_seconds,
            },
            reason,
            stats,
        }
    }

    /// Discard every sample. Refused in production.
    pub fn cleanup(&self) -> Result<usize> {
        if self.config.environment.is_production() {
            return Err(PipelineError::CleanupForbidden);
        }
        let routes = self.routes.len();
        self.routes.clear();
        info!(routes, "Analyzer samples cleared");
        Ok(routes)
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}
