//! Tracker-blocker detection
//!
//! Probes whether outbound telemetry is likely to be intercepted. The answer
//! is computed once per session and cached. It only biases transport
//! timeouts; delivery is always attempted regardless.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Path fragments commonly matched by blocklists
pub const BAIT_PATHS: &[&str] = &["/ads/analytics-tracker.js", "/pagead/telemetry/pixel.gif"];

/// A single blocking probe
#[async_trait]
pub trait BlockerProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `true` when this probe sees signs of blocking
    async fn is_blocked(&self) -> bool;
}

/// Loads a resource whose name matches blocklist patterns
pub struct BaitResourceProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl BaitResourceProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout,
        }
    }

    /// Probe the first bait path on the given origin
    pub fn for_origin(origin: &str, timeout: Duration) -> Self {
        let url = format!("{}{}", origin.trim_end_matches('/'), BAIT_PATHS[0]);
        Self::new(url, timeout)
    }
}

#[async_trait]
impl BlockerProbe for BaitResourceProbe {
    fn name(&self) -> &str {
        "bait_resource"
    }

    async fn is_blocked(&self) -> bool {
        let request = self.client.get(&self.url).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => !response.status().is_success(),
            Ok(Err(e)) => {
                debug!(url = %self.url, error = %e, "Bait resource request failed");
                true
            }
            Err(_) => true,
        }
    }
}

/// Fixed answer, for targets without a blocker and for tests
pub struct StaticProbe(pub bool);

#[async_trait]
impl BlockerProbe for StaticProbe {
    fn name(&self) -> &str {
        "static"
    }

    async fn is_blocked(&self) -> bool {
        self.0
    }
}

/// Runs the configured probes once and caches the verdict
pub struct BlockerDetector {
    probes: Vec<Arc<dyn BlockerProbe>>,
    verdict: OnceCell<bool>,
}

impl BlockerDetector {
    pub fn new(probes: Vec<Arc<dyn BlockerProbe>>) -> Self {
        Self {
            probes,
            verdict: OnceCell::new(),
        }
    }

    /// Detector that never reports blocking
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Probe once per session; later calls return the cached result
    pub async fn detect(&self) -> bool {
        *self
            .verdict
            .get_or_init(|| async {
                for probe in &self.probes {
                    if probe.is_blocked().await {
                        info!(probe = probe.name(), "Telemetry blocking suspected");
                        return true;
                    }
                }
                false
            })
            .await
    }

    /// Cached verdict, if detection already ran
    pub fn cached(&self) -> Option<bool> {
        self.verdict.get().copied()
    }
}
