//! Administrative reporting and the explicit apply action

use super::analyzer::{PerformanceAnalyzer, Recommendation, RouteStatus};
use super::limiter::{LimiterStats, LimiterTable, RateLimiter};
use super::storage::{ConversionSummary, MemoryEventStore};
use crate::clock::SharedClock;
use crate::error::{PipelineError, Result};
use crate::models::{Environment, LimiterConfig};
use crate::observability::{PipelineMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Approves elevated administrative actions
pub trait AdminAuthorizer: Send + Sync {
    /// `token` is the bearer credential presented with the request
    fn authorize(&self, token: Option<&str>) -> Result<()>;
}

/// Accepts one static bearer token
pub struct StaticTokenAuthorizer {
    digest: [u8; 32],
}

impl StaticTokenAuthorizer {
    pub fn new(token: &str) -> Self {
        Self {
            digest: Sha256::digest(token.as_bytes()).into(),
        }
    }
}

impl AdminAuthorizer for StaticTokenAuthorizer {
    fn authorize(&self, token: Option<&str>) -> Result<()> {
        let token = token.ok_or_else(|| PipelineError::Unauthorized("missing token".into()))?;
        // Compare digests so the check does not depend on token length
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let diff = presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(PipelineError::Unauthorized("invalid token".into()))
        }
    }
}

/// Refuses everything, for deployments without an admin token
pub struct DenyAll;

impl AdminAuthorizer for DenyAll {
    fn authorize(&self, _token: Option<&str>) -> Result<()> {
        Err(PipelineError::Unauthorized(
            "administrative actions are disabled".into(),
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminReport {
    pub generated_at: i64,
    pub environment: Environment,
    pub routes: Vec<RouteStatus>,
    pub limits: LimiterTable,
    pub limiter: LimiterStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<ConversionSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Routes to apply; empty means every route with a change
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub dry_run: bool,
    pub applied: Vec<Recommendation>,
    /// Limits in force after the call
    pub limits: LimiterTable,
}

/// Read-only reporting plus the gated apply and cleanup actions
pub struct AdminService {
    limiter: Arc<RateLimiter>,
    analyzer: Arc<PerformanceAnalyzer>,
    authorizer: Arc<dyn AdminAuthorizer>,
    clock: SharedClock,
    events: Option<Arc<MemoryEventStore>>,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl AdminService {
    pub fn new(
        limiter: Arc<RateLimiter>,
        analyzer: Arc<PerformanceAnalyzer>,
        authorizer: Arc<dyn AdminAuthorizer>,
        clock: SharedClock,
    ) -> Self {
        Self {
            limiter,
            analyzer,
            authorizer,
            clock,
            events: None,
            metrics: PipelineMetrics::new(),
            logger: StructuredLogger::new("admin"),
        }
    }

    /// Include conversion figures from an in-memory store in reports
    pub fn with_conversion_source(mut self, events: Arc<MemoryEventStore>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn authorize(&self, token: Option<&str>) -> Result<()> {
        self.authorizer.authorize(token)
    }

    pub fn report(&self) -> AdminReport {
        let now = self.clock.now_ms();
        AdminReport {
            generated_at: now,
            environment: self.analyzer.config().environment,
            routes: self.analyzer.report(now),
            limits: LimiterTable::clone(&self.limiter.configs()),
            limiter: self.limiter.stats(),
            conversion: self.events.as_ref().map(|store| store.conversion_summary()),
        }
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.analyzer
            .analyze_and_recommend(&self.limiter.configs(), self.clock.now_ms())
    }

    /// Recompute recommendations and push the selected ones into the
    /// limiter. Nothing changes on a dry run.
    pub fn apply(&self, token: Option<&str>, request: &ApplyRequest) -> Result<ApplyResult> {
        self.authorize(token)?;

        let selected: Vec<Recommendation> = self
            .recommendations()
            .into_iter()
            .filter(Recommendation::changes_limit)
            .filter(|r| request.routes.is_empty() || request.routes.contains(&r.route))
            .collect();

        for recommendation in &selected {
            self.logger
                .log_recommendation_applied(recommendation, request.dry_run);
        }

        let limits = if request.dry_run || selected.is_empty() {
            LimiterTable::clone(&self.limiter.configs())
        } else {
            let updates: BTreeMap<String, LimiterConfig> = selected
                .iter()
                .map(|r| (r.route.clone(), r.recommended))
                .collect();
            self.metrics.inc_limits_applied(updates.len());
            LimiterTable::clone(&self.limiter.apply(&updates))
        };

        Ok(ApplyResult {
            dry_run: request.dry_run,
            applied: selected,
            limits,
        })
    }

    /// Clear analyzer samples; refused in production
    pub fn cleanup(&self, token: Option<&str>) -> Result<usize> {
        self.authorize(token)?;
        self.analyzer.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{PerformanceSample, SampleOutcome};
    use crate::server::analyzer::{AnalyzerConfig, Classification};

    const ROUTE: &str = "/api/analytics/events";
    const TOKEN: &str = "s3cret";

    fn service(environment: Environment) -> AdminService {
        let clock = ManualClock::new(100_000);
        let limiter = Arc::new(RateLimiter::new(
            LimiterTable::default().with_route(ROUTE, LimiterConfig::new(100, 60)),
        ));
        let analyzer = Arc::new(PerformanceAnalyzer::new(AnalyzerConfig {
            environment,
            ..Default::default()
        }));
        for i in 0..30 {
            analyzer.record(PerformanceSample {
                route: ROUTE.to_string(),
                duration_ms: 2_500.0,
                outcome: SampleOutcome::Success,
                timestamp: 90_000 + i,
            });
        }
        AdminService::new(
            limiter,
            analyzer,
            Arc::new(StaticTokenAuthorizer::new(TOKEN)),
            Arc::new(clock),
        )
    }

    #[test]
    fn test_token_authorizer() {
        let auth = StaticTokenAuthorizer::new(TOKEN);
        assert!(auth.authorize(Some(TOKEN)).is_ok());
        assert!(matches!(
            auth.authorize(Some("nope")),
            Err(PipelineError::Unauthorized(_))
        ));
        assert!(auth.authorize(None).is_err());
        assert!(DenyAll.authorize(Some(TOKEN)).is_err());
    }

    #[test]
    fn test_report_does_not_change_limits() {
        let service = service(Environment::Production);
        let report = service.report();

        assert_eq!(report.routes[0].classification, Classification::Critical);
        assert_eq!(report.limits.config_for(ROUTE).max_requests, 100);
        assert_eq!(service.recommendations()[0].recommended.max_requests, 70);
        // Recommending alone leaves the live limiter untouched
        assert_eq!(service.limiter.configs().config_for(ROUTE).max_requests, 100);
    }

    #[test]
    fn test_apply_requires_authorization() {
        let service = service(Environment::Production);
        assert!(service.apply(None, &ApplyRequest::default()).is_err());
        assert_eq!(service.limiter.configs().config_for(ROUTE).max_requests, 100);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let service = service(Environment::Production);
        let result = service
            .apply(
                Some(TOKEN),
                &ApplyRequest {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.limits.config_for(ROUTE).max_requests, 100);
    }

    #[test]
    fn test_apply_updates_limiter() {
        let service = service(Environment::Production);
        let result = service
            .apply(Some(TOKEN), &ApplyRequest::default())
            .unwrap();

        assert_eq!(result.limits.config_for(ROUTE).max_requests, 70);
        assert_eq!(service.limiter.configs().config_for(ROUTE).max_requests, 70);
    }

    #[test]
    fn test_apply_filters_routes() {
        let service = service(Environment::Production);
        let result = service
            .apply(
                Some(TOKEN),
                &ApplyRequest {
                    routes: vec!["/api/collect/b".to_string()],
                    dry_run: false,
                },
            )
            .unwrap();

        assert!(result.applied.is_empty());
        assert_eq!(service.limiter.configs().config_for(ROUTE).max_requests, 100);
    }

    #[test]
    fn test_cleanup_guard() {
        let production = service(Environment::Production);
        assert!(matches!(
            production.cleanup(Some(TOKEN)),
            Err(PipelineError::CleanupForbidden)
        ));

        let development = service(Environment::Development);
        assert_eq!(development.cleanup(Some(TOKEN)).unwrap(), 1);
    }
}
