//! Gate configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use telemetry_lib::server::{AnalyzerConfig, GateConfig, KeyStrategy, LimiterTable};
use telemetry_lib::{Environment, LimiterConfig};

/// Primary ingestion route
pub const PRIMARY_ROUTE: &str = "/api/analytics/events";
/// Alternate ingestion route, for clients whose primary route is filtered
pub const ALTERNATE_ROUTE: &str = "/api/collect/b";
pub const VERIFY_ROUTE: &str = "/api/analytics/verify";

/// Development limits are this many times the production ones
const DEVELOPMENT_MULTIPLIER: u32 = 10;

/// Gate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GateSettings {
    /// `development` or `production`
    #[serde(default)]
    pub environment: Environment,

    /// Port for ingestion, admin, health and metrics
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the admin endpoints; admin is disabled without one
    #[serde(default)]
    pub admin_token: Option<String>,

    #[serde(default)]
    pub key_strategy: KeyStrategy,

    /// Kill switch for the rate limiter
    #[serde(default = "default_limiter_enabled")]
    pub limiter_enabled: bool,

    /// Per-route overrides on top of the environment preset
    #[serde(default)]
    pub limits: BTreeMap<String, LimiterConfig>,

    /// Append accepted events to this JSON lines file instead of memory
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default = "default_max_events")]
    pub max_events_per_request: usize,

    /// How long stored event ids are remembered for de-duplication
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_limiter_enabled() -> bool {
    true
}

fn default_max_events() -> usize {
    500
}

fn default_dedup_ttl() -> u64 {
    15 * 60
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            port: default_port(),
            admin_token: None,
            key_strategy: KeyStrategy::default(),
            limiter_enabled: default_limiter_enabled(),
            limits: BTreeMap::new(),
            store_path: None,
            max_events_per_request: default_max_events(),
            dedup_ttl_secs: default_dedup_ttl(),
        }
    }
}

impl GateSettings {
    /// Load from an optional `telemetry-gate.toml` and `GATE_*` variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("telemetry-gate").required(false))
            .add_source(config::Environment::with_prefix("GATE"))
            .build()
            .context("Failed to read gate configuration")?;

        config
            .try_deserialize()
            .context("Invalid gate configuration")
    }

    /// Environment preset with the configured overrides applied
    pub fn limiter_table(&self) -> LimiterTable {
        let scale = match self.environment {
            Environment::Development => DEVELOPMENT_MULTIPLIER,
            Environment::Production => 1,
        };
        let preset = |max_requests: u32| LimiterConfig::new(max_requests * scale, 60);

        let mut table = LimiterTable::new(preset(100))
            .with_route(PRIMARY_ROUTE, preset(100))
            .with_route(ALTERNATE_ROUTE, preset(100));
        for (route, limit) in &self.limits {
            table.routes.insert(route.clone(), *limit);
        }
        table
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            key_strategy: self.key_strategy,
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            max_events_per_request: self.max_events_per_request,
            ..GateConfig::default()
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            environment: self.environment,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_preset() {
        let table = GateSettings::default().limiter_table();
        assert_eq!(table.config_for(PRIMARY_ROUTE), LimiterConfig::new(100, 60));
        assert_eq!(table.config_for("/elsewhere"), LimiterConfig::new(100, 60));
    }

    #[test]
    fn test_development_preset_is_generous() {
        let settings = GateSettings {
            environment: Environment::Development,
            ..Default::default()
        };
        assert_eq!(
            settings.limiter_table().config_for(PRIMARY_ROUTE),
            LimiterConfig::new(1000, 60)
        );
        assert_eq!(settings.analyzer_config().environment, Environment::Development);
    }

    #[test]
    fn test_overrides_win_over_preset() {
        let mut settings = GateSettings::default();
        settings
            .limits
            .insert(ALTERNATE_ROUTE.to_string(), LimiterConfig::new(5, 10));

        let table = settings.limiter_table();
        assert_eq!(table.config_for(ALTERNATE_ROUTE), LimiterConfig::new(5, 10));
        assert_eq!(table.config_for(PRIMARY_ROUTE).max_requests, 100);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: GateSettings = serde_json::from_value(serde_json::json!({
            "environment": "development",
            "key_strategy": "route_and_user",
        }))
        .unwrap();

        assert_eq!(settings.port, 8080);
        assert_eq!(settings.key_strategy, KeyStrategy::RouteAndUser);
        assert!(settings.limiter_enabled);
        assert_eq!(settings.gate_config().max_events_per_request, 500);
    }
}
