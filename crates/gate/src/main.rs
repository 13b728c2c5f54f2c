//! Telemetry gate - storefront event ingestion service
//!
//! Admits event batches through the sliding-window limiter, hands them to the
//! analytics store and serves the admin, health and metrics endpoints.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use telemetry_gate::{api, config::GateSettings};
use telemetry_lib::{
    clock::{system_clock, Clock},
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    server::{
        AdminAuthorizer, AdminService, DenyAll, EventStore, IngestionGate, JsonlEventStore,
        MemoryEventStore, PerformanceAnalyzer, RateLimiter, StaticTokenAuthorizer,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const GATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Idle limiter windows are dropped this often
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting telemetry-gate");

    let settings = GateSettings::load()?;
    info!(
        environment = ?settings.environment,
        key_strategy = ?settings.key_strategy,
        limiter_enabled = settings.limiter_enabled,
        "Gate configured"
    );

    let health_registry = HealthRegistry::for_gate().await;
    let clock = system_clock();

    let limiter = Arc::new(RateLimiter::new(settings.limiter_table()));
    limiter.set_enabled(settings.limiter_enabled);
    if !settings.limiter_enabled {
        health_registry
            .set_degraded(components::LIMITER, "rate limiter disabled")
            .await;
    }
    let analyzer = Arc::new(PerformanceAnalyzer::new(settings.analyzer_config()));

    // Conversion figures are only available from the in-memory store
    let (store, memory_store) = match &settings.store_path {
        Some(path) => {
            info!(path = %path.display(), "Appending events to file");
            let store: Arc<dyn EventStore> = Arc::new(JsonlEventStore::new(path));
            (store, None)
        }
        None => {
            warn!("No store path configured, keeping events in memory");
            let memory = Arc::new(MemoryEventStore::new());
            (memory.clone() as Arc<dyn EventStore>, Some(memory))
        }
    };

    let gate = Arc::new(
        IngestionGate::builder(store)
            .config(settings.gate_config())
            .limiter(limiter.clone())
            .analyzer(analyzer.clone())
            .clock(clock.clone())
            .health(health_registry.clone())
            .build(),
    );

    let authorizer: Arc<dyn AdminAuthorizer> = match &settings.admin_token {
        Some(token) => Arc::new(StaticTokenAuthorizer::new(token)),
        None => {
            warn!("No admin token configured, admin endpoints are disabled");
            Arc::new(DenyAll)
        }
    };
    let mut admin = AdminService::new(limiter.clone(), analyzer, authorizer, clock.clone());
    if let Some(memory) = memory_store {
        admin = admin.with_conversion_source(memory);
    }

    let logger = StructuredLogger::new("gate");
    let addr = format!("0.0.0.0:{}", settings.port);
    logger.log_startup(GATE_VERSION, settings.environment, &addr);

    let app_state = Arc::new(api::AppState::new(gate, admin, health_registry.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Drop limiter windows nobody has used for a while
    let mut prune_shutdown = shutdown_tx.subscribe();
    let prune_limiter = limiter.clone();
    let prune_clock = clock.clone();
    let prune_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = prune_limiter.prune_idle(prune_clock.now_ms());
                    if pruned > 0 {
                        info!(pruned, "Pruned idle limiter windows");
                    }
                }
                _ = prune_shutdown.recv() => break,
            }
        }
    });

    // Mark gate as ready after initialization
    health_registry.set_ready(true).await;

    let mut server_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(settings.port, app_state, async move {
        let _ = server_shutdown.recv().await;
    }));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }
    let _ = prune_handle.await;
    info!("Shutdown complete");

    Ok(())
}
