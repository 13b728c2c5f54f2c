//! Admin commands against a running gate

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;
use tabled::Tabled;
use telemetry_lib::server::ApplyRequest;

use crate::client::{AdminReport, ApiClient, ApplyResult, CleanupResult, Recommendation};
use crate::output::{
    color_classification, color_status, format_limit, format_ms, format_ratio,
    format_timestamp_ms, print_info, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for the route status table
#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Class")]
    classification: String,
    #[tabled(rename = "Requests")]
    count: usize,
    #[tabled(rename = "Rejected")]
    rejected: usize,
    #[tabled(rename = "Error rate")]
    error_rate: String,
    #[tabled(rename = "p50")]
    p50: String,
    #[tabled(rename = "p95")]
    p95: String,
    #[tabled(rename = "Limit")]
    limit: String,
}

/// Row for the recommendations table
#[derive(Tabled)]
struct RecommendationRow {
    #[tabled(rename = "Route")]
    route: String,
    #[tabled(rename = "Class")]
    classification: String,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Recommended")]
    recommended: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

impl From<&Recommendation> for RecommendationRow {
    fn from(r: &Recommendation) -> Self {
        let recommended = format_limit(r.recommended.max_requests, r.recommended.window_seconds);
        Self {
            route: r.route.clone(),
            classification: color_classification(&r.classification),
            current: format_limit(r.current.max_requests, r.current.window_seconds),
            recommended: if r.changes_limit() {
                recommended.bold().to_string()
            } else {
                recommended
            },
            reason: r.reason.clone(),
        }
    }
}

/// Classification, statistics and limits per route
pub async fn show_report(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: AdminReport = client.get("admin/telemetry/report").await?;

    if format == OutputFormat::Json {
        return print_json(&report);
    }

    println!(
        "Environment: {}   Generated: {}",
        report.environment.bold(),
        format_timestamp_ms(report.generated_at)
    );
    let limiter = &report.limiter;
    println!(
        "Limiter: {}   requests {}   allowed {}   blocked {}   keys {}\n",
        if limiter.enabled {
            "enabled".green()
        } else {
            "disabled".red()
        },
        limiter.total_requests,
        limiter.allowed_requests,
        limiter.blocked_requests,
        limiter.tracked_keys
    );

    let rows: Vec<RouteRow> = report
        .routes
        .iter()
        .map(|r| {
            let limit = report
                .limits
                .routes
                .get(&r.route)
                .unwrap_or(&report.limits.default);
            RouteRow {
                route: r.route.clone(),
                classification: color_classification(&r.classification),
                count: r.stats.count,
                rejected: r.stats.rejected_count,
                error_rate: format_ratio(r.stats.error_rate),
                p50: format_ms(r.stats.p50_ms),
                p95: format_ms(r.stats.p95_ms),
                limit: format_limit(limit.max_requests, limit.window_seconds),
            }
        })
        .collect();
    print_table(rows, "No traffic recorded yet");

    if !limiter.top_blocked_keys.is_empty() {
        println!("\nMost rejected keys:");
        for (key, count) in &limiter.top_blocked_keys {
            println!("  {:<48} {}", key, count);
        }
    }

    if let Some(conversion) = &report.conversion {
        println!("\nConversion:");
        println!(
            "  cart +{} / -{}   checkouts {} -> {}   conversion {:.1}%   abandonment {:.1}%   AOV {:.2}",
            conversion.cart_additions,
            conversion.cart_removals,
            conversion.checkout_starts,
            conversion.checkout_completions,
            conversion.conversion_rate,
            conversion.cart_abandonment_rate,
            conversion.average_order_value
        );
    }

    Ok(())
}

/// Advisory limit recommendations; nothing is changed
pub async fn show_recommendations(
    client: &ApiClient,
    changes_only: bool,
    format: OutputFormat,
) -> Result<()> {
    let recommendations: Vec<Recommendation> =
        client.get("admin/telemetry/recommendations").await?;
    let filtered: Vec<Recommendation> = recommendations
        .into_iter()
        .filter(|r| !changes_only || r.changes_limit())
        .collect();

    if format == OutputFormat::Json {
        return print_json(&filtered);
    }

    let changes = filtered.iter().filter(|r| r.changes_limit()).count();
    print_table(
        filtered.iter().map(RecommendationRow::from).collect(),
        "No recommendations",
    );
    if changes > 0 {
        print_info(&format!(
            "{} route(s) would change; run `tgctl apply` to apply",
            changes
        ));
    }
    Ok(())
}

/// Apply recommendations for the given routes, or all changed routes
pub async fn apply(
    client: &ApiClient,
    routes: Vec<String>,
    dry_run: bool,
    format: OutputFormat,
) -> Result<()> {
    let request = ApplyRequest { routes, dry_run };
    let result: ApplyResult = client.post("admin/telemetry/apply", &request).await?;

    if format == OutputFormat::Json {
        return print_json(&result);
    }

    if result.applied.is_empty() {
        print_info("No limit changes to apply");
        return Ok(());
    }

    print_table(
        result.applied.iter().map(RecommendationRow::from).collect(),
        "No limit changes",
    );
    if result.dry_run {
        print_warning("Dry-run mode - no changes applied");
    } else {
        print_success(&format!("Applied {} limit change(s)", result.applied.len()));
    }
    Ok(())
}

/// Clear analyzer samples (development gates only)
pub async fn cleanup(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let result: CleanupResult = client
        .post("admin/telemetry/cleanup", &serde_json::json!({}))
        .await?;

    if format == OutputFormat::Json {
        return print_json(&result);
    }
    print_success(&format!(
        "Cleared samples for {} route(s) at {}",
        result.cleared, result.cleared_at
    ));
    Ok(())
}

/// Gate health; does not need a token
pub async fn health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: Value = client.get("healthz").await?;

    if format == OutputFormat::Json {
        return print_json(&health);
    }

    let status = health["status"].as_str().unwrap_or("unknown");
    println!("Status: {}", color_status(status));
    if let Some(components) = health["components"].as_object() {
        for (name, component) in components {
            let status = component["status"].as_str().unwrap_or("unknown");
            match component["message"].as_str() {
                Some(message) => println!("  {:<10} {} ({})", name, color_status(status), message),
                None => println!("  {:<10} {}", name, color_status(status)),
            }
        }
    }
    Ok(())
}
