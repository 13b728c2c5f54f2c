//! Telemetry gate CLI
//!
//! A command-line tool for reviewing route health, inspecting and applying
//! rate-limit recommendations, and inspecting client offline queues.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{admin, queue};
use std::path::PathBuf;

/// Telemetry gate CLI
#[derive(Parser)]
#[command(name = "tgctl")]
#[command(author, version, about = "CLI for the storefront telemetry gate", long_about = None)]
pub struct Cli {
    /// Gate URL (can also be set via TGCTL_API_URL env var)
    #[arg(long, env = "TGCTL_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Admin bearer token (can also be set via TGCTL_TOKEN env var)
    #[arg(long, env = "TGCTL_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// JSON config file (defaults to ~/.config/tgctl/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show route classification, statistics and current limits
    Report,

    /// Show advisory rate-limit recommendations
    Recommendations {
        /// Only routes whose limit would change
        #[arg(long)]
        changes_only: bool,
    },

    /// Apply recommended limits
    Apply {
        /// Route to apply (repeatable; all changed routes if omitted)
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Show what would change without applying
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear analyzer samples (refused by production gates)
    Cleanup,

    /// Show gate health
    Health,

    /// Offline queue tools
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Inspect a client's offline queue file
    Inspect {
        /// Path to the queue file
        path: PathBuf,

        /// Maximum number of entries to list
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = config::Config::load(cli.config.as_deref())?.resolve(
        cli.api_url,
        cli.token,
        cli.format,
    );
    let format = settings.format;

    // Queue inspection is local and needs no client
    if let Commands::Queue(QueueCommands::Inspect { path, limit }) = &cli.command {
        return queue::inspect(path, *limit, format);
    }

    let client = client::ApiClient::new(&settings.api_url, settings.token)?;

    // Execute command
    match cli.command {
        Commands::Report => admin::show_report(&client, format).await?,
        Commands::Recommendations { changes_only } => {
            admin::show_recommendations(&client, changes_only, format).await?
        }
        Commands::Apply { routes, dry_run } => {
            admin::apply(&client, routes, dry_run, format).await?
        }
        Commands::Cleanup => admin::cleanup(&client, format).await?,
        Commands::Health => admin::health(&client, format).await?,
        Commands::Queue(_) => {}
    }

    Ok(())
}
