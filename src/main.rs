//! RepMarket oracle engine runner
//!
//! The engine is driven by an external scheduler in production; this binary
//! offers an interval loop for deployments without one, a run-once mode for
//! cron, and a read-only status snapshot for monitoring.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use repmarket_backend::models::Config;
use repmarket_backend::oracle::OracleEngine;
use repmarket_backend::sources::LiveSources;
use repmarket_backend::store::MarketDb;

#[derive(Parser)]
#[command(name = "repmarket", about = "Credibility-weighted prediction market engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lock/resolve/settle batch on a fixed interval
    Run {
        /// Seconds between engine runs (overrides ENGINE_INTERVAL_SECS)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run one batch and exit (for cron-style scheduling)
    Once,
    /// Print market status counts and exit
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let db = MarketDb::new(&config.database_path)?;
    let sources = LiveSources::from_config(&config)?;
    let engine = OracleEngine::new(db, sources);

    match cli.command {
        Command::Run { interval } => {
            let secs = interval.unwrap_or(config.engine_interval_secs);
            info!(interval_secs = secs, db = %config.database_path, "starting oracle engine loop");
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                ticker.tick().await;
                match engine.run().await {
                    Ok(result) => {
                        if result.processed > 0 {
                            info!(
                                locked = result.locked.len(),
                                resolved = result.resolved.len(),
                                settled = result.settled.len(),
                                errors = result.errors.len(),
                                "engine run finished"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "engine run failed"),
                }
            }
        }
        Command::Once => {
            let result = engine.run().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Status => {
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
