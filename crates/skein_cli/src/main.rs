//! skein CLI
//!
//! Runs the demo trading workflow on an in-memory engine and prints the
//! effective configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod demo;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use config::SkeinConfig;
use demo::DemoRequest;
use skein_core::StepState;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "skein - step orchestration for trading workflows", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `skein=debug`; defaults to `RUST_LOG` or `skein=info`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo workflow: symbol scan, indicator fan-out, order placement
    Demo {
        /// Symbols to scan
        #[arg(short, long, value_delimiter = ',', default_value = "BTCUSDT,ETHUSDT,SOLUSDT")]
        symbols: Vec<String>,
        /// Indicator timeframes
        #[arg(short, long, value_delimiter = ',', default_value = "15m,1h,4h")]
        timeframes: Vec<String>,
        /// Quantity per order
        #[arg(short, long, default_value_t = 0.01)]
        quantity: f64,
        /// Seconds to wait for the workflow to settle
        #[arg(long, default_value_t = 30)]
        deadline_secs: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skein=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let config = SkeinConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo {
            symbols,
            timeframes,
            quantity,
            deadline_secs,
            json,
        } => {
            let request = DemoRequest {
                symbols,
                timeframes,
                quantity,
                deadline: Duration::from_secs(deadline_secs),
            };
            let report = demo::run(&config, &request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("Workflow {} {}", report.root, if report.settled { "settled" } else { "still open" });
            println!("Steps:");
            for state in StepState::ALL {
                println!("  {:<10} {}", state.as_str(), report.telemetry.count(state));
            }
            let metrics = &report.telemetry.metrics;
            println!(
                "Claims {}  retries {}  lock timeouts {}  joins {}",
                metrics.steps_claimed, metrics.retries, metrics.lock_timeouts, metrics.joins_resolved
            );
            println!("Orders:");
            for order in &report.orders {
                println!(
                    "  {:<10} {:?} {} (signal {:+.5}){}",
                    order.symbol,
                    order.side,
                    order.quantity,
                    order.signal,
                    if order.confirmed { "" } else { " unconfirmed" }
                );
            }
            println!("Workers:");
            for worker in &report.workers {
                println!(
                    "  {} on {:<8} cycles {:<5} steps {}",
                    worker.worker_id, worker.shard, worker.cycles, worker.steps_run
                );
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
