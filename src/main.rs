//! CLI entry point for solar-monitor
//!
//! Loads the configuration, selects app blocks, and runs the acquisition and
//! delivery workers until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! solar-monitor --conf_path config/solar_monitor.yaml --app monitor --debug
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use solar_monitor::config::{MonitorConfig, DEFAULT_CONF_PATH};
use solar_monitor::logging::{self, TracingConfig};
use solar_monitor::orchestrator::{describe_blocks, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "solar-monitor", version)]
#[command(about = "VE.Direct solar monitoring service", long_about = None)]
struct Cli {
    /// Run only the app block with this name
    #[arg(long)]
    block: Option<String>,

    /// Run only app blocks of this application
    #[arg(long)]
    app: Option<String>,

    /// Configuration file
    #[arg(long = "conf_path", default_value = DEFAULT_CONF_PATH)]
    conf_path: PathBuf,

    /// Directory for rolling log files
    #[arg(long = "log_path")]
    log_path: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match logging::init(TracingConfig::from_cli(cli.debug, cli.log_path.clone())) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "solar-monitor terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = MonitorConfig::load_from(&cli.conf_path)
        .with_context(|| format!("loading {}", cli.conf_path.display()))?;

    let blocks = config.select_blocks(cli.block.as_deref(), cli.app.as_deref());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        conf = %cli.conf_path.display(),
        blocks = %describe_blocks(&blocks),
        "Starting solar-monitor"
    );

    let orchestrator = Orchestrator::build(&config, cli.block.as_deref(), cli.app.as_deref()).await?;
    let status = orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!(workers = status.len(), "Clean shutdown");
    Ok(())
}
