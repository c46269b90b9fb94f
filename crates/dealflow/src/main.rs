use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dealflow::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "dealflow",
    about = "Deal pipeline runtime - health monitoring and adaptive performance optimization"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/dealflow.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Sample once, run a single optimization cycle, print the report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (respects RUST_LOG env var)
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let config = dealflow::load_config(&cli.config)?;
    let runtime = Runtime::from_config(config).context("Failed to build runtime")?;

    if cli.once {
        let report = runtime.report_once().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();

    // Handle shutdown signals
    let token = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        token.cancel();
    });

    runtime.start().await?;

    let interval = runtime.config().workflow.metrics_interval();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let health = runtime.monitor().get_system_health_summary().await;
                let summary = runtime.optimizer().get_optimization_summary().await;
                info!(
                    status = ?health.overall_status,
                    cpu = health.system_metrics.cpu_percent,
                    memory = health.system_metrics.memory_percent,
                    active_alerts = health.active_alerts,
                    cycles = summary.optimization_cycles,
                    threads = summary.current_scale.threads,
                    processes = summary.current_scale.processes,
                    open_circuits = summary.error_stats.open_circuits.len(),
                    "Runtime summary"
                );
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
