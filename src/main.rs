//! virtnode CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use virtnode::bus::MemoryBus;
use virtnode::config::{AgentConfig, LogFormat, DEFAULT_CONFIG_PATH};
use virtnode::host::HostIdentity;
use virtnode::hypervisor::MockHypervisor;
use virtnode::Result;

/// virtnode - compute-node agent for virtual machine fleets
#[derive(Parser, Debug)]
#[command(name = "virtnode")]
#[command(about = "Compute-node agent for virtual machine fleets")]
#[command(version)]
struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until interrupted.
    Run {
        /// Override the heartbeat interval (e.g. "5s").
        #[arg(long, value_parser = parse_duration)]
        heartbeat_interval: Option<Duration>,

        /// Override the guest telemetry interval (e.g. "30s").
        #[arg(long, value_parser = parse_duration)]
        guest_interval: Option<Duration>,
    },

    /// Print the effective configuration.
    Config,

    /// Print the node id this host reports as.
    NodeId,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match AgentConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(cli.verbose, config.log_format);
    tracing::debug!(version = virtnode::VERSION, config = %cli.config.display(), "starting virtnode");

    let result = match cli.command {
        Commands::Run {
            heartbeat_interval,
            guest_interval,
        } => {
            if let Some(interval) = heartbeat_interval {
                config.telemetry.heartbeat_interval = interval;
            }
            if let Some(interval) = guest_interval {
                config.telemetry.guest_interval = interval;
            }
            run(&config)
        }
        Commands::Config => config.to_toml().map(|toml| print!("{}", toml)),
        Commands::NodeId => {
            HostIdentity::detect(config.node_id).map(|identity| println!("{}", identity.node_id))
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

fn run(config: &AgentConfig) -> Result<()> {
    // Hypervisor and bus bindings are provided by the embedding deployment;
    // the standalone binary runs against the in-process implementations.
    tracing::warn!("using in-process hypervisor and message bus");
    let hypervisor = Arc::new(MockHypervisor::new());
    let bus = Arc::new(MemoryBus::new());

    let agent = virtnode::agent::start(config, hypervisor, bus)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(shutdown_signal());

    agent.stop();
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

/// Initialize the tracing subscriber.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "virtnode=debug" } else { "virtnode=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
