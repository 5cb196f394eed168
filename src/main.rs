//! meshgate CLI entry point
//!
//! A `clap`-derived `Run` subcommand starts the gateway and blocks until a
//! shutdown signal; a `Config { show }` subcommand validates configuration
//! and optionally prints the normalized [`Settings`].

use clap::{Parser, Subcommand};
use meshgate::config::{load_raw_config, validate, RawConfig};
use meshgate::observability::{init_default_logging, HealthServer};
use meshgate::{gateway, Settings};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Uni-directional Meshtastic mesh-to-MQTT gateway")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and block until a shutdown signal.
    Run,
    /// Validate configuration, optionally printing the normalized settings.
    Config {
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["gateway.toml", "config/gateway.toml"];

fn load_raw(explicit: &Option<PathBuf>) -> RawConfig {
    if let Some(path) = explicit {
        return load_raw_config(path).unwrap_or_else(|e| {
            error!(error = %e, path = %path.display(), "failed to load configuration");
            process::exit(1);
        });
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!(path = %path.display(), "loading configuration");
            return load_raw_config(&path).unwrap_or_else(|e| {
                error!(error = %e, path = %path.display(), "failed to load configuration");
                process::exit(1);
            });
        }
    }

    info!("no configuration file found, proceeding with defaults");
    RawConfig::new()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    info!("starting meshgate v{}", env!("CARGO_PKG_VERSION"));

    let raw = load_raw(&cli.config);

    match cli.command {
        Commands::Run => {
            if let Err(e) = run(&raw).await {
                error!(error = %e, "gateway exited with error");
                process::exit(1);
            }
        }
        Commands::Config { show } => {
            handle_config_command(&raw, show);
        }
    }

    info!("shutdown complete");
}

async fn run(raw: &RawConfig) -> meshgate::GatewayResult<()> {
    let gateway = Arc::new(gateway::initialize(raw)?);

    let health_server = Arc::new(HealthServer::from_env(gateway.clone()));
    tokio::spawn(health_server.start());

    gateway.start().await?;
    info!("gateway running, waiting for shutdown signal");

    wait_for_shutdown_signal().await;

    info!("shutdown signal received, stopping gateway");
    gateway.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

fn handle_config_command(raw: &RawConfig, show: bool) {
    match validate(raw) {
        Ok(settings) => {
            info!("configuration is valid");
            if show {
                print_settings(&settings);
            }
        }
        Err(e) => {
            error!(error = %e, "configuration validation failed");
            process::exit(1);
        }
    }
}

fn print_settings(settings: &Settings) {
    println!("enabled: {}", settings.enabled);
    println!("broker: {}:{}", settings.broker_address, settings.broker_port);
    println!("root_topic: {}", settings.root_topic);
    println!("region: {}", settings.region);
    println!("format: {:?}", settings.format);
    println!("encryption_enabled: {}", settings.encryption_enabled);
    println!(
        "rate limit: {} msg/s, burst x{}",
        settings.max_messages_per_second, settings.burst_multiplier
    );
    println!("queue_max_size: {}", settings.queue_max_size);
    println!(
        "reconnect: enabled={} initial={}s max={}s multiplier={}x max_attempts={}",
        settings.reconnect_enabled,
        settings.reconnect_initial_delay,
        settings.reconnect_max_delay,
        settings.reconnect_multiplier,
        settings.max_reconnect_attempts
    );
    println!("log_level: {}", settings.log_level.as_str());
    println!("channels configured: {}", settings.channels.len());
}
