//! hostdeck-engine: shell sessions and host telemetry over stdio.
//!
//! Launched by the presentation layer. Reads commands on stdin, writes
//! events on stdout, logs to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use hostdeck_core::{Inbound, WireFormat};
use hostdeck_engine::bridge::event_bridge;
use hostdeck_engine::config::{expand_tilde, ConfigOverrides, EngineConfig};
use hostdeck_engine::engine::Engine;
use hostdeck_engine::telemetry::AdapterKind;
use hostdeck_engine::transport::serve;
use tracing::{info, warn};

/// hostdeck-engine: session and telemetry engine
#[derive(Parser, Debug)]
#[command(name = "hostdeck-engine", version, about = "Session and telemetry engine")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.config/hostdeck/engine.toml")]
    config: String,

    /// Default shell command line
    #[arg(long)]
    shell: Option<String>,

    /// Default working directory for new sessions
    #[arg(long)]
    cwd: Option<String>,

    /// Telemetry sampling interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Disable a metric adapter (cpu, memory, disk, network, processes, host)
    #[arg(long = "disable-adapter")]
    disable_adapter: Vec<AdapterKind>,

    /// Wire format on stdin/stdout (cbor, json)
    #[arg(long, default_value = "cbor")]
    format: WireFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries the event stream, so logs go to stderr.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        format = ?cli.format,
        "starting hostdeck-engine"
    );

    let overrides = ConfigOverrides {
        shell: cli.shell,
        cwd: cli.cwd,
        interval_ms: cli.interval_ms,
        disabled_adapters: cli.disable_adapter,
    };
    let config_path = expand_tilde(&cli.config);
    let config = EngineConfig::load(Some(&config_path), &overrides)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let (engine_side, ui) = event_bridge(config.bridge);
    let commands = ui.commands.clone();
    let engine = Engine::spawn(config, engine_side);
    let mut transport = tokio::spawn(serve(
        ui,
        cli.format,
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));

    let served = tokio::select! {
        served = &mut transport => served,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            if commands.send(Inbound::Shutdown).await.is_err() {
                warn!("engine already stopped");
            }
            transport.await
        }
    };
    drop(commands);

    match served.context("transport task failed")? {
        Ok(()) => {}
        // The consumer going away is an ordinary way to end.
        Err(e) => warn!(error = %e, "transport ended with error"),
    }
    engine.await.context("engine task failed")?;

    info!("hostdeck-engine stopped");
    // A blocked stdin read would otherwise hold the runtime open.
    std::process::exit(0)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
