//! # OpenTherm Gateway
//!
//! Polls an OpenTherm boiler and runs hot-water and heating thermostats on
//! top of it. With gateway mode enabled the device sits between a room unit
//! and the boiler and passes the room unit's traffic through.
//!
//! # Usage
//!
//! ```bash
//! opentherm-gateway [config.toml]
//! ```
//!
//! The configuration path defaults to `config/default.toml`. Log filtering
//! follows `[logging] level` unless `RUST_LOG` is set.
//!
//! Expected output:
//! ```text
//! INFO opentherm_gateway: OpenTherm Gateway v0.1.0 starting...
//! INFO opentherm_gateway::boiler: Boiler driver started (gateway mode off, 2 zone(s), poll every 30s)
//! INFO telemetry: {"boiler_temperature":45.0,...,"timestamp":"2024-01-15T06:30:00.000Z"}
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opentherm_gateway::boiler::Boiler;
use opentherm_gateway::config::{Backend, Config, LoggingConfig};
use opentherm_gateway::link::sim::{IdleLine, SimulatedBoiler};
use opentherm_gateway::link::{BitLink, LineIo};
use opentherm_gateway::session::SlaveSession;
use opentherm_gateway::state::DeviceState;
use opentherm_gateway::telemetry::SnapshotReporter;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Frames from the room unit waiting for the driver
const UPSTREAM_CHANNEL_SIZE: usize = 4;

/// Console logging plus an optional daily rolling file
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;

    let _log_guard = init_logging(&config.logging);
    info!("OpenTherm Gateway v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", path);

    match config.link.backend {
        Backend::Simulated => {
            info!("Using the simulated boiler backend");
            let delay = Duration::from_millis(config.link.simulated_response_delay_ms);
            let boiler = SimulatedBoiler::new().with_response_delay(delay);
            serve(config, boiler, Some(IdleLine)).await
        }
        Backend::Gpio => serve_gpio(config).await,
    }
}

#[cfg(feature = "gpio")]
async fn serve_gpio(config: Config) -> Result<()> {
    use opentherm_gateway::link::gpio::GpioLine;

    let pins = &config.pins;
    let master = GpioLine::open(pins.master_in, pins.master_out, pins.input_active, pins.output_active)
        .context("Failed to open the master pair")?;
    info!("Master pair on GPIO {} (in) / {} (out)", pins.master_in, pins.master_out);

    if !config.gateway.enabled {
        return serve::<_, GpioLine>(config, master, None).await;
    }

    let slave = GpioLine::open(pins.slave_in, pins.slave_out, pins.input_active, pins.output_active)
        .context("Failed to open the slave pair")?;
    info!("Slave pair on GPIO {} (in) / {} (out)", pins.slave_in, pins.slave_out);
    serve(config, master, Some(slave)).await
}

#[cfg(not(feature = "gpio"))]
async fn serve_gpio(_config: Config) -> Result<()> {
    anyhow::bail!("backend = \"gpio\" needs a build with `--features gpio`")
}

/// Run the driver, the optional slave session and the reporter until Ctrl+C
async fn serve<M, S>(config: Config, master: M, slave: Option<S>) -> Result<()>
where
    M: LineIo + 'static,
    S: LineIo + 'static,
{
    let state = Arc::new(DeviceState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut boiler, handle) = Boiler::new(master, &config, state.clone());

    let mut tasks = Vec::new();
    match slave {
        Some(line) if config.gateway.enabled => {
            let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_CHANNEL_SIZE);
            boiler = boiler.with_upstream(upstream_rx);
            let session = SlaveSession::new(BitLink::new(line), state, config.polling.stale_after());
            tasks.push(tokio::spawn(session.run(upstream_tx, shutdown_rx.clone())));
        }
        _ => info!("Gateway mode disabled, slave pair left inert"),
    }

    let reporter = SnapshotReporter::new(config.sensors.clone());
    tasks.push(tokio::spawn(reporter.run(handle.subscribe(), shutdown_rx.clone())));
    let driver = tokio::spawn(boiler.run(shutdown_rx));

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    shutdown_tx.send(true).context("All tasks already stopped")?;
    driver.await.context("Boiler driver panicked")?;
    for task in tasks {
        task.await.context("Background task panicked")?;
    }

    let snapshot = handle.snapshot();
    info!(
        "Final state: {} ok / {} failed transactions, link fault {}",
        snapshot.stats.ok, snapshot.stats.failed, snapshot.link_fault
    );
    Ok(())
}
