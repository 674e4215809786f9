mod config;
mod hub;
mod klipper;
mod opentag;
mod protocol;
mod rfid;
mod state;
mod storage;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use hub::Orchestrator;
use klipper::KlipperClient;
use state::StateManager;
use std::path::PathBuf;
use std::time::Duration;
use storage::RecordStore;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Inbound frame channel capacity between transport and protocol engine.
const TRANSPORT_CHANNEL_CAPACITY: usize = 256;

/// Event channel capacity into the orchestrator, per source.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// How long tasks get to observe the stop signal and exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the operator-reset channel; resets are rare and coalesce.
const RESET_CHANNEL_CAPACITY: usize = 1;

#[derive(Parser, Debug)]
#[command(name = "filament-hub")]
#[command(about = "Supervisory daemon bridging a Klipper printer and a CAN filament cabinet")]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "/etc/filament-hub/config.yaml")]
    config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace), overriding the config
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // An unreadable or invalid config is the one fatal startup error;
    // everything later is retried or supervised.
    let config = Config::load(&args.config).context("invalid configuration")?;

    // The appender guard must outlive the runtime so buffered log lines are
    // flushed on exit.
    let _log_guard = init_logging(&config.logging, args.verbose)?;

    run(&config).await
}

/// Builds the tracing subscriber: stderr, plus a daily-rolling file when
/// `logging.log_dir` is configured.
fn init_logging(
    logging: &config::LoggingConfig,
    verbose: u8,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .with_context(|| format!("invalid log level {level:?}"))?;

    match &logging.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "filament-hub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Wires the components together and supervises them until a stop signal.
async fn run(config: &Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (transport_event_tx, transport_event_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
    let (protocol_event_tx, protocol_event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (observer_event_tx, observer_event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let (transport_handle, transport_task) = transport::spawn(
        config.can.interface.clone(),
        transport_event_tx,
        shutdown_rx.clone(),
    );

    let engine_settings = protocol::EngineSettings {
        default_extruder: config.extruder_mapping.default_active,
        transfer_timeout: Duration::from_secs(config.rfid.transfer_timeout_seconds),
        cleanup_interval: Duration::from_secs(config.rfid.cleanup_interval_seconds),
        rfid_enabled: config.rfid.enabled,
    };
    let (cabinet, engine_task) = protocol::spawn(
        engine_settings,
        transport_handle,
        transport_event_rx,
        protocol_event_tx,
        shutdown_rx.clone(),
    );

    let (printer, observer_task) = KlipperClient::spawn(
        &config.klipper,
        config.filament_runout.sensors.clone(),
        observer_event_tx,
        shutdown_rx.clone(),
    );

    // SIGHUP is the operator-reset hook: it clears the Error state without
    // restarting the daemon.
    let (reset_tx, reset_rx) = mpsc::channel(RESET_CHANNEL_CAPACITY);
    let reset_task = tokio::spawn(forward_reset_signal(reset_tx, shutdown_rx.clone()));

    let (state, _state_watch) = StateManager::new();
    let store = RecordStore::new(config.rfid.data_dir.clone());
    let orchestrator = Orchestrator::new(config, state, cabinet, printer, store);
    let pump_task = tokio::spawn(orchestrator.run(
        protocol_event_rx,
        observer_event_rx,
        reset_rx,
        shutdown_rx,
    ));

    info!(
        interface = %config.can.interface,
        printer = %config.klipper.base_url,
        "filament-hub running"
    );

    wait_for_stop_signal().await?;
    info!("stop signal received, shutting down");
    shutdown_tx.send_replace(true);

    // Drain order matters: the orchestrator and observer first, the CAN
    // link last so diagnostics stay possible until the end.
    let drain = async {
        let _ = reset_task.await;
        let _ = pump_task.await;
        let _ = observer_task.await;
        let _ = engine_task.await;
        let _ = transport_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        warn!(timeout = ?SHUTDOWN_TIMEOUT, "tasks did not stop in time, exiting anyway");
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_stop_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Forwards each SIGHUP to the orchestrator as an operator reset.
async fn forward_reset_signal(reset_tx: mpsc::Sender<()>, mut shutdown: watch::Receiver<bool>) {
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler, operator reset unavailable");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            signal = sighup.recv() => {
                if signal.is_none() {
                    break;
                }
                // A reset already queued is the same reset.
                let _ = reset_tx.try_send(());
            }
        }
    }
}
