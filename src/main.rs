mod address;
mod config;
mod decode;
mod downloader;
mod logfile;
mod model;
mod mrtg;
mod query;
mod reading;
mod scanner;
mod state;
mod svg;
mod transport;

use crate::config::Config;
use crate::logfile::TitleMap;
use crate::reading::DAY_SAMPLE;
use crate::state::AcquisitionState;
use crate::transport::dbus::DbusTransport;
use anyhow::Result;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

fn init_tracing(verbosity: u8) -> Result<()> {
    let default = match verbosity {
        0 => "info,govee_logger=info",
        1 => "info,govee_logger=debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

/// Flip the shutdown flag on SIGINT or SIGHUP; every suspension point in
/// the acquisition loop observes it.
fn spawn_signal_watcher(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error=%err, "cannot watch SIGHUP");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.send(true).ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
            _ = hangup.recv() => tracing::info!("hangup received"),
        }
        shutdown.send(true).ok();
    });
}

/// No-Bluetooth mode: track log files some other process writes, and keep
/// the caches and charts fresh.
async fn run_monitor(
    config: &Config,
    state: &mut AcquisitionState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let Some(log_dir) = config.log_dir.clone() else {
        anyhow::bail!("monitor mode needs a log directory");
    };
    let mut titles = TitleMap::default();
    let mut ticker = tokio::time::interval(Duration::from_secs(DAY_SAMPLE as u64));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        logfile::monitor_logged_data(&log_dir, state, 35 * 60);
        if let Some(cache_dir) = &config.cache_dir {
            logfile::write_cache_files(cache_dir, &state.mrtg).ok();
        }
        if let Some(path) = &config.titlemap {
            titles.refresh(path);
        }
        if let Some(svg_dir) = &config.svg_dir {
            svg::write_all(svg_dir, state, &titles);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let (config, verbosity) = Config::load()?;

    // Query mode is a plain filter-style invocation: no logging setup, no
    // Bluetooth, four lines on stdout.
    if let Some(address) = &config.query {
        let log_dir = config
            .log_dir
            .clone()
            .ok_or_else(|| anyhow::anyhow!("query mode needs a log directory"))?;
        return query::print_mrtg(&log_dir, address, config.minutes_average);
    }

    init_tracing(verbosity)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log = ?config.log_dir,
        cache = ?config.cache_dir,
        svg = ?config.svg_dir,
        download_days = config.download_days,
        "starting"
    );

    let mut state = AcquisitionState::new();
    logfile::read_persistence(
        config.log_dir.as_deref(),
        config.cache_dir.as_deref(),
        &mut state.thermometers,
        &mut state.last_download,
    );
    if let Some(cache_dir) = &config.cache_dir {
        state.mrtg = logfile::read_cache_dir(cache_dir, &state.thermometers);
    }
    if let Some(log_dir) = &config.log_dir {
        logfile::replay_log_dir(log_dir, &mut state);
    }
    tracing::info!(devices = state.mrtg.len(), "history restored");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx);

    let result = if config.monitor_only {
        run_monitor(&config, &mut state, shutdown_rx).await
    } else if config.use_hci {
        run_hci(&config, &mut state, shutdown_rx).await
    } else {
        let transport = DbusTransport::open(config.adapter.as_deref()).await?;
        scanner::run(transport, &config, &mut state, shutdown_rx).await
    };

    // Whatever happened, keep the registry current for the next start.
    if let Some(log_dir) = &config.log_dir {
        logfile::write_persistence(log_dir, &state.thermometers, &state.last_download).ok();
    }
    result
}

#[cfg(feature = "hci")]
async fn run_hci(
    config: &Config,
    state: &mut AcquisitionState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let transport = transport::hci::HciTransport::open(config.adapter.as_deref()).await?;
    scanner::run(transport, config, state, shutdown).await
}

#[cfg(not(feature = "hci"))]
async fn run_hci(
    _config: &Config,
    _state: &mut AcquisitionState,
    _shutdown: watch::Receiver<bool>,
) -> Result<()> {
    anyhow::bail!("this build does not include the raw HCI transport")
}
