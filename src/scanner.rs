//! Scan lifecycle controller.
//!
//! Owns the transport: rotates scan timing, installs the whitelist, pumps
//! advertisements into the decoder and aggregator, pauses scanning around
//! history downloads, and drives the housekeeping deadlines (log flush,
//! cache flush, chart rendering, advertisement watchdog).

use crate::address::{BdAddr, ADDR_ALL};
use crate::config::Config;
use crate::decode;
use crate::downloader::{self, DownloadError};
use crate::logfile::{self, TitleMap};
use crate::model::DeviceModel;
use crate::reading::DAY_SAMPLE;
use crate::state::AcquisitionState;
use crate::svg;
use crate::transport::{GattSession, ScanParams, Transport, TransportError};
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;

/// Interval/window pairs in 0.625 ms units. Some sensors only answer
/// reliably under particular duty cycles, so each scan restart moves to
/// the next pair.
const SCAN_TIMING: [(u16, u16); 6] = [
    (18, 18),
    (8000, 800),
    (8000, 8000),
    (8000, 3200),
    (64, 48),
    (96, 48),
];

/// Force a scan restart if the air has been silent this long.
const MAX_ADVERTISEMENT_SILENCE: i64 = 3 * 60;

const ADVERTISEMENT_POLL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct TimingRotation {
    next: usize,
}

impl TimingRotation {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn advance(&mut self) -> (u16, u16) {
        let pair = SCAN_TIMING[self.next];
        self.next = (self.next + 1) % SCAN_TIMING.len();
        pair
    }
}

pub async fn run<T: Transport>(
    mut transport: T,
    config: &Config,
    state: &mut AcquisitionState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut timing = TimingRotation::new();
    let mut titles = TitleMap::default();
    if let Some(path) = &config.titlemap {
        titles.refresh(path);
    }

    restart_scan(&mut transport, config, state, &mut timing)
        .await
        .context(
            "failed to start scanning; the binary may need \
             cap_net_raw/cap_net_admin or access to the bluetooth group",
        )?;

    let mut last_advertisement = Utc::now().timestamp();
    let mut last_flush = Utc::now().timestamp();
    let mut last_render = Utc::now().timestamp();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let event = tokio::select! {
            event = transport.next_advertisement(ADVERTISEMENT_POLL) => event,
            _ = shutdown.changed() => continue,
        };

        let now = Utc::now().timestamp();
        match event {
            Ok(Some(advertisement)) => {
                last_advertisement = now;
                if let Some(candidate) = handle_advertisement(state, config, &advertisement, now) {
                    run_download(&mut transport, state, candidate, now, &shutdown).await;
                    restart_scan(&mut transport, config, state, &mut timing)
                        .await
                        .ok();
                    last_advertisement = Utc::now().timestamp();
                }
            }
            Ok(None) => {}
            Err(err) => {
                if err.is_permission() {
                    return Err(err).context("bluetooth permission lost while scanning");
                }
                tracing::warn!(error=%err, "advertisement stream error");
            }
        }

        if now - last_advertisement > MAX_ADVERTISEMENT_SILENCE {
            tracing::warn!(
                minutes = MAX_ADVERTISEMENT_SILENCE / 60,
                "no advertisements; restarting scan with next timing"
            );
            restart_scan(&mut transport, config, state, &mut timing)
                .await
                .ok();
            last_advertisement = Utc::now().timestamp();
        }

        if now - last_flush > config.log_write_seconds as i64 {
            last_flush = now;
            if let Err(err) = logfile::flush_pending(state, config.log_dir.as_deref()) {
                tracing::warn!(error=%err, "log flush failed");
            }
            if let Some(cache_dir) = &config.cache_dir {
                if let Err(err) = logfile::write_cache_files(cache_dir, &state.mrtg) {
                    tracing::warn!(error=%err, "cache write failed");
                }
            }
        }

        if now - last_render > DAY_SAMPLE {
            last_render = now;
            if let Some(path) = &config.titlemap {
                titles.refresh(path);
            }
            if let Some(svg_dir) = &config.svg_dir {
                svg::write_all(svg_dir, state, &titles);
            }
        }
    }

    tracing::info!("shutting down; flushing queues");
    logfile::flush_pending(state, config.log_dir.as_deref()).ok();
    if let Some(cache_dir) = &config.cache_dir {
        logfile::write_cache_files(cache_dir, &state.mrtg).ok();
    }
    transport.shutdown().await.ok();
    Ok(())
}

/// Apply the whitelist and (re)start scanning with the next timing pair.
async fn restart_scan<T: Transport>(
    transport: &mut T,
    config: &Config,
    state: &AcquisitionState,
    timing: &mut TimingRotation,
) -> Result<(), TransportError> {
    // A single FF:FF:FF:FF:FF:FF entry means "everything the aggregator
    // already knows".
    let whitelist: Vec<BdAddr> = if config.whitelist.first() == Some(&ADDR_ALL) {
        state.mrtg.keys().copied().collect()
    } else {
        config.whitelist.clone()
    };
    if whitelist.is_empty() {
        transport.clear_whitelist().await?;
    } else {
        tracing::debug!(devices = whitelist.len(), "applying address filter");
        transport.set_whitelist(&whitelist).await?;
    }

    let (interval, window) = timing.advance();
    transport
        .start_scan(&ScanParams {
            active: !config.passive_scan,
            interval,
            window,
            whitelist_only: !whitelist.is_empty(),
            filter_duplicates: false,
        })
        .await
}

/// Feed one advertisement through the decoder. Returns an address due for
/// a history download.
fn handle_advertisement(
    state: &mut AcquisitionState,
    config: &Config,
    advertisement: &crate::transport::Advertisement,
    now: i64,
) -> Option<BdAddr> {
    let address = advertisement.address;
    // BlueZ sometimes surfaces the model service UUID only as a service
    // data key, so both UUID lists feed the hint.
    let mut uuids = advertisement.service_uuids.clone();
    uuids.extend(advertisement.service_data.iter().map(|(uuid, _)| *uuid));
    let hint = decode::model_hint(advertisement.name.as_deref(), &uuids);
    if hint != DeviceModel::Unknown {
        state.register_model(address, hint);
    }

    let mut decoded = false;
    let mut telemetry_block_seen = false;
    for (manufacturer, payload) in &advertisement.manufacturer_data {
        let Some(mut reading) = decode::decode(
            *manufacturer,
            payload,
            advertisement.name.as_deref(),
            &uuids,
            now,
        ) else {
            continue;
        };
        telemetry_block_seen = true;
        if reading.model == DeviceModel::Unknown {
            reading.model = state.model_of(&address);
        }
        if !reading.is_valid() {
            tracing::debug!(
                %address,
                manufacturer = format!("{manufacturer:#06x}"),
                length = payload.len(),
                "decode rejected"
            );
            continue;
        }
        state.register_model(address, reading.model);
        state.accept_reading(address, reading);
        tracing::debug!(
            %address,
            random = advertisement.random_address,
            rssi = advertisement.rssi,
            temperature = reading.temperature[0],
            humidity = reading.humidity,
            battery = reading.battery,
            model = %reading.model,
            "reading"
        );
        decoded = true;
    }

    if !decoded && !telemetry_block_seen {
        for (manufacturer, payload) in &advertisement.manufacturer_data {
            if let Some(summary) = decode::beacon_summary(*manufacturer, payload) {
                tracing::debug!(%address, rssi = advertisement.rssi, "{summary}");
            }
        }
    }

    if !decoded || config.download_days == 0 || config.log_dir.is_none() {
        return None;
    }
    if state.model_of(&address) == DeviceModel::Unknown {
        return None;
    }
    let last = state.last_download.get(&address).copied().unwrap_or(0);
    let due = now - last > 60 * 60 * 24 * config.download_days as i64;
    due.then_some(address)
}

/// One serialized download session: scanning is already paused, and the
/// caller restarts it afterwards.
async fn run_download<T: Transport>(
    transport: &mut T,
    state: &mut AcquisitionState,
    address: BdAddr,
    now: i64,
    shutdown: &watch::Receiver<bool>,
) {
    transport.stop_scan().await.ok();
    tracing::info!(%address, "starting history download");

    let mut session = match transport.connect(address, CONNECT_TIMEOUT).await {
        Ok(session) => session,
        Err(err) => {
            tracing::info!(%address, error=%err, "connect failed; will retry next interval");
            return;
        }
    };

    let model = state.model_of(&address);
    let battery = state.battery_of(&address);
    let last = state.last_download.get(&address).copied().unwrap_or(0);
    match downloader::download_history(&mut session, model, last, battery, now, shutdown).await {
        Ok(outcome) => {
            let received = outcome.samples.len();
            for sample in outcome.samples {
                state.accept_history(address, sample);
            }
            // Only a session that produced data advances the bookmark;
            // an empty one retries at the next qualifying advertisement.
            if received > 0 {
                state.last_download.insert(address, outcome.download_time);
            }
            if outcome.stalled {
                tracing::warn!(%address, received, "download stalled; keeping partial data");
            }
        }
        Err(DownloadError::ServiceNotFound) => {
            tracing::info!(%address, "device has no history service");
        }
        Err(DownloadError::Transport(err)) => {
            tracing::warn!(%address, error=%err, "download failed");
        }
    }
    session.disconnect().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Advertisement;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            log_dir: Some(PathBuf::from("/tmp/logs")),
            cache_dir: None,
            svg_dir: None,
            titlemap: None,
            log_write_seconds: 60,
            minutes_average: 5,
            download_days: 1,
            passive_scan: false,
            whitelist: Vec::new(),
            adapter: None,
            use_hci: false,
            monitor_only: false,
            query: None,
        }
    }

    fn h5075_advertisement() -> Advertisement {
        Advertisement {
            address: "A4:C1:38:37:BC:AE".parse().unwrap(),
            random_address: false,
            rssi: Some(-58),
            name: Some(String::from("GVH5075_BCAE")),
            service_uuids: Vec::new(),
            manufacturer_data: vec![(0xEC88, vec![0x00, 0x04, 0x18, 0x87, 0x61, 0x00])],
            service_data: Vec::new(),
        }
    }

    #[test]
    fn timing_rotation_cycles() {
        let mut rotation = TimingRotation::new();
        let mut seen = Vec::new();
        for _ in 0..SCAN_TIMING.len() + 1 {
            seen.push(rotation.advance());
        }
        assert_eq!(seen[0], (18, 18));
        assert_eq!(seen[1], (8000, 800));
        assert_eq!(seen[SCAN_TIMING.len()], (18, 18));
    }

    #[test]
    fn advertisement_feeds_state_and_schedules_download() {
        let config = test_config();
        let mut state = AcquisitionState::new();
        let adv = h5075_advertisement();
        let candidate = handle_advertisement(&mut state, &config, &adv, 1_700_000_000);
        assert_eq!(candidate, Some(adv.address));
        assert_eq!(state.model_of(&adv.address), DeviceModel::H5075);
        assert_eq!(state.pending_total(), 1);
        assert!(state.mrtg.contains_key(&adv.address));
    }

    #[test]
    fn download_not_scheduled_when_recent() {
        let config = test_config();
        let mut state = AcquisitionState::new();
        let adv = h5075_advertisement();
        state
            .last_download
            .insert(adv.address, 1_700_000_000 - 3600);
        let candidate = handle_advertisement(&mut state, &config, &adv, 1_700_000_000);
        assert_eq!(candidate, None);
        // The reading itself was still recorded.
        assert_eq!(state.pending_total(), 1);
    }

    #[test]
    fn download_disabled_without_log_dir() {
        let mut config = test_config();
        config.log_dir = None;
        let mut state = AcquisitionState::new();
        let adv = h5075_advertisement();
        assert_eq!(
            handle_advertisement(&mut state, &config, &adv, 1_700_000_000),
            None
        );
    }

    #[test]
    fn unknown_model_is_not_downloaded() {
        let config = test_config();
        let mut state = AcquisitionState::new();
        let mut adv = h5075_advertisement();
        adv.name = None;
        // 0x0001 format without a name: decodes but stays Unknown.
        adv.manufacturer_data = vec![(0x0001, vec![0x01, 0x01, 0x04, 0x24, 0x5D, 0x54])];
        assert_eq!(
            handle_advertisement(&mut state, &config, &adv, 1_700_000_000),
            None
        );
        assert_eq!(state.pending_total(), 0);
    }

    #[test]
    fn apple_only_advertisement_is_ignored() {
        let config = test_config();
        let mut state = AcquisitionState::new();
        let mut payload = vec![0x02, 0x15];
        payload.extend_from_slice(b"INTELLI_ROCKS_HW");
        payload.extend_from_slice(&[0x50, 0x75, 0xF2, 0xFF, 0xC2]);
        let adv = Advertisement {
            address: "A4:C1:38:37:BC:AE".parse().unwrap(),
            manufacturer_data: vec![(0x004C, payload)],
            ..Advertisement::default()
        };
        assert_eq!(
            handle_advertisement(&mut state, &config, &adv, 1_700_000_000),
            None
        );
        assert_eq!(state.pending_total(), 0);
    }
}
