//! Client for the proprietary history service.
//!
//! The sensors store roughly twenty days of one-minute samples in flash
//! behind a vendor GATT service whose 128-bit UUIDs spell out ASCII
//! `INTELLI_ROCKS_HW` (and `INTELLI_ROCKS_ 11`/`_12`/`_13`/`_14` for its
//! characteristics). A paged request on the command characteristic makes
//! the device stream the backlog as notifications on the data
//! characteristic, newest first, with a two-byte countdown in front of each
//! chunk.

use crate::decode::unpack_history_sample;
use crate::model::DeviceModel;
use crate::reading::Reading;
use crate::transport::{Characteristic, GattSession, Service, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

const VENDOR_UUID_PREFIX: &[u8; 14] = b"INTELLI_ROCKS_";
const SERVICE_SUFFIX: [u8; 2] = *b"HW";
const CHAR_COMMAND_SUFFIX: [u8; 2] = [0x20, 0x12];
const CHAR_DATA_SUFFIX: [u8; 2] = [0x20, 0x13];

/// Keepalive cadence: without an ack about every 75 notifications the
/// device stops sending mid-dump.
const KEEPALIVE_EVERY: u32 = 75;
/// Consecutive empty reads tolerated before declaring the stream stalled.
const RECEIVE_RETRIES: i32 = 4;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("history service not present on device")]
    ServiceNotFound,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
pub struct DownloadOutcome {
    /// Minute-resolution samples, in the order received (newest first).
    pub samples: Vec<Reading>,
    /// Timestamp to record as the new last-download time. Only meaningful
    /// when samples were actually received.
    pub download_time: i64,
    /// The stream died before counting down to zero.
    pub stalled: bool,
}

/// Build the 20-byte history request: opcode 0x33/0x01, big-endian count of
/// one-minute samples, a constant 0x01 at byte 5, XOR checksum in byte 19.
pub fn build_history_request(minutes: u16) -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0] = 0x33;
    request[1] = 0x01;
    request[2] = (minutes >> 8) as u8;
    request[3] = minutes as u8;
    request[5] = 0x01;
    request[19] = request[..19].iter().fold(0, |acc, byte| acc ^ byte);
    request
}

/// Ack/keepalive packet written on the command characteristic during long
/// dumps.
pub fn build_keepalive() -> [u8; 20] {
    let mut packet = [0u8; 20];
    packet[0] = 0xAA;
    packet[1] = 0x01;
    packet[19] = 0xAB;
    packet
}

fn uuid_suffix(uuid: &Uuid) -> Option<[u8; 2]> {
    let bytes = uuid.as_bytes();
    if bytes[..14] != VENDOR_UUID_PREFIX[..] {
        return None;
    }
    Some([bytes[14], bytes[15]])
}

/// Locate the vendor service and its command and data characteristics.
fn locate_history_service(
    services: &[Service],
) -> Option<(&Service, Characteristic, Characteristic)> {
    let service = services
        .iter()
        .find(|service| uuid_suffix(&service.uuid) == Some(SERVICE_SUFFIX))?;
    let mut command = None;
    let mut data = None;
    for characteristic in &service.characteristics {
        match uuid_suffix(&characteristic.uuid) {
            Some(CHAR_COMMAND_SUFFIX) => command = Some(*characteristic),
            Some(CHAR_DATA_SUFFIX) => data = Some(*characteristic),
            _ => {}
        }
    }
    Some((service, command?, data?))
}

/// Pull everything recorded since `last_download` from a connected device.
///
/// Samples are stamped backwards from the minute-aligned session start
/// using the countdown in each notification, and carry the battery level
/// of the device's most recent advertisement (the history stream itself
/// has none). A shutdown signal aborts at the next notification boundary,
/// keeping whatever was already decoded. Teardown is the caller's: on
/// return the session is still connected.
pub async fn download_history<S: GattSession>(
    session: &mut S,
    model: DeviceModel,
    last_download: i64,
    battery: i32,
    now: i64,
    shutdown: &watch::Receiver<bool>,
) -> Result<DownloadOutcome, DownloadError> {
    let services = session.discover().await.map_err(DownloadError::Transport)?;
    let Some((service, command, data)) = locate_history_service(&services) else {
        return Err(DownloadError::ServiceNotFound);
    };
    tracing::debug!(
        service_start = service.start_handle,
        command = command.handle,
        data = data.handle,
        "history service located"
    );

    // Enable notifications on the whole vendor service. Individual
    // refusals are routine (one characteristic is write-only); only a dead
    // transport stops the session.
    for characteristic in service.characteristics.clone() {
        if let Err(err) = session.enable_notifications(&characteristic).await {
            match err {
                TransportError::Io(err) => return Err(TransportError::Io(err).into()),
                refused => {
                    tracing::debug!(
                        handle = characteristic.value_handle,
                        properties = characteristic.properties,
                        error = %refused,
                        "notification enable refused"
                    );
                }
            }
        }
    }

    let download_start = (now / 60) * 60;
    let elapsed_minutes = ((download_start - last_download) / 60).max(0);
    let minutes = u16::try_from(elapsed_minutes).unwrap_or(u16::MAX);
    let request = build_history_request(minutes);
    session
        .write_request(&command, &request)
        .await
        .map_err(DownloadError::Transport)?;
    tracing::debug!(minutes, "history request issued");

    let mut samples = Vec::new();
    let mut offset: u16 = 0;
    let mut notifications: u32 = 0;
    let mut retries = RECEIVE_RETRIES;
    let mut stalled = false;

    'receive: loop {
        if *shutdown.borrow() {
            tracing::info!("shutdown requested; abandoning download at notification boundary");
            stalled = true;
            break 'receive;
        }
        let notification = session
            .next_notification(RECEIVE_TIMEOUT)
            .await
            .map_err(DownloadError::Transport)?;
        let Some((handle, value)) = notification else {
            retries -= 1;
            if retries < 0 {
                stalled = true;
                break 'receive;
            }
            tokio::time::sleep(RETRY_PAUSE).await;
            continue;
        };
        retries = RECEIVE_RETRIES;
        if handle != data.value_handle || value.len() < 2 {
            continue;
        }

        notifications += 1;
        offset = u16::from_be_bytes([value[0], value[1]]);
        // Six or fewer samples remaining means this chunk is the last.
        let final_chunk = offset < 7;
        if !final_chunk && notifications > KEEPALIVE_EVERY {
            session
                .write_request(&command, &build_keepalive())
                .await
                .map_err(DownloadError::Transport)?;
            notifications = 0;
        }

        for chunk in value[2..].chunks_exact(3) {
            if offset == 0 {
                break;
            }
            let (temperature, humidity) = unpack_history_sample(chunk);
            let mut reading = Reading::new(
                download_start - 60 * i64::from(offset),
                temperature,
                humidity,
                battery,
            );
            reading.model = model;
            samples.push(reading);
            offset -= 1;
        }

        if final_chunk {
            break 'receive;
        }
    }

    let download_time = download_start - 60 * i64::from(offset);
    if !samples.is_empty() {
        let span_start = download_time - 60 * samples.len() as i64;
        tracing::info!(
            samples = samples.len(),
            from = %crate::reading::format_timestamp(span_start),
            to = %crate::reading::format_timestamp(download_time),
            stalled,
            "history download finished"
        );
    }
    Ok(DownloadOutcome {
        samples,
        download_time,
        stalled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn history_request_layout() {
        // One hour since the last download.
        let request = build_history_request(60);
        assert_eq!(request[0], 0x33);
        assert_eq!(request[1], 0x01);
        assert_eq!(request[2], 0x00);
        assert_eq!(request[3], 0x3C);
        assert_eq!(request[4], 0x00);
        assert_eq!(request[5], 0x01);
        let xor = request[..19].iter().fold(0u8, |acc, byte| acc ^ byte);
        assert_eq!(request[19], xor);
    }

    #[test]
    fn request_checksum_xors_to_zero() {
        for minutes in [1u16, 60, 0x3DEE, u16::MAX] {
            let request = build_history_request(minutes);
            assert_eq!(request.iter().fold(0u8, |acc, byte| acc ^ byte), 0);
        }
    }

    #[test]
    fn keepalive_layout() {
        let packet = build_keepalive();
        assert_eq!(packet[0], 0xAA);
        assert_eq!(packet[1], 0x01);
        assert_eq!(&packet[2..19], &[0u8; 17]);
        assert_eq!(packet[19], 0xAB);
    }

    #[test]
    fn vendor_uuids_are_recognized() {
        let service: Uuid = Uuid::from_bytes(*b"INTELLI_ROCKS_HW");
        assert_eq!(uuid_suffix(&service), Some(*b"HW"));
        let command = Uuid::from_bytes(*b"INTELLI_ROCKS_\x20\x12");
        assert_eq!(uuid_suffix(&command), Some([0x20, 0x12]));
        let unrelated: Uuid = "00002800-0000-1000-8000-00805f9b34fb".parse().unwrap();
        assert_eq!(uuid_suffix(&unrelated), None);
    }

    fn vendor_service() -> Service {
        let mk = |suffix: [u8; 2], handle: u16| {
            let mut bytes = *b"INTELLI_ROCKS_\x00\x00";
            bytes[14] = suffix[0];
            bytes[15] = suffix[1];
            Characteristic {
                uuid: Uuid::from_bytes(bytes),
                handle,
                value_handle: handle + 1,
                properties: 0x18,
            }
        };
        Service {
            uuid: Uuid::from_bytes(*b"INTELLI_ROCKS_HW"),
            start_handle: 0x0028,
            end_handle: 0x0038,
            characteristics: vec![
                mk([0x20, 0x11], 0x0029),
                mk([0x20, 0x12], 0x002C),
                mk([0x20, 0x13], 0x0030),
            ],
        }
    }

    #[test]
    fn service_location_finds_command_and_data() {
        let services = vec![vendor_service()];
        let (_, command, data) = locate_history_service(&services).unwrap();
        assert_eq!(command.value_handle, 0x002D);
        assert_eq!(data.value_handle, 0x0031);
    }

    /// Scripted GATT session: predetermined notifications, records writes.
    struct ScriptedSession {
        services: Vec<Service>,
        notifications: VecDeque<(u16, Vec<u8>)>,
        writes: Vec<(u16, Vec<u8>)>,
    }

    impl GattSession for ScriptedSession {
        async fn discover(&mut self) -> Result<Vec<Service>, TransportError> {
            Ok(self.services.clone())
        }

        async fn enable_notifications(
            &mut self,
            _characteristic: &Characteristic,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn write_request(
            &mut self,
            characteristic: &Characteristic,
            value: &[u8],
        ) -> Result<(), TransportError> {
            self.writes.push((characteristic.value_handle, value.to_vec()));
            Ok(())
        }

        async fn next_notification(
            &mut self,
            _timeout: Duration,
        ) -> Result<Option<(u16, Vec<u8>)>, TransportError> {
            Ok(self.notifications.pop_front())
        }

        async fn disconnect(self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Pack a raw 24-bit sample value the way the device streams them.
    fn packed(value: u32) -> [u8; 3] {
        [(value >> 16) as u8, (value >> 8) as u8, value as u8]
    }

    fn notification(offset: u16, samples: &[[u8; 3]]) -> Vec<u8> {
        let mut value = offset.to_be_bytes().to_vec();
        for sample in samples {
            value.extend_from_slice(sample);
        }
        value
    }

    #[tokio::test]
    async fn download_reassembles_and_stamps_samples() {
        // 214502 decodes as 21.4502 C and 50.2 %.
        let sample = packed(214_502);
        let mut session = ScriptedSession {
            services: vec![vendor_service()],
            notifications: VecDeque::from([
                (0x0031, notification(8, &[sample, sample])),
                (0x0031, notification(6, &[sample; 6])),
            ]),
            writes: Vec::new(),
        };
        let now = 1_700_000_100; // minute aligned
        let (_tx, shutdown) = watch::channel(false);
        let outcome = download_history(&mut session, DeviceModel::H5075, now - 3600, 97, now, &shutdown)
            .await
            .unwrap();

        assert!(!outcome.stalled);
        assert_eq!(outcome.samples.len(), 8);
        // First sample sits eight minutes back, the last one minute back.
        assert_eq!(outcome.samples[0].time, now - 60 * 8);
        assert_eq!(outcome.samples.last().unwrap().time, now - 60);
        assert_eq!(outcome.download_time, now);
        for reading in &outcome.samples {
            assert_eq!(reading.model, DeviceModel::H5075);
            assert_eq!(reading.battery, 97);
            assert!((reading.temperature[0] - 21.4502).abs() < 1e-6);
            assert!((reading.humidity - 50.2).abs() < 1e-6);
        }
        // The 20-byte request went to the command characteristic.
        assert_eq!(session.writes.len(), 1);
        assert_eq!(session.writes[0].0, 0x002D);
        assert_eq!(session.writes[0].1[0], 0x33);
        assert_eq!(
            u16::from_be_bytes([session.writes[0].1[2], session.writes[0].1[3]]),
            60
        );
    }

    #[tokio::test(start_paused = true)]
    async fn download_stalls_after_retries() {
        let sample = packed(204_000);
        let mut session = ScriptedSession {
            services: vec![vendor_service()],
            notifications: VecDeque::from([(0x0031, notification(100, &[sample]))]),
            writes: Vec::new(),
        };
        let now = 1_700_000_100;
        let (_tx, shutdown) = watch::channel(false);
        let outcome = download_history(&mut session, DeviceModel::H5075, 0, 90, now, &shutdown)
            .await
            .unwrap();
        assert!(outcome.stalled);
        assert_eq!(outcome.samples.len(), 1);
        // Partial progress: the countdown stopped at 99.
        assert_eq!(outcome.download_time, now - 60 * 99);
    }

    #[tokio::test]
    async fn missing_service_is_reported() {
        let mut session = ScriptedSession {
            services: Vec::new(),
            notifications: VecDeque::new(),
            writes: Vec::new(),
        };
        let (_tx, shutdown) = watch::channel(false);
        let result =
            download_history(&mut session, DeviceModel::H5075, 0, 90, 1_700_000_000, &shutdown).await;
        assert!(matches!(result, Err(DownloadError::ServiceNotFound)));
    }

    #[tokio::test]
    async fn keepalive_issued_during_long_dump() {
        let sample = packed(204_000);
        let mut notifications = VecDeque::new();
        let total: u16 = 80;
        for i in 0..total {
            let remaining = total - i;
            notifications.push_back((0x0031u16, notification(remaining + 6, &[sample])));
        }
        notifications.push_back((0x0031, notification(6, &[sample; 6])));
        let mut session = ScriptedSession {
            services: vec![vendor_service()],
            notifications,
            writes: Vec::new(),
        };
        let (_tx, shutdown) = watch::channel(false);
        let outcome =
            download_history(&mut session, DeviceModel::H5075, 0, 90, 1_700_006_000, &shutdown)
                .await
                .unwrap();
        assert!(!outcome.stalled);
        let keepalives: Vec<_> = session
            .writes
            .iter()
            .filter(|(_, value)| value.first() == Some(&0xAA))
            .collect();
        assert_eq!(keepalives.len(), 1);
        assert_eq!(keepalives[0].1, build_keepalive().to_vec());
        assert_eq!(outcome.samples.len(), 86);
    }
}
