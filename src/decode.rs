use crate::model::{uuid16, DeviceModel};
use crate::reading::Reading;
use uuid::Uuid;

const APPLE_MANUFACTURER: u16 = 0x004C;

/// Decode one manufacturer-specific advertisement block into a reading.
///
/// The decoder is a pure function of its inputs: the advertised name and
/// service UUIDs pin the model where they can, then the manufacturer id and
/// payload length select the wire format. `None` means the block is not
/// telemetry we understand; a returned reading may still be invalid (out of
/// range, or no model could be determined) and is dropped by the caller.
pub fn decode(
    manufacturer: u16,
    payload: &[u8],
    name: Option<&str>,
    uuids: &[Uuid],
    now: i64,
) -> Option<Reading> {
    let hint = model_hint(name, uuids);
    match (manufacturer, payload.len()) {
        (0xEC88, 7) => Some(decode_h5074(payload, hint, now)),
        (0xEC88, 6) => Some(decode_h5075(payload, hint, now)),
        (0x0001, 6) => Some(decode_packed_centi(payload, hint, now)),
        (0xEC88, 9) => Some(decode_h5179(payload, hint, now)),
        (APPLE_MANUFACTURER, _) => None,
        // The meat thermometers put part of their bluetooth address where
        // the manufacturer id normally goes, so only the length is usable.
        (_, 14) => Some(decode_single_probe(payload, hint, now)),
        (_, 17) => Some(decode_dual_probe(payload, hint, now)),
        (_, 20) => Some(decode_six_probe(payload, hint, now)),
        _ => None,
    }
}

/// Model pinned by the advertised local name or service UUID list, if any.
pub fn model_hint(name: Option<&str>, uuids: &[Uuid]) -> DeviceModel {
    if let Some(name) = name {
        let model = DeviceModel::from_name(name);
        if model != DeviceModel::Unknown {
            return model;
        }
    }
    for uuid in uuids {
        if let Some(short) = uuid16(uuid) {
            let model = DeviceModel::from_service_uuid16(short);
            if model != DeviceModel::Unknown {
                return model;
            }
        }
    }
    DeviceModel::Unknown
}

fn i16_le(payload: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn i16_be(payload: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn u16_le(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

/// 24-bit big-endian packed temperature/humidity. The sign lives in bit 23
/// and the mask below clears bits 19..23 along with it; the mask width is a
/// long-standing quirk of the format that deployed decoders agree on, so it
/// stays at 19 bits.
pub fn unpack_signed(payload: &[u8], offset: usize) -> (u32, bool) {
    let raw = (payload[offset] as u32) << 16
        | (payload[offset + 1] as u32) << 8
        | payload[offset + 2] as u32;
    let negative = raw & 0x80_0000 != 0;
    (raw & 0x7FFFF, negative)
}

/// One 3-byte history-stream sample: the same 24-bit packing as the
/// advertisements, decoded at full fractional precision.
pub fn unpack_history_sample(bytes: &[u8]) -> (f64, f64) {
    let (value, negative) = unpack_signed(bytes, 0);
    let mut temperature = f64::from(value) / 10000.0;
    if negative {
        temperature = -temperature;
    }
    let humidity = f64::from(value % 1000) / 10.0;
    (temperature, humidity)
}

fn decode_h5074(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let mut reading = Reading::new(
        now,
        f64::from(i16_le(payload, 1)) / 100.0,
        f64::from(u16_le(payload, 3)) / 100.0,
        i32::from(payload[5]),
    );
    reading.model = if hint != DeviceModel::Unknown {
        hint
    } else {
        DeviceModel::H5074
    };
    check_operating_range(&mut reading);
    reading
}

fn decode_h5075(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let (value, negative) = unpack_signed(payload, 1);
    // Integer division first: the three leading decimal digits are tenths
    // of a degree, the trailing three are tenths of a percent.
    let mut temperature = f64::from(value / 1000) / 10.0;
    if negative {
        temperature = -temperature;
    }
    let humidity = f64::from(value % 1000) / 10.0;
    let mut reading = Reading::new(now, temperature, humidity, i32::from(payload[4]));
    reading.model = if hint != DeviceModel::Unknown {
        hint
    } else {
        DeviceModel::H5075
    };
    check_operating_range(&mut reading);
    reading
}

/// Manufacturer id 0x0001, shared by the H5100/H5174/H5177 family. Same
/// packing as the H5075 but with full fractional precision, and the model
/// comes only from the advertised name.
fn decode_packed_centi(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let (value, negative) = unpack_signed(payload, 2);
    let mut temperature = f64::from(value) / 10000.0;
    if negative {
        temperature = -temperature;
    }
    let humidity = f64::from(value % 1000) / 10.0;
    let mut reading = Reading::new(now, temperature, humidity, i32::from(payload[5]));
    reading.model = hint;
    check_operating_range(&mut reading);
    reading
}

fn decode_h5179(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let mut reading = Reading::new(
        now,
        f64::from(i16_le(payload, 4)) / 100.0,
        f64::from(u16_le(payload, 6)) / 100.0,
        i32::from(payload[8]),
    );
    reading.model = if hint != DeviceModel::Unknown {
        hint
    } else {
        DeviceModel::H5179
    };
    check_operating_range(&mut reading);
    reading
}

fn decode_single_probe(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let mut reading = meat_reading(now, i32::from(payload[5] & 0x7F), hint, DeviceModel::H5183);
    reading.temperature[0] = f64::from(i16_be(payload, 8)) / 100.0;
    reading.temperature[1] = f64::from(i16_be(payload, 10)) / 100.0; // alarm set-point
    seal_channels(&mut reading);
    reading
}

fn decode_dual_probe(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let mut reading = meat_reading(now, i32::from(payload[5] & 0x7F), hint, DeviceModel::H5182);
    reading.temperature[0] = f64::from(i16_be(payload, 8)) / 100.0;
    reading.temperature[1] = f64::from(i16_be(payload, 10)) / 100.0;
    reading.temperature[2] = f64::from(i16_be(payload, 13)) / 100.0;
    reading.temperature[3] = f64::from(i16_be(payload, 15)) / 100.0;
    seal_channels(&mut reading);
    reading
}

/// H5055: two probes per advertisement out of six; the device cycles which
/// pair it sends and nothing in the payload we decode says which, so the
/// channels simply carry whatever arrived. Temperatures are whole degrees,
/// channels 1 and 3 are the high-alarm set-points.
fn decode_six_probe(payload: &[u8], hint: DeviceModel, now: i64) -> Reading {
    let mut reading = meat_reading(now, i32::from(payload[2]), hint, DeviceModel::H5055);
    reading.temperature[0] = f64::from(i16_le(payload, 5));
    reading.temperature[1] = f64::from(i16_le(payload, 9));
    reading.temperature[2] = f64::from(i16_le(payload, 12));
    reading.temperature[3] = f64::from(i16_le(payload, 16));
    seal_channels(&mut reading);
    reading
}

fn meat_reading(now: i64, battery: i32, hint: DeviceModel, fallback: DeviceModel) -> Reading {
    let mut reading = Reading::new(now, 0.0, 0.0, battery);
    reading.model = if hint != DeviceModel::Unknown {
        hint
    } else {
        fallback
    };
    reading
}

fn seal_channels(reading: &mut Reading) {
    for i in 0..reading.temperature.len() {
        reading.temperature_min[i] = reading.temperature[i];
        reading.temperature_max[i] = reading.temperature[i];
    }
}

/// The hygrometer models are specified for -20..60 C; anything outside is a
/// decode artifact and invalidates the sample. The probe thermometers read
/// to 300 C and are exempt.
fn check_operating_range(reading: &mut Reading) {
    if reading.temperature[0] < -20.0 || reading.temperature[0] > 60.0 {
        reading.averages = 0;
    }
}

/// Human-readable summary of an Apple iBeacon block, for diagnostics when
/// a device advertises nothing but vendor beacons.
pub fn beacon_summary(manufacturer: u16, payload: &[u8]) -> Option<String> {
    if manufacturer != APPLE_MANUFACTURER {
        return None;
    }
    if payload.len() < 23 || payload[0] != 0x02 || payload[1] != 0x15 {
        return Some(String::from("(Apple)"));
    }
    let uuid = Uuid::from_slice(&payload[2..18]).ok()?;
    Some(format!(
        "(Apple) (iBeacon) (UUID) {} (Major) {:02X}{:02X} (Minor) {:02X}{:02X} (RSSI) {:02X}",
        uuid, payload[18], payload[19], payload[20], payload[21], payload[22]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h5075_advertisement() {
        let payload = [0x00, 0x04, 0x18, 0x87, 0x61, 0x00];
        let reading = decode(0xEC88, &payload, Some("GVH5075_BCAE"), &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5075);
        assert!((reading.temperature[0] - 26.8).abs() < 1e-9);
        assert!((reading.humidity - 42.3).abs() < 1e-9);
        assert_eq!(reading.battery, 97);
        assert!(reading.is_valid());
        assert_eq!(reading.time, 1000);
    }

    #[test]
    fn h5074_advertisement() {
        let payload = [0x00, 0xF8, 0x09, 0x9F, 0x1C, 0x64, 0x02];
        let reading = decode(0xEC88, &payload, Some("Govee_H5074_5C0F"), &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5074);
        assert!((reading.temperature[0] - 25.52).abs() < 1e-9);
        assert!((reading.humidity - 73.27).abs() < 1e-9);
        assert_eq!(reading.battery, 100);
        assert!(reading.is_valid());
    }

    #[test]
    fn h5074_defaults_model_without_name() {
        let payload = [0x00, 0xF8, 0x09, 0x9F, 0x1C, 0x64, 0x02];
        let reading = decode(0xEC88, &payload, None, &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5074);
    }

    #[test]
    fn h5177_advertisement() {
        let payload = [0x01, 0x01, 0x04, 0x24, 0x5D, 0x54];
        let reading = decode(0x0001, &payload, Some("GVH5177_3B10"), &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5177);
        assert!((reading.temperature[0] - 27.1453).abs() < 1e-9);
        assert!((reading.humidity - 45.3).abs() < 1e-9);
        assert_eq!(reading.battery, 84);
    }

    #[test]
    fn packed_format_without_name_is_invalid() {
        let payload = [0x01, 0x01, 0x04, 0x24, 0x5D, 0x54];
        let reading = decode(0x0001, &payload, None, &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::Unknown);
        assert!(!reading.is_valid());
    }

    #[test]
    fn h5179_advertisement() {
        // 0101 0A0A B018 64 -> 25.7 C, 63.2 %, 100 %
        let payload = [0x01, 0x01, 0x01, 0x01, 0x0A, 0x0A, 0xB0, 0x18, 0x64];
        let reading = decode(0xEC88, &payload, None, &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5179);
        assert!((reading.temperature[0] - 25.7).abs() < 1e-9);
        assert!((reading.humidity - 63.2).abs() < 1e-9);
        assert_eq!(reading.battery, 100);
    }

    #[test]
    fn h5182_dual_probe() {
        let payload = [
            0x27, 0x01, 0x00, 0x01, 0x01, 0xE4, 0x01, 0x80, 0x08, 0x34, 0x1C, 0xDC, 0x80, 0x08,
            0x34, 0x1C, 0xDC,
        ];
        let uuid: Uuid = "00008251-0000-1000-8000-00805f9b34fb".parse().unwrap();
        let reading = decode(0x1330, &payload, None, &[uuid], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5182);
        assert!((reading.temperature[0] - 21.0).abs() < 1e-9);
        assert!((reading.temperature[1] - 73.88).abs() < 1e-9);
        assert!((reading.temperature[2] - 21.0).abs() < 1e-9);
        assert!((reading.temperature[3] - 73.88).abs() < 1e-9);
        assert_eq!(reading.battery, 100);
        assert!(reading.is_valid());
    }

    #[test]
    fn h5183_single_probe() {
        let payload = [
            0xB4, 0x01, 0x00, 0x01, 0x01, 0xE4, 0x00, 0x8B, 0x09, 0xC4, 0x26, 0x48, 0x00, 0x00,
        ];
        let reading = decode(0xA15D, &payload, None, &[], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5183);
        assert!((reading.temperature[0] - 25.0).abs() < 1e-6);
        assert!((reading.temperature[1] - 98.0).abs() < 1e-6);
        assert_eq!(reading.battery, 100);
    }

    #[test]
    fn h5055_probe_pair() {
        let payload = [
            0xA4, 0x00, 0x64, 0x01, 0x00, 0x1A, 0x00, 0xFF, 0xFF, 0x31, 0x00, 0x01, 0xFF, 0xFF,
            0xFF, 0xFF, 0x36, 0x00, 0x00, 0x00,
        ];
        let uuid: Uuid = "00005550-0000-1000-8000-00805f9b34fb".parse().unwrap();
        let reading = decode(0x8B85, &payload, None, &[uuid], 1000).unwrap();
        assert_eq!(reading.model, DeviceModel::H5055);
        assert!((reading.temperature[0] - 26.0).abs() < 1e-9); // 0x001A
        assert!((reading.temperature[1] - 49.0).abs() < 1e-9); // 0x0031 high alarm
        assert!((reading.temperature[2] - (-1.0)).abs() < 1e-9); // 0xFFFF, probe absent
        assert!((reading.temperature[3] - 54.0).abs() < 1e-9); // 0x0036
        assert_eq!(reading.battery, 100);
    }

    #[test]
    fn apple_blocks_are_rejected() {
        let payload = [0x02, 0x15, 0x49, 0x4E];
        assert!(decode(0x004C, &payload, None, &[], 1000).is_none());
    }

    #[test]
    fn unknown_length_is_rejected() {
        assert!(decode(0xEC88, &[0x00; 11], None, &[], 1000).is_none());
    }

    #[test]
    fn out_of_range_temperature_invalidates() {
        // -30.5 C, 40 %: 30.5 -> 305, packed as 305*1000 + 400 with sign bit.
        let packed: u32 = 305 * 1000 + 400;
        let payload = [
            0x00,
            0x80 | ((packed >> 16) as u8),
            (packed >> 8) as u8,
            packed as u8,
            0x50,
            0x00,
        ];
        let reading = decode(0xEC88, &payload, Some("GVH5075_TEST"), &[], 1000).unwrap();
        assert!(reading.temperature[0] < -20.0);
        assert!(!reading.is_valid());
    }

    #[test]
    fn decoder_is_pure() {
        let payload = [0x00, 0x04, 0x18, 0x87, 0x61, 0x00];
        let a = decode(0xEC88, &payload, Some("GVH5075_BCAE"), &[], 42).unwrap();
        let b = decode(0xEC88, &payload, Some("GVH5075_BCAE"), &[], 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_mask_quirk_is_preserved() {
        // Bit 20 set survives neither the sign bit nor the value: the
        // 19-bit mask clears it.
        let payload = [0x00, 0x08, 0x00, 0x64, 0x50, 0x00];
        let (value, negative) = unpack_signed(&payload, 1);
        assert!(!negative);
        assert_eq!(value, 0x64); // 0x080064 & 0x7FFFF
    }

    #[test]
    fn ibeacon_summary_is_produced() {
        let mut payload = vec![0x02, 0x15];
        payload.extend_from_slice(b"INTELLI_ROCKS_HW");
        payload.extend_from_slice(&[0x50, 0x75, 0xF2, 0xFF, 0xC2]);
        let summary = beacon_summary(0x004C, &payload).unwrap();
        assert!(summary.contains("iBeacon"));
        assert!(summary.contains("(Major) 5075"));
    }
}
