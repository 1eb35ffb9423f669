use crate::address::BdAddr;
use crate::model::DeviceModel;
use crate::mrtg::MrtgSeries;
use crate::reading::{format_iso8601, parse_iso8601, utc_year_month, Reading};
use crate::state::AcquisitionState;
use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const PERSISTENCE_FILE: &str = "gvh-thermometer-types.txt";
const LEGACY_DOWNLOAD_FILE: &str = "gvh-lastdownload.txt";
const LEGACY_TYPES_CACHE_FILE: &str = "gvh-types-cache.txt";

pub fn producer_version() -> String {
    format!("govee-logger/{}", env!("CARGO_PKG_VERSION"))
}

fn address_in_text(text: &str) -> Option<BdAddr> {
    static COLONED: OnceLock<Regex> = OnceLock::new();
    let pattern = COLONED
        .get_or_init(|| Regex::new("(?:[[:xdigit:]]{2}:){5}[[:xdigit:]]{2}").expect("address pattern"));
    pattern.find(text)?.as_str().parse().ok()
}

/// `{log_dir}/gvh-{12 hex}-{YYYY}-{MM}.txt`, month taken from the reading
/// time in UTC (current month when `time` is zero).
pub fn log_file_path(log_dir: &Path, address: &BdAddr, time: i64) -> PathBuf {
    let stamp = if time == 0 { Utc::now().timestamp() } else { time };
    let (year, month) = utc_year_month(stamp);
    log_dir.join(format!("gvh-{}-{year}-{month:02}.txt", address.to_hex()))
}

pub fn cache_file_path(cache_dir: &Path, address: &BdAddr) -> PathBuf {
    cache_dir.join(format!("gvh-{}-cache.txt", address.to_hex()))
}

/// Set a file's mtime so directory listings sort by data recency.
fn set_file_mtime(path: &Path, time: i64) {
    let Ok(cpath) = CString::new(path.as_os_str().to_string_lossy().as_bytes().to_vec()) else {
        return;
    };
    let times = [
        libc::timeval {
            tv_sec: time as libc::time_t,
            tv_usec: 0,
        },
        libc::timeval {
            tv_sec: time as libc::time_t,
            tv_usec: 0,
        },
    ];
    unsafe {
        libc::utimes(cpath.as_ptr(), times.as_ptr());
    }
}

fn file_mtime(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Append all pending readings to their per-device monthly log files and
/// rewrite the persistence file. Without a log directory the queues are
/// simply discarded.
pub fn flush_pending(state: &mut AcquisitionState, log_dir: Option<&Path>) -> Result<bool> {
    let Some(log_dir) = log_dir else {
        for queue in state.pending.values_mut() {
            queue.clear();
        }
        return Ok(false);
    };

    let mut wrote = false;
    for (address, queue) in state.pending.iter_mut() {
        if queue.is_empty() {
            continue;
        }
        let path = log_file_path(log_dir, address, queue.front().map(|r| r.time).unwrap_or(0));
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut most_recent = 0i64;
        while let Some(reading) = queue.pop_front() {
            writeln!(file, "{}", reading.to_log_line())?;
            most_recent = most_recent.max(reading.time);
        }
        drop(file);
        set_file_mtime(&path, most_recent);
        tracing::debug!(path=%path.display(), "wrote log file");
        wrote = true;
    }
    write_persistence(log_dir, &state.thermometers, &state.last_download)?;
    Ok(wrote)
}

/// One line per device: address, model label, optional last-download
/// timestamp. File mtime tracks the newest download.
pub fn write_persistence(
    log_dir: &Path,
    thermometers: &BTreeMap<BdAddr, DeviceModel>,
    last_download: &BTreeMap<BdAddr, i64>,
) -> Result<()> {
    if thermometers.is_empty() {
        return Ok(());
    }
    let path = log_dir.join(PERSISTENCE_FILE);
    let mut contents = String::new();
    let mut most_recent = 0i64;
    for (address, model) in thermometers {
        contents.push_str(&format!("{address}\t{model}"));
        if let Some(time) = last_download.get(address) {
            contents.push_str(&format!("\t{}", format_iso8601(*time)));
            most_recent = most_recent.max(*time);
        }
        contents.push('\n');
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    if most_recent > 0 {
        set_file_mtime(&path, most_recent);
    }
    Ok(())
}

/// Read the persistence file plus its two deprecated predecessors (the
/// types cache that used to live in the cache directory, and the separate
/// last-download file).
pub fn read_persistence(
    log_dir: Option<&Path>,
    cache_dir: Option<&Path>,
    thermometers: &mut BTreeMap<BdAddr, DeviceModel>,
    last_download: &mut BTreeMap<BdAddr, i64>,
) {
    if let Some(cache_dir) = cache_dir {
        let legacy = cache_dir.join(LEGACY_TYPES_CACHE_FILE);
        if let Ok(contents) = fs::read_to_string(&legacy) {
            tracing::info!(path=%legacy.display(), "reading deprecated types cache");
            for line in contents.lines() {
                if let Some(address) = address_in_text(line) {
                    let rest = line.splitn(2, char::is_whitespace).nth(1).unwrap_or("");
                    thermometers.insert(address, DeviceModel::from_name(rest.trim()));
                }
            }
        }
    }
    let Some(log_dir) = log_dir else { return };

    let legacy = log_dir.join(LEGACY_DOWNLOAD_FILE);
    if let Ok(contents) = fs::read_to_string(&legacy) {
        tracing::info!(path=%legacy.display(), "reading deprecated download times");
        for line in contents.lines() {
            if let Some(address) = address_in_text(line) {
                let rest = line.splitn(2, char::is_whitespace).nth(1).unwrap_or("");
                if let Some(time) = parse_iso8601(rest) {
                    last_download.insert(address, time);
                }
            }
        }
    }

    let path = log_dir.join(PERSISTENCE_FILE);
    if let Ok(contents) = fs::read_to_string(&path) {
        tracing::info!(path=%path.display(), "reading persistence file");
        for line in contents.lines() {
            let Some(address) = address_in_text(line) else {
                continue;
            };
            let mut fields = line.split_whitespace().skip(1);
            if let Some(label) = fields.next() {
                thermometers.insert(address, DeviceModel::from_name(label));
            }
            if let Some(stamp) = fields.next() {
                if let Some(time) = parse_iso8601(stamp) {
                    last_download.insert(address, time);
                }
            }
        }
    }
}

/// Rewrite each device's cache file when the in-memory series has grown
/// more than an hour past what is on disk.
pub fn write_cache_files(cache_dir: &Path, mrtg: &BTreeMap<BdAddr, MrtgSeries>) -> Result<()> {
    for (address, series) in mrtg {
        let Some(current) = series.current() else {
            continue;
        };
        let path = cache_file_path(cache_dir, address);
        if current.time - file_mtime(&path) <= 60 * 60 {
            continue;
        }
        let mut out = String::new();
        out.push_str(&format!("Cache: {address} {}\n", producer_version()));
        for slot in series.slots() {
            out.push_str(&slot.to_cache_line());
            out.push('\n');
        }
        fs::write(&path, out).with_context(|| format!("write {}", path.display()))?;
        set_file_mtime(&path, current.time);
        tracing::info!(path=%path.display(), "wrote cache file");
    }
    Ok(())
}

/// Load every cache file in the directory into per-device series. Entries
/// whose model the cache lines do not carry fall back to the registry.
pub fn read_cache_dir(
    cache_dir: &Path,
    thermometers: &BTreeMap<BdAddr, DeviceModel>,
) -> BTreeMap<BdAddr, MrtgSeries> {
    static CACHE_NAME: OnceLock<Regex> = OnceLock::new();
    let name_pattern = CACHE_NAME
        .get_or_init(|| Regex::new("^gvh-[[:xdigit:]]{12}-cache.txt$").expect("cache pattern"));

    let mut result = BTreeMap::new();
    let Ok(entries) = fs::read_dir(cache_dir) else {
        return result;
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name_pattern.is_match(name))
        })
        .collect();
    files.sort();

    for path in files {
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        tracing::info!(path=%path.display(), "reading cache file");
        let mut lines = BufReader::new(file).lines();
        let Some(Ok(header)) = lines.next() else {
            continue;
        };
        if !header.starts_with("Cache: ") {
            continue;
        }
        let Some(address) = address_in_text(&header) else {
            continue;
        };
        let registry_model = thermometers
            .get(&address)
            .copied()
            .unwrap_or(DeviceModel::Unknown);
        let mut slots = Vec::new();
        for line in lines.flatten() {
            let Some(mut reading) = Reading::from_cache_line(&line) else {
                continue;
            };
            if reading.model == DeviceModel::Unknown {
                reading.model = registry_model;
            }
            slots.push(reading);
        }
        match MrtgSeries::from_slots(slots) {
            Some(series) => {
                result.insert(address, series);
            }
            None => tracing::warn!(path=%path.display(), "cache file has wrong slot count; ignored"),
        }
    }
    result
}

/// Replay one monthly log file into the aggregator. Lines are sorted first:
/// history downloads append out of chronological order.
pub fn replay_log_file(path: &Path, state: &mut AcquisitionState) {
    let Some(address) = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(hex12_in_text)
    else {
        return;
    };

    // Skip files older than what the rings already hold.
    if let Some(series) = state.mrtg.get(&address) {
        if let Some(current) = series.current() {
            if file_mtime(path) < current.time {
                return;
            }
        }
    }

    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    tracing::info!(path=%path.display(), "reading log file");
    let registry_model = state.model_of(&address);
    let now = Utc::now().timestamp();
    let mut lines: Vec<&str> = contents.lines().collect();
    lines.sort_unstable();
    for line in lines {
        let Some(mut reading) = Reading::from_log_line(line, now) else {
            continue;
        };
        if reading.model == DeviceModel::Unknown {
            reading.model = registry_model;
        }
        if reading.is_valid() {
            state.mrtg.entry(address).or_default().update(&reading);
        }
    }
}

fn hex12_in_text(text: &str) -> Option<BdAddr> {
    static HEX12: OnceLock<Regex> = OnceLock::new();
    let pattern = HEX12.get_or_init(|| Regex::new("[[:xdigit:]]{12}").expect("hex pattern"));
    pattern.find(text)?.as_str().parse().ok()
}

fn log_files_sorted(log_dir: &Path) -> Vec<PathBuf> {
    static LOG_NAME: OnceLock<Regex> = OnceLock::new();
    let name_pattern = LOG_NAME.get_or_init(|| {
        Regex::new("^gvh-[[:xdigit:]]{12}-[[:digit:]]{4}-[[:digit:]]{2}.txt$").expect("log pattern")
    });
    let Ok(entries) = fs::read_dir(log_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name_pattern.is_match(name))
        })
        .collect();
    files.sort();
    files
}

/// Startup replay of the whole log directory, oldest files first.
pub fn replay_log_dir(log_dir: &Path, state: &mut AcquisitionState) {
    for path in log_files_sorted(log_dir) {
        replay_log_file(&path, state);
    }
}

/// Re-read log files that have grown noticeably beyond the in-memory data.
/// This is how the no-Bluetooth monitor mode picks up what another writer
/// process appends.
pub fn monitor_logged_data(log_dir: &Path, state: &mut AcquisitionState, seconds_recent: i64) {
    let addresses: Vec<BdAddr> = state.mrtg.keys().copied().collect();
    for address in addresses {
        let path = log_file_path(log_dir, &address, 0);
        let Some(current) = state.mrtg.get(&address).and_then(|s| s.current()).copied() else {
            continue;
        };
        if file_mtime(&path) > current.time + seconds_recent {
            replay_log_file(&path, state);
        }
    }
}

/// Optional `address<TAB>title` map used for chart headings. Re-read only
/// when the file's mtime advances.
#[derive(Debug, Default)]
pub struct TitleMap {
    titles: BTreeMap<BdAddr, String>,
    last_modified: i64,
}

impl TitleMap {
    pub fn refresh(&mut self, path: &Path) {
        let modified = file_mtime(path);
        if modified == 0 || modified <= self.last_modified {
            return;
        }
        let Ok(contents) = fs::read_to_string(path) else {
            return;
        };
        self.last_modified = modified;
        self.titles.clear();
        for line in contents.lines() {
            let mut fields = line.splitn(2, '\t');
            let Some(address) = fields.next().and_then(|a| a.parse().ok()) else {
                continue;
            };
            if let Some(title) = fields.next() {
                self.titles.insert(address, title.trim().to_string());
            }
        }
    }

    pub fn title_for(&self, address: &BdAddr) -> String {
        self.titles
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(text: &str) -> BdAddr {
        text.parse().unwrap()
    }

    fn valid_reading(time: i64, temp: f64) -> Reading {
        let mut reading = Reading::new(time, temp, 50.0, 88);
        reading.model = DeviceModel::H5075;
        reading
    }

    #[test]
    fn log_file_name_carries_month() {
        let a = addr("A4:C1:38:37:BC:AE");
        // 2023-11-14T22:13:20Z
        let path = log_file_path(Path::new("/logs"), &a, 1_700_000_000);
        assert_eq!(
            path,
            PathBuf::from("/logs/gvh-A4C13837BCAE-2023-11.txt")
        );
    }

    #[test]
    fn flush_appends_and_clears_queue() {
        let dir = TempDir::new().unwrap();
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.register_model(a, DeviceModel::H5075);
        state.accept_reading(a, valid_reading(1_700_000_000, 20.0));
        state.accept_reading(a, valid_reading(1_700_000_060, 21.0));

        assert!(flush_pending(&mut state, Some(dir.path())).unwrap());
        assert_eq!(state.pending_total(), 0);

        let path = log_file_path(dir.path(), &a, 1_700_000_000);
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("2023-11-14 22:13:20"));

        // A second flush with more data appends rather than truncates.
        state.accept_reading(a, valid_reading(1_700_000_120, 22.0));
        assert!(flush_pending(&mut state, Some(dir.path())).unwrap());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn flush_without_log_dir_discards() {
        let mut state = AcquisitionState::new();
        let a = addr("A4:C1:38:37:BC:AE");
        state.accept_reading(a, valid_reading(1_700_000_000, 20.0));
        assert!(!flush_pending(&mut state, None).unwrap());
        assert_eq!(state.pending_total(), 0);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let a = addr("A4:C1:38:37:BC:AE");
        let b = addr("E3:5E:CC:21:5C:0F");
        let mut thermometers = BTreeMap::new();
        thermometers.insert(a, DeviceModel::H5075);
        thermometers.insert(b, DeviceModel::H5074);
        let mut last_download = BTreeMap::new();
        last_download.insert(b, 1_700_000_000i64);

        write_persistence(dir.path(), &thermometers, &last_download).unwrap();

        let mut read_types = BTreeMap::new();
        let mut read_downloads = BTreeMap::new();
        read_persistence(
            Some(dir.path()),
            None,
            &mut read_types,
            &mut read_downloads,
        );
        assert_eq!(read_types, thermometers);
        assert_eq!(read_downloads, last_download);
    }

    #[test]
    fn legacy_download_file_is_imported() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(LEGACY_DOWNLOAD_FILE),
            "E3:5E:CC:21:5C:0F\t2023-11-14T22:13:20\n",
        )
        .unwrap();
        let mut types = BTreeMap::new();
        let mut downloads = BTreeMap::new();
        read_persistence(Some(dir.path()), None, &mut types, &mut downloads);
        assert_eq!(downloads[&addr("E3:5E:CC:21:5C:0F")], 1_700_000_000);
    }

    #[test]
    fn cache_round_trip_preserves_full_state() {
        let dir = TempDir::new().unwrap();
        let a = addr("A4:C1:38:37:BC:AE");
        let mut mrtg = BTreeMap::new();
        let mut series = MrtgSeries::new();
        for i in 0..20 {
            series.update(&valid_reading(1_700_000_000 + i * 300, 20.0 + i as f64));
        }
        mrtg.insert(a, series);

        write_cache_files(dir.path(), &mrtg).unwrap();

        let restored = read_cache_dir(dir.path(), &BTreeMap::new());
        let series = &mrtg[&a];
        let restored_series = &restored[&a];
        assert_eq!(restored_series.slots().len(), series.slots().len());
        let (orig, back) = (series.current().unwrap(), restored_series.current().unwrap());
        assert_eq!(back.time, orig.time);
        assert_eq!(back.model, orig.model);
        assert!((back.temperature_min[0] - orig.temperature_min[0]).abs() < 1e-9);
        assert!((back.temperature_max[0] - orig.temperature_max[0]).abs() < 1e-9);
    }

    #[test]
    fn cache_rewrite_skipped_when_fresh() {
        let dir = TempDir::new().unwrap();
        let a = addr("A4:C1:38:37:BC:AE");
        let mut mrtg = BTreeMap::new();
        let mut series = MrtgSeries::new();
        series.update(&valid_reading(1_700_000_000, 20.0));
        mrtg.insert(a, series);

        write_cache_files(dir.path(), &mrtg).unwrap();
        let path = cache_file_path(dir.path(), &a);
        let first = fs::read_to_string(&path).unwrap();

        // Half an hour of new data: still within the one-hour window.
        let mut series = mrtg.remove(&a).unwrap();
        series.update(&valid_reading(1_700_000_000 + 1800, 25.0));
        mrtg.insert(a, series);
        write_cache_files(dir.path(), &mrtg).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);

        // Two hours of new data forces a rewrite.
        let mut series = mrtg.remove(&a).unwrap();
        series.update(&valid_reading(1_700_000_000 + 7200, 25.0));
        mrtg.insert(a, series);
        write_cache_files(dir.path(), &mrtg).unwrap();
        assert_ne!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn replay_rebuilds_rings_from_logs() {
        let dir = TempDir::new().unwrap();
        let a = addr("A4:C1:38:37:BC:AE");
        let mut state = AcquisitionState::new();
        state.register_model(a, DeviceModel::H5075);
        for i in 0..10 {
            state.accept_reading(a, valid_reading(1_700_000_000 + i * 300, 20.0));
        }
        flush_pending(&mut state, Some(dir.path())).unwrap();

        let mut fresh = AcquisitionState::new();
        read_persistence(
            Some(dir.path()),
            None,
            &mut fresh.thermometers,
            &mut fresh.last_download,
        );
        replay_log_dir(dir.path(), &mut fresh);
        let series = &fresh.mrtg[&a];
        assert_eq!(series.current().unwrap().time, 1_700_000_000 + 9 * 300);
        assert_eq!(series.current().unwrap().model, DeviceModel::H5075);
    }

    #[test]
    fn title_map_refresh_and_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gvh-titlemap.txt");
        fs::write(&path, "A4:C1:38:37:BC:AE\tGreenhouse\n").unwrap();
        let mut titles = TitleMap::default();
        titles.refresh(&path);
        assert_eq!(titles.title_for(&addr("A4:C1:38:37:BC:AE")), "Greenhouse");
        assert_eq!(
            titles.title_for(&addr("E3:5E:CC:21:5C:0F")),
            "E3:5E:CC:21:5C:0F"
        );
    }
}
