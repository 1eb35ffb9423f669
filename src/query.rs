//! Single-device query mode, MRTG's external-command contract: four lines
//! on stdout (value two, value one, uptime, target name). Temperature goes
//! out in thousandths of a degree Fahrenheit and humidity in thousandths
//! of a percent, averaged over the last N minutes of the current month's
//! log file.

use crate::address::BdAddr;
use crate::logfile::{log_file_path, read_persistence};
use crate::model::DeviceModel;
use crate::reading::Reading;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Average of log entries within the last `minutes`. Reads the tail of the
/// current month's file; entries stop counting at the first line older
/// than the window. Log lines for the hygrometer models carry no model
/// tag, so `model` supplies it from the persistence registry.
pub fn recent_average(
    log_dir: &Path,
    address: &BdAddr,
    minutes: i64,
    model: DeviceModel,
) -> Option<Reading> {
    let now = Utc::now().timestamp();
    let path = log_file_path(log_dir, address, 0);
    let contents = fs::read_to_string(path).ok()?;

    let mut sum = Reading::default();
    let mut any = false;
    for line in contents.lines().rev() {
        let Some(mut reading) = Reading::from_log_line(line, now) else {
            continue;
        };
        if now - reading.time > minutes * 60 {
            break;
        }
        if reading.model == DeviceModel::Unknown {
            reading.model = model;
        }
        sum.fold(&reading);
        any = true;
    }
    (any && sum.averages > 0).then_some(sum)
}

pub fn print_mrtg(log_dir: &Path, address: &BdAddr, minutes: i64) -> Result<()> {
    let mut thermometers = BTreeMap::new();
    let mut last_download = BTreeMap::new();
    read_persistence(Some(log_dir), None, &mut thermometers, &mut last_download);
    let model = thermometers
        .get(address)
        .copied()
        .unwrap_or(DeviceModel::H5074);

    let reading = recent_average(log_dir, address, minutes, model)
        .with_context(|| format!("no recent log data for {address}"))?;
    println!("{}", reading.humidity * 1000.0);
    println!("{}", reading.temperature_f(0) * 1000.0);
    println!(" ");
    println!("{address}");
    Ok(())
}
