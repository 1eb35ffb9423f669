use crate::model::DeviceModel;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};

pub const TEMPERATURE_CHANNELS: usize = 4;

/// One sensor sample. Channel 0 is the primary temperature; the remaining
/// channels carry alarm set-points and second probes on the meat
/// thermometer models. `averages` counts how many raw samples have been
/// folded in; zero marks the reading invalid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub time: i64,
    pub temperature: [f64; TEMPERATURE_CHANNELS],
    pub temperature_min: [f64; TEMPERATURE_CHANNELS],
    pub temperature_max: [f64; TEMPERATURE_CHANNELS],
    pub humidity: f64,
    pub humidity_min: f64,
    pub humidity_max: f64,
    pub battery: i32,
    pub averages: u32,
    pub model: DeviceModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
    Year,
}

pub const DAY_SAMPLE: i64 = 5 * 60;
pub const WEEK_SAMPLE: i64 = 30 * 60;
pub const MONTH_SAMPLE: i64 = 2 * 60 * 60;
pub const YEAR_SAMPLE: i64 = 24 * 60 * 60;

impl Default for Reading {
    fn default() -> Self {
        Self {
            time: 0,
            temperature: [0.0; TEMPERATURE_CHANNELS],
            temperature_min: [f64::INFINITY; TEMPERATURE_CHANNELS],
            temperature_max: [f64::NEG_INFINITY; TEMPERATURE_CHANNELS],
            humidity: 0.0,
            humidity_min: f64::INFINITY,
            humidity_max: f64::NEG_INFINITY,
            battery: i32::MAX,
            averages: 0,
            model: DeviceModel::Unknown,
        }
    }
}

impl Reading {
    /// A fresh single-sample reading on the primary channel.
    pub fn new(time: i64, temperature: f64, humidity: f64, battery: i32) -> Self {
        let mut reading = Reading {
            time,
            humidity,
            humidity_min: humidity,
            humidity_max: humidity,
            battery,
            averages: 1,
            ..Reading::default()
        };
        reading.temperature[0] = temperature;
        reading.temperature_min[0] = temperature;
        reading.temperature_max[0] = temperature;
        reading
    }

    pub fn is_valid(&self) -> bool {
        self.averages > 0 && self.model != DeviceModel::Unknown
    }

    /// Weighted merge of another reading into this one. The right-hand
    /// model wins so an empty accumulator inherits the model of its first
    /// valid contribution.
    pub fn fold(&mut self, other: &Reading) {
        if !other.is_valid() {
            return;
        }
        self.time = self.time.max(other.time);
        let total = (self.averages + other.averages) as f64;
        for i in 0..TEMPERATURE_CHANNELS {
            self.temperature[i] = (self.temperature[i] * self.averages as f64
                + other.temperature[i] * other.averages as f64)
                / total;
            self.temperature_min[i] = self.temperature_min[i]
                .min(self.temperature[i])
                .min(other.temperature_min[i]);
            self.temperature_max[i] = self.temperature_max[i]
                .max(self.temperature[i])
                .max(other.temperature_max[i]);
        }
        self.humidity = (self.humidity * self.averages as f64
            + other.humidity * other.averages as f64)
            / total;
        self.humidity_min = self.humidity_min.min(self.humidity).min(other.humidity_min);
        self.humidity_max = self.humidity_max.max(self.humidity).max(other.humidity_max);
        self.battery = self.battery.min(other.battery);
        self.averages += other.averages;
        self.model = other.model;
    }

    pub fn temperature_f(&self, channel: usize) -> f64 {
        self.temperature[channel] * 9.0 / 5.0 + 32.0
    }

    pub fn temperature_min_observed(&self, channel: usize) -> f64 {
        self.temperature[channel].min(self.temperature_min[channel])
    }

    pub fn temperature_max_observed(&self, channel: usize) -> f64 {
        self.temperature[channel].max(self.temperature_max[channel])
    }

    pub fn humidity_min_observed(&self) -> f64 {
        self.humidity.min(self.humidity_min)
    }

    pub fn humidity_max_observed(&self) -> f64 {
        self.humidity.max(self.humidity_max)
    }

    /// Classify this reading's slot by its local wall-clock time: local
    /// midnight starts a year slot, an even hour on the hour a month slot,
    /// a top or half hour a week slot, everything else a day slot.
    pub fn time_granularity(&self) -> Granularity {
        let Some(local) = Local.timestamp_opt(self.time, 0).single() else {
            return Granularity::Day;
        };
        let (hour, minute) = (local.hour(), local.minute());
        if hour == 0 && minute == 0 {
            Granularity::Year
        } else if hour % 2 == 0 && minute == 0 {
            Granularity::Month
        } else if minute == 0 || minute == 30 {
            Granularity::Week
        } else {
            Granularity::Day
        }
    }

    /// Floor the timestamp to the slot boundary of the given granularity.
    /// Year slots floor to local midnight; the rest are fixed periods.
    pub fn normalize_time(&mut self, granularity: Granularity) {
        match granularity {
            Granularity::Day => self.time = (self.time / DAY_SAMPLE) * DAY_SAMPLE,
            Granularity::Week => self.time = (self.time / WEEK_SAMPLE) * WEEK_SAMPLE,
            Granularity::Month => self.time = (self.time / MONTH_SAMPLE) * MONTH_SAMPLE,
            Granularity::Year => {
                if let Some(local) = Local.timestamp_opt(self.time, 0).single() {
                    let midnight = local.date_naive().and_hms_opt(0, 0, 0).expect("midnight");
                    if let Some(at_midnight) = Local.from_local_datetime(&midnight).single() {
                        self.time = at_midnight.timestamp();
                    }
                }
            }
        }
    }

    /// One tab-separated log line: UTC timestamp, primary temperature,
    /// humidity, battery, then the model tag and extra channels for the
    /// multi-probe models.
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "{}\t{}\t{}\t{}",
            format_timestamp(self.time),
            self.temperature[0],
            self.humidity,
            self.battery
        );
        match self.model {
            DeviceModel::H5181 | DeviceModel::H5183 => {
                line.push_str(&format!("\t{}\t{}", self.model.tag(), self.temperature[1]));
            }
            DeviceModel::H5182 | DeviceModel::H5184 | DeviceModel::H5055 => {
                line.push_str(&format!(
                    "\t{}\t{}\t{}\t{}",
                    self.model.tag(),
                    self.temperature[1],
                    self.temperature[2],
                    self.temperature[3]
                ));
            }
            _ => {}
        }
        line
    }

    /// Parse a log line written by `to_log_line`. Leading garbage (nulls
    /// left behind by interrupted writes) is skipped. Readings stamped in
    /// the future, or colder than -20 C, come back invalidated.
    pub fn from_log_line(line: &str, now: i64) -> Option<Self> {
        let start = line.find(|c: char| c.is_ascii_digit())?;
        let mut fields = line[start..].split_whitespace();
        let date = fields.next()?;
        let hour = fields.next()?;
        let time = parse_timestamp(&format!("{date} {hour}"))?;

        let mut reading = Reading {
            time,
            ..Reading::default()
        };
        reading.temperature[0] = fields.next()?.parse().ok()?;
        reading.temperature_min[0] = reading.temperature[0];
        reading.temperature_max[0] = reading.temperature[0];
        reading.humidity = fields.next()?.parse().ok()?;
        reading.humidity_min = reading.humidity;
        reading.humidity_max = reading.humidity;
        reading.battery = fields.next()?.parse().ok()?;

        if let Some(tag) = fields.next() {
            reading.model = DeviceModel::from_log_tag(tag.parse().ok()?);
            for channel in 1..TEMPERATURE_CHANNELS {
                let Some(value) = fields.next() else { break };
                reading.temperature[channel] = value.parse().ok()?;
                reading.temperature_min[channel] = reading.temperature[channel];
                reading.temperature_max[channel] = reading.temperature[channel];
            }
        }

        if reading.time <= now {
            reading.averages = 1;
        }
        if reading.temperature[0] < -20.0 {
            reading.averages = 0;
        }
        Some(reading)
    }

    /// One tab-separated cache line carrying the full state of a slot.
    pub fn to_cache_line(&self) -> String {
        let mut line = self.time.to_string();
        for value in self.temperature {
            line.push_str(&format!("\t{value}"));
        }
        for value in self.temperature_min {
            line.push_str(&format!("\t{value}"));
        }
        for value in self.temperature_max {
            line.push_str(&format!("\t{value}"));
        }
        line.push_str(&format!(
            "\t{}\t{}\t{}\t{}\t{}\t{}",
            self.humidity,
            self.humidity_min,
            self.humidity_max,
            self.battery,
            self.averages,
            self.model
        ));
        line
    }

    pub fn from_cache_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let mut reading = Reading {
            time: fields.next()?.parse().ok()?,
            ..Reading::default()
        };
        for i in 0..TEMPERATURE_CHANNELS {
            reading.temperature[i] = fields.next()?.parse().ok()?;
        }
        for i in 0..TEMPERATURE_CHANNELS {
            reading.temperature_min[i] = fields.next()?.parse().ok()?;
        }
        for i in 0..TEMPERATURE_CHANNELS {
            reading.temperature_max[i] = fields.next()?.parse().ok()?;
        }
        reading.humidity = fields.next()?.parse().ok()?;
        reading.humidity_min = fields.next()?.parse().ok()?;
        reading.humidity_max = fields.next()?.parse().ok()?;
        reading.battery = fields.next()?.parse().ok()?;
        reading.averages = fields.next()?.parse().ok()?;
        if let Some(label) = fields.next() {
            reading.model = DeviceModel::from_name(label);
        }
        Some(reading)
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, the spreadsheet-friendly log format.
pub fn format_timestamp(time: i64) -> String {
    match Utc.timestamp_opt(time, 0).single() {
        Some(utc) => utc.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::from("1970-01-01 00:00:00"),
    }
}

pub fn parse_timestamp(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// `YYYY-MM-DDTHH:MM:SS` in UTC, used in the persistence file.
pub fn format_iso8601(time: i64) -> String {
    match Utc.timestamp_opt(time, 0).single() {
        Some(utc) => utc.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => String::from("1970-01-01T00:00:00"),
    }
}

pub fn parse_iso8601(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp())
}

/// UTC (year, month) of a timestamp, for log-file naming.
pub fn utc_year_month(time: i64) -> (i32, u32) {
    let utc: DateTime<Utc> = Utc
        .timestamp_opt(time, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch"));
    (utc.year(), utc.month())
}
