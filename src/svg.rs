//! Chart rendering.
//!
//! Writes one SVG per device and span from aggregator snapshots: a
//! temperature trace with its min/max band, and a humidity trace for the
//! models that measure it. Deliberately plain; anything fancier is the
//! job of whatever serves the files.

use crate::logfile::TitleMap;
use crate::mrtg::GraphSpan;
use crate::reading::Reading;
use crate::state::AcquisitionState;
use chrono::{Local, TimeZone};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const WIDTH: f64 = 500.0;
const HEIGHT: f64 = 135.0;
const MARGIN_LEFT: f64 = 40.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_TOP: f64 = 20.0;
const MARGIN_BOTTOM: f64 = 20.0;

pub fn write_all(svg_dir: &Path, state: &AcquisitionState, titles: &TitleMap) {
    for (address, series) in &state.mrtg {
        for span in GraphSpan::ALL {
            let snapshot = series.snapshot(span);
            if snapshot.len() < 2 {
                continue;
            }
            let title = format!("{} ({})", titles.title_for(address), span.name());
            let svg = render(&title, &snapshot);
            let path = svg_dir.join(format!("gvh-{}-{}.svg", address.to_hex(), span.name()));
            if let Err(err) = fs::write(&path, svg) {
                tracing::warn!(path=%path.display(), error=%err, "failed to write chart");
            }
        }
    }
}

struct Scale {
    min: f64,
    max: f64,
}

impl Scale {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            if value.is_finite() {
                min = min.min(value);
                max = max.max(value);
            }
        }
        if !min.is_finite() || !max.is_finite() {
            return None;
        }
        if (max - min).abs() < f64::EPSILON {
            // Flat data still needs a nonzero span to map onto pixels.
            min -= 1.0;
            max += 1.0;
        }
        Some(Self { min, max })
    }

    fn y(&self, value: f64) -> f64 {
        let fraction = (value - self.min) / (self.max - self.min);
        MARGIN_TOP + (1.0 - fraction) * (HEIGHT - MARGIN_TOP - MARGIN_BOTTOM)
    }
}

fn x_for(index: usize, count: usize) -> f64 {
    // Snapshots are newest-first; plot oldest on the left.
    let fraction = (count - 1 - index) as f64 / (count - 1) as f64;
    MARGIN_LEFT + fraction * (WIDTH - MARGIN_LEFT - MARGIN_RIGHT)
}

fn polyline(points: &[(f64, f64)]) -> String {
    let mut out = String::new();
    for (x, y) in points {
        let _ = write!(out, "{x:.1},{y:.1} ");
    }
    out.trim_end().to_string()
}

fn render(title: &str, snapshot: &[Reading]) -> String {
    let count = snapshot.len();
    let has_humidity = snapshot
        .first()
        .is_some_and(|reading| !reading.model.is_meat_thermometer());

    let temperature_scale = Scale::of(
        snapshot
            .iter()
            .flat_map(|r| [r.temperature_min_observed(0), r.temperature_max_observed(0)]),
    );
    let humidity_scale = Scale::of(
        snapshot
            .iter()
            .flat_map(|r| [r.humidity_min_observed(), r.humidity_max_observed()]),
    );

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}">"#
    );
    let _ = writeln!(
        svg,
        r#"<rect width="{WIDTH}" height="{HEIGHT}" fill="white"/>"#
    );
    let _ = writeln!(
        svg,
        r#"<text x="{MARGIN_LEFT}" y="14" font-family="sans-serif" font-size="12">{}</text>"#,
        xml_escape(title)
    );

    if let Some(scale) = &temperature_scale {
        // Envelope band between per-slot minimum and maximum.
        let mut band: Vec<(f64, f64)> = snapshot
            .iter()
            .enumerate()
            .map(|(i, r)| (x_for(i, count), scale.y(r.temperature_max_observed(0))))
            .collect();
        band.extend(
            snapshot
                .iter()
                .enumerate()
                .rev()
                .map(|(i, r)| (x_for(i, count), scale.y(r.temperature_min_observed(0)))),
        );
        let _ = writeln!(
            svg,
            r##"<polygon points="{}" fill="#ff000020" stroke="none"/>"##,
            polyline(&band)
        );

        let trace: Vec<(f64, f64)> = snapshot
            .iter()
            .enumerate()
            .map(|(i, r)| (x_for(i, count), scale.y(r.temperature[0])))
            .collect();
        let _ = writeln!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="red" stroke-width="1"/>"#,
            polyline(&trace)
        );
        let _ = writeln!(
            svg,
            r#"<text x="2" y="{:.1}" font-family="sans-serif" font-size="10" fill="red">{:.1}</text>"#,
            scale.y(scale.max) + 4.0,
            scale.max
        );
        let _ = writeln!(
            svg,
            r#"<text x="2" y="{:.1}" font-family="sans-serif" font-size="10" fill="red">{:.1}</text>"#,
            scale.y(scale.min),
            scale.min
        );
    }

    if has_humidity {
        if let Some(scale) = &humidity_scale {
            let trace: Vec<(f64, f64)> = snapshot
                .iter()
                .enumerate()
                .map(|(i, r)| (x_for(i, count), scale.y(r.humidity)))
                .collect();
            let _ = writeln!(
                svg,
                r#"<polyline points="{}" fill="none" stroke="blue" stroke-width="1"/>"#,
                polyline(&trace)
            );
            let _ = writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" font-family="sans-serif" font-size="10" fill="blue">{:.0}%</text>"#,
                WIDTH - MARGIN_RIGHT + 4.0,
                scale.y(scale.max) + 4.0,
                scale.max
            );
        }
    }

    // Freshest timestamp, bottom right.
    if let Some(newest) = snapshot.first() {
        if let Some(local) = Local.timestamp_opt(newest.time, 0).single() {
            let _ = writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" font-family="sans-serif" font-size="9" text-anchor="end">{}</text>"#,
                WIDTH - 2.0,
                HEIGHT - 4.0,
                local.format("%Y-%m-%d %H:%M")
            );
        }
    }

    svg.push_str("</svg>\n");
    svg
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceModel;

    fn snapshot(count: usize) -> Vec<Reading> {
        (0..count)
            .map(|i| {
                let mut reading =
                    Reading::new(1_700_000_000 - (i as i64) * 300, 20.0 + i as f64, 45.0, 90);
                reading.model = DeviceModel::H5075;
                reading
            })
            .collect()
    }

    #[test]
    fn render_produces_both_traces() {
        let svg = render("Greenhouse (day)", &snapshot(10));
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("stroke=\"red\""));
        assert!(svg.contains("stroke=\"blue\""));
        assert!(svg.contains("Greenhouse (day)"));
        assert!(svg.ends_with("</svg>\n"));
    }

    #[test]
    fn meat_probe_chart_omits_humidity() {
        let readings: Vec<Reading> = (0..5)
            .map(|i| {
                let mut reading =
                    Reading::new(1_700_000_000 - (i as i64) * 300, 95.0, 0.0, 100);
                reading.model = DeviceModel::H5183;
                reading
            })
            .collect();
        let svg = render("BBQ (day)", &readings);
        assert!(svg.contains("stroke=\"red\""));
        assert!(!svg.contains("stroke=\"blue\""));
    }

    #[test]
    fn titles_are_escaped() {
        let svg = render("a < b & c", &snapshot(3));
        assert!(svg.contains("a &lt; b &amp; c"));
    }

    #[test]
    fn write_all_creates_span_files() {
        use chrono::{Local, TimeZone};
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = AcquisitionState::new();
        let address: crate::address::BdAddr = "A4:C1:38:37:BC:AE".parse().unwrap();
        let start = Local
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp();
        for i in 0..24 {
            let mut reading = Reading::new(start + i * 300, 20.0, 45.0, 90);
            reading.model = DeviceModel::H5075;
            state.accept_reading(address, reading);
        }
        write_all(dir.path(), &state, &TitleMap::default());
        assert!(dir.path().join("gvh-A4C13837BCAE-day.svg").exists());
    }
}
