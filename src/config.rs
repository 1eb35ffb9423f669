use crate::address::BdAddr;
use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "govee-logger",
    version,
    about = "Logs BLE advertisements from Govee thermometers and pulls their stored history"
)]
struct Cli {
    /// Directory for per-device log files (enables logging)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Seconds between log file writes
    #[arg(short = 't', long)]
    time: Option<u64>,

    /// Directory for aggregate cache files
    #[arg(short, long)]
    cache: Option<PathBuf>,

    /// Directory for rendered SVG charts
    #[arg(short, long)]
    svg: Option<PathBuf>,

    /// Optional address-to-title map for chart headings
    #[arg(long)]
    titlemap: Option<PathBuf>,

    /// Days between history downloads per device (0 disables downloads)
    #[arg(short, long)]
    download: Option<u32>,

    /// Passive scanning (listen only, no scan requests)
    #[arg(short, long)]
    passive: bool,

    /// Restrict scanning to these addresses; a single FF:FF:FF:FF:FF:FF
    /// means every device already known
    #[arg(short, long = "address")]
    address: Vec<String>,

    /// Bluetooth adapter to use (e.g. hci0)
    #[arg(short = 'A', long)]
    adapter: Option<String>,

    /// Use the raw HCI transport instead of BlueZ D-Bus
    #[arg(short = 'H', long)]
    hci: bool,

    /// Watch the log directory instead of using Bluetooth
    #[arg(short = 'M', long)]
    monitor: bool,

    /// Print an MRTG-style report for one device and exit
    #[arg(short, long)]
    only: Option<String>,

    /// Minutes to average for the MRTG report
    #[arg(short, long)]
    minutes: Option<i64>,

    /// More output; repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub svg_dir: Option<PathBuf>,
    pub titlemap: Option<PathBuf>,
    pub log_write_seconds: u64,
    pub minutes_average: i64,
    pub download_days: u32,
    pub passive_scan: bool,
    pub whitelist: Vec<BdAddr>,
    pub adapter: Option<String>,
    pub use_hci: bool,
    pub monitor_only: bool,
    pub query: Option<BdAddr>,
}

impl Config {
    /// Command line over environment over defaults.
    pub fn load() -> Result<(Self, u8)> {
        let cli = Cli::parse();

        let log_dir = cli.log.or_else(|| env_path("GOVEE_LOG_DIR"));
        let cache_dir = cli.cache.or_else(|| env_path("GOVEE_CACHE_DIR"));
        let svg_dir = cli.svg.or_else(|| env_path("GOVEE_SVG_DIR"));
        let titlemap = cli.titlemap.or_else(|| env_path("GOVEE_TITLEMAP"));

        let log_write_seconds = match cli.time {
            Some(seconds) => seconds,
            None => env_u64("GOVEE_LOG_SECONDS", 60)?,
        };
        let download_days = match cli.download {
            Some(days) => days,
            None => env_u64("GOVEE_DOWNLOAD_DAYS", 0)? as u32,
        };
        let minutes_average = cli.minutes.unwrap_or(5);

        let mut whitelist = Vec::new();
        for text in &cli.address {
            let address: BdAddr = text
                .parse()
                .with_context(|| format!("invalid bluetooth address: {text}"))?;
            whitelist.push(address);
        }

        let query = match &cli.only {
            Some(text) => Some(
                text.parse()
                    .ok()
                    .with_context(|| format!("invalid bluetooth address: {text}"))?,
            ),
            None => None,
        };

        let config = Config {
            log_dir,
            cache_dir,
            svg_dir,
            titlemap,
            log_write_seconds,
            minutes_average,
            download_days,
            passive_scan: cli.passive,
            whitelist,
            adapter: cli.adapter,
            use_hci: cli.hci,
            monitor_only: cli.monitor,
            query,
        };
        Ok((config, cli.verbose))
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}
