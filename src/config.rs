use std::path::PathBuf;

use crate::grid::{GridError, SlotGrid, DEFAULT_CLOSING, DEFAULT_OPENING, DEFAULT_SLOT_MINUTES};
use crate::limits::MAX_BOOKING_WINDOW_DAYS;
use crate::model::{Minutes, TimeOfDay};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("business hours: {0}")]
    Grid(#[from] GridError),
    #[error("both COURTSIDE_TLS_CERT and COURTSIDE_TLS_KEY must be set, or neither")]
    TlsPair,
}

/// Everything the server reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub club: ClubConfig,
}

/// Business rules of the club: hours, slot length, how far ahead members may book.
#[derive(Debug, Clone)]
pub struct ClubConfig {
    pub grid: SlotGrid,
    pub booking_window_days: u32,
}

impl Default for ClubConfig {
    fn default() -> Self {
        Self {
            grid: SlotGrid::default(),
            booking_window_days: 7,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let opening = parse_or(&lookup, "COURTSIDE_OPENING", DEFAULT_OPENING, |s| {
            s.parse::<TimeOfDay>().map_err(|e| e.to_string())
        })?;
        let closing = parse_or(&lookup, "COURTSIDE_CLOSING", DEFAULT_CLOSING, |s| {
            s.parse::<TimeOfDay>().map_err(|e| e.to_string())
        })?;
        let slot_minutes: Minutes =
            parse_or(&lookup, "COURTSIDE_SLOT_MINUTES", DEFAULT_SLOT_MINUTES, parse_num)?;
        let booking_window_days: u32 =
            parse_or(&lookup, "COURTSIDE_BOOKING_WINDOW_DAYS", 7, parse_num)?;
        if booking_window_days == 0 || booking_window_days > MAX_BOOKING_WINDOW_DAYS {
            return Err(ConfigError::Invalid {
                var: "COURTSIDE_BOOKING_WINDOW_DAYS",
                reason: format!("must be between 1 and {MAX_BOOKING_WINDOW_DAYS}"),
            });
        }
        let grid = SlotGrid::new(opening, closing, slot_minutes)?;

        let tls_cert = lookup("COURTSIDE_TLS_CERT");
        let tls_key = lookup("COURTSIDE_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            bind: lookup("COURTSIDE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "COURTSIDE_PORT", 5433, parse_num)?,
            data_dir: lookup("COURTSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("COURTSIDE_PASSWORD").unwrap_or_else(|| "courtside".into()),
            max_connections: parse_or(&lookup, "COURTSIDE_MAX_CONNECTIONS", 256, parse_num)?,
            compact_threshold: parse_or(&lookup, "COURTSIDE_COMPACT_THRESHOLD", 1000, parse_num)?,
            metrics_port: lookup("COURTSIDE_METRICS_PORT")
                .map(|s| parse_num(&s))
                .transpose()
                .map_err(|reason| ConfigError::Invalid { var: "COURTSIDE_METRICS_PORT", reason })?,
            tls_cert,
            tls_key,
            club: ClubConfig { grid, booking_window_days },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtside.wal")
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    s.trim().parse::<T>().map_err(|e| e.to_string())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => parse(&raw).map_err(|reason| ConfigError::Invalid { var, reason }),
    }
}
