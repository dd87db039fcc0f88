//! Daemon configuration
//!
//! Settings come from `~/.hearth/config.toml` when present, with
//! environment variables taking precedence:
//!
//! - `HEARTH_MAX_RUNNERS`: maximum resident runners (<= 0 means
//!   unlimited modulo accelerator memory)
//! - `HEARTH_KEEP_ALIVE`: default idle timeout before a runner is
//!   unloaded; integer seconds or a duration string ("90s", "5m", "1h");
//!   negative pins runners forever
//! - `HEARTH_MAX_VRAM`: byte-size string ("24GiB", "8GB") that overrides
//!   accelerator discovery with a single synthetic device, for testing

use crate::errors::{HearthError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Keep-alive suffixes and their scale in milliseconds.
const DURATION_UNITS: &[(&str, f64)] = &[
    ("ms", 1.0),
    ("s", 1_000.0),
    ("m", 60_000.0),
    ("h", 3_600_000.0),
];

/// How long a runner stays resident after its last request.
///
/// `Forever` (a negative keep-alive at the API edge) pins the runner until
/// it is explicitly evicted to make room for another model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepAlive {
    For(Duration),
    Forever,
}

impl KeepAlive {
    /// Default idle timeout when neither config nor request specify one.
    pub const DEFAULT: KeepAlive = KeepAlive::For(Duration::from_secs(5 * 60));

    /// The expiry timer duration, or `None` for pinned runners.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            KeepAlive::For(d) => Some(*d),
            KeepAlive::Forever => None,
        }
    }

    /// Eviction sort key: pinned runners order after every finite timeout.
    pub fn order_key(&self) -> u128 {
        match self {
            KeepAlive::For(d) => d.as_nanos(),
            KeepAlive::Forever => u128::MAX,
        }
    }

    /// Parse an integer (seconds) or a suffixed duration string.
    ///
    /// Negative values pin the runner forever. Accepted suffixes are
    /// `ms`, `s`, `m`, `h`; `ms` is listed before the single-letter
    /// units so "250ms" is not read as minutes.
    pub fn parse(s: &str) -> Result<KeepAlive> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<i64>() {
            if secs < 0 {
                return Ok(KeepAlive::Forever);
            }
            return Ok(KeepAlive::For(Duration::from_secs(secs as u64)));
        }

        for (suffix, millis_per_unit) in DURATION_UNITS {
            let Some(number) = s.strip_suffix(suffix) else {
                continue;
            };
            let value: f64 = number
                .trim()
                .parse()
                .map_err(|_| HearthError::Config(format!("invalid keep-alive: {}", s)))?;
            if value < 0.0 {
                return Ok(KeepAlive::Forever);
            }
            return Ok(KeepAlive::For(Duration::from_millis(
                (value * millis_per_unit) as u64,
            )));
        }

        Err(HearthError::Config(format!(
            "invalid keep-alive: {}. Use seconds or a duration like '5m'",
            s
        )))
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        KeepAlive::DEFAULT
    }
}

/// On-disk settings file, all fields optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    max_runners: Option<usize>,
    keep_alive: Option<String>,
    max_vram: Option<String>,
    log_level: Option<String>,
}

/// Resolved daemon settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum resident runners; 0 means unlimited modulo accelerator memory
    pub max_runners: usize,
    /// Default keep-alive applied when a request does not carry one
    pub keep_alive: KeepAlive,
    /// Synthetic accelerator memory override for testing
    pub max_vram: Option<u64>,
    /// Log level for the daemon
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_runners: 0,
            keep_alive: KeepAlive::DEFAULT,
            max_vram: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Default config file location (~/.hearth/config.toml)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hearth")
            .join("config.toml")
    }

    /// Load settings: defaults, then the config file, then environment.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from an explicit path (for testing)
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let mut settings = Settings::default();

        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let file: SettingsFile = toml::from_str(&raw)?;
            if let Some(n) = file.max_runners {
                settings.max_runners = n;
            }
            if let Some(s) = file.keep_alive {
                settings.keep_alive = KeepAlive::parse(&s)?;
            }
            if let Some(s) = file.max_vram {
                settings.max_vram = Some(parse_memory_string(&s)?);
            }
            if let Some(s) = file.log_level {
                settings.log_level = s;
            }
        }

        if let Some(n) = env_max_runners() {
            settings.max_runners = n;
        }
        if let Some(k) = env_keep_alive() {
            settings.keep_alive = k;
        }
        if let Some(v) = env_max_vram() {
            settings.max_vram = Some(v);
        }

        Ok(settings)
    }
}

/// Read `HEARTH_MAX_RUNNERS`, logging and ignoring invalid values.
///
/// Re-read on every scheduling attempt so operators can adjust the cap on
/// a live daemon.
pub fn env_max_runners() -> Option<usize> {
    let raw = std::env::var("HEARTH_MAX_RUNNERS").ok()?;
    match raw.trim().parse::<i64>() {
        Ok(n) if n > 0 => Some(n as usize),
        Ok(_) => Some(0),
        Err(e) => {
            warn!(value = %raw, error = %e, "invalid HEARTH_MAX_RUNNERS, ignoring");
            None
        }
    }
}

/// Read `HEARTH_KEEP_ALIVE`, logging and ignoring invalid values.
pub fn env_keep_alive() -> Option<KeepAlive> {
    let raw = std::env::var("HEARTH_KEEP_ALIVE").ok()?;
    match KeepAlive::parse(&raw) {
        Ok(k) => Some(k),
        Err(e) => {
            warn!(value = %raw, error = %e, "invalid HEARTH_KEEP_ALIVE, ignoring");
            None
        }
    }
}

/// Read `HEARTH_MAX_VRAM`, logging and ignoring invalid values.
pub fn env_max_vram() -> Option<u64> {
    let raw = std::env::var("HEARTH_MAX_VRAM").ok()?;
    match parse_memory_string(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(value = %raw, error = %e, "invalid HEARTH_MAX_VRAM, ignoring");
            None
        }
    }
}

/// Byte-size suffixes accepted for `HEARTH_MAX_VRAM` and the `max_vram`
/// config key. Binary (IEC) units scale by powers of two, decimal (SI)
/// units by powers of ten. Longer suffixes come first so "gib" is never
/// read as ending in a bare unit.
const MEMORY_UNITS: &[(&str, u64)] = &[
    ("kib", 1 << 10),
    ("mib", 1 << 20),
    ("gib", 1 << 30),
    ("tib", 1 << 40),
    ("kb", 1_000),
    ("mb", 1_000_000),
    ("gb", 1_000_000_000),
    ("tb", 1_000_000_000_000),
];

/// Parse a byte-size string such as "24GiB", "8GB", or raw bytes.
pub fn parse_memory_string(s: &str) -> Result<u64> {
    let lower = s.trim().to_ascii_lowercase();

    for (suffix, scale) in MEMORY_UNITS {
        let Some(number) = lower.strip_suffix(suffix) else {
            continue;
        };
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| HearthError::Config(format!("invalid memory size: {}", s)))?;
        if value < 0.0 {
            return Err(HearthError::Config(format!(
                "memory size cannot be negative: {}",
                s
            )));
        }
        return Ok((value * *scale as f64) as u64);
    }

    lower.parse::<u64>().map_err(|_| {
        HearthError::Config(format!(
            "invalid memory size: {}. Use a value like '24GiB', '8GB', or bytes",
            s
        ))
    })
}

/// Render a byte count with binary units, the way accelerator memory is
/// quoted everywhere else in the daemon.
pub fn format_bytes(bytes: u64) -> String {
    const SCALES: &[(u64, &str)] = &[(1 << 30, "GiB"), (1 << 20, "MiB"), (1 << 10, "KiB")];

    for (scale, unit) in SCALES {
        if bytes >= *scale {
            return format!("{:.1} {}", bytes as f64 / *scale as f64, unit);
        }
    }
    format!("{} B", bytes)
}
