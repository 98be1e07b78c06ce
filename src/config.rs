//! Configuration using Figment.
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults (a simulated load cell, so the binary runs without hardware)
//! 2. A TOML file, `config/loadcell.toml` unless another path is given
//! 3. Environment variables prefixed with `LOADCELL_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use loadcell_daq::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // LOADCELL_ACQUISITION__READ_TIMEOUT_MS=250 overrides the file value
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Reading from {}", settings.transport.endpoint());
//! # Ok(())
//! # }
//! ```

use crate::calibration::CalibrationConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::TransportConfig;
use crate::logging::OutputFormat;
use crate::poller::PollerConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/loadcell.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LOADCELL_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Longest accepted interval, timeout or grace period (one hour).
pub const MAX_DURATION_MS: u64 = 3_600_000;

/// Largest accepted channel capacity.
pub const MAX_CHANNEL_CAPACITY: usize = 65_536;

/// Largest accepted consecutive-failure budget.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 1_000;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Raw-to-physical conversion
    pub calibration: CalibrationConfig,
    /// Poll loop timing and channel sizes
    pub acquisition: AcquisitionConfig,
    /// Which instrument link to open
    pub transport: TransportConfig,
    /// Where session logs go
    pub recording: RecordingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "loadcell-daq".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Poll loop timing, failure policy and channel capacities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll interval in milliseconds; unset uses the transport's default
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Upper bound for one read in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Upper bound for opening the transport in milliseconds
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
    /// Consecutive read failures tolerated before the connection faults
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Poller-to-controller ring size
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Per-subscriber sample backlog
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// Controller command queue size
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    /// Extra time granted to the poll task on disconnect before it is aborted
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_open_timeout() -> u64 {
    5000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_event_capacity() -> usize {
    64
}

fn default_sample_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    32
}

fn default_shutdown_grace() -> u64 {
    500
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            read_timeout_ms: default_read_timeout(),
            open_timeout_ms: default_open_timeout(),
            max_consecutive_failures: default_max_consecutive_failures(),
            event_capacity: default_event_capacity(),
            sample_capacity: default_sample_capacity(),
            command_capacity: default_command_capacity(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl AcquisitionConfig {
    /// Poller settings for a connection over `transport`.
    pub fn poller_config(&self, transport: &TransportConfig) -> PollerConfig {
        PollerConfig {
            interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| transport.default_poll_interval()),
            read_timeout: self.read_timeout(),
            max_consecutive_failures: self.max_consecutive_failures,
            event_capacity: self.event_capacity,
        }
    }

    /// Read timeout as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Open timeout as a duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Disconnect grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject zero or out-of-range intervals, timeouts and capacities.
    pub fn validate(&self) -> AppResult<()> {
        let durations = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("read_timeout_ms", Some(self.read_timeout_ms)),
            ("open_timeout_ms", Some(self.open_timeout_ms)),
        ];
        for (name, value) in durations {
            match value {
                Some(0) => {
                    return Err(DaqError::Configuration(format!("{} must be positive", name)))
                }
                Some(ms) if ms > MAX_DURATION_MS => {
                    return Err(DaqError::Configuration(format!(
                        "{} must be at most {}, got {}",
                        name, MAX_DURATION_MS, ms
                    )))
                }
                _ => {}
            }
        }
        if self.shutdown_grace_ms > MAX_DURATION_MS {
            return Err(DaqError::Configuration(format!(
                "shutdown_grace_ms must be at most {}, got {}",
                MAX_DURATION_MS, self.shutdown_grace_ms
            )));
        }

        let capacities = [
            ("event_capacity", self.event_capacity),
            ("sample_capacity", self.sample_capacity),
            ("command_capacity", self.command_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 || value > MAX_CHANNEL_CAPACITY {
                return Err(DaqError::Configuration(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_CHANNEL_CAPACITY, value
                )));
            }
        }

        if self.max_consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            return Err(DaqError::Configuration(format!(
                "max_consecutive_failures must be at most {}, got {}",
                MAX_CONSECUTIVE_FAILURES, self.max_consecutive_failures
            )));
        }
        Ok(())
    }
}

/// Session log placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory for session logs
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File name prefix for generated log names
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "ensaio".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl RecordingConfig {
    /// `<output_dir>/<prefix>_<YYYYmmdd_HHMMSS>.txt` for the current local time.
    pub fn default_destination(&self) -> PathBuf {
        self.destination_at(chrono::Local::now())
    }

    /// Log path for a session started at `at`.
    pub fn destination_at<Tz: chrono::TimeZone>(&self, at: chrono::DateTime<Tz>) -> PathBuf
    where
        Tz::Offset: std::fmt::Display,
    {
        self.output_dir.join(format!(
            "{}_{}.txt",
            self.file_prefix,
            at.format("%Y%m%d_%H%M%S")
        ))
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] if it exists, plus environment overrides.
    pub fn load() -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH));
        }
        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Load from a specific file path, which must exist, plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DaqError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        Ok(Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        self.calibration.validate()?;
        self.acquisition.validate()?;
        self.transport.validate()?;
        if self.recording.file_prefix.trim().is_empty() {
            return Err(DaqError::Configuration(
                "recording file_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render configuration: {}", e)))
    }
}
