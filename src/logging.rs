//! Tracing Infrastructure
//!
//! Structured, async-aware logging built on `tracing` and `tracing-subscriber`:
//! - Structured events with fields (`endpoint`, `consecutive`, `path`, ...)
//! - Spans for the session actor, the poll task and controller operations
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` filtering, falling back to the configured level
//!
//! # Example
//! ```no_run
//! use loadcell_daq::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored, with source locations (for interactive use)
    Pretty,
    /// Single-line format without colors
    #[default]
    Compact,
    /// One JSON object per event, with the enclosing span
    Json,
}

/// Level and format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
}

impl TracingConfig {
    pub fn new(level: Level, format: OutputFormat) -> Self {
        Self { level, format }
    }

    /// Take level and format from `[application]`.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Ok(Self::new(
            parse_log_level(&settings.application.log_level)?,
            settings.application.log_format,
        ))
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }
}

/// Initialize tracing from the application settings
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// A no-op when a subscriber is already installed, so tests and several entry points can call
/// it freely.
pub fn init(config: TracingConfig) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = config.filter();
    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("Failed to initialize tracing: {}", e)))
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}
