//! Raw-to-physical conversion for load-cell readings.
//!
//! The instrument reports force as a 16-bit two's-complement code where
//! `raw_full_scale` corresponds to the cell's rated `capacity`. One code,
//! `invalid_raw_sentinel`, means "no load / out of range" and maps to zero.
//!
//! Text-mode instruments already report physical units, so their tokens are
//! parsed as decimal numbers without scaling.
//!
//! Everything here is pure so it can be tested without hardware.

use crate::error::{AppResult, DaqError};
use crate::measurement::RawReading;
use serde::{Deserialize, Serialize};

/// Calibration parameters, supplied once when the engine is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Physical full scale of the cell (e.g. 100 kgf).
    pub capacity: f64,
    /// Raw code that corresponds to `capacity`.
    #[serde(default = "default_raw_full_scale")]
    pub raw_full_scale: i32,
    /// Raw code the instrument sends when it has no valid reading.
    #[serde(default = "default_invalid_raw_sentinel")]
    pub invalid_raw_sentinel: i32,
    /// Unit label written to the log header.
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_raw_full_scale() -> i32 {
    32767
}

fn default_invalid_raw_sentinel() -> i32 {
    65535
}

fn default_unit() -> String {
    "kgf".to_string()
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            raw_full_scale: default_raw_full_scale(),
            invalid_raw_sentinel: default_invalid_raw_sentinel(),
            unit: default_unit(),
        }
    }
}

impl CalibrationConfig {
    /// Create a calibration for a cell of the given capacity with the standard codes.
    pub fn with_capacity(capacity: f64) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Physical units per raw code.
    pub fn scale_factor(&self) -> f64 {
        self.capacity / f64::from(self.raw_full_scale)
    }

    /// Check the invariants the conversion relies on.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(DaqError::Configuration(format!(
                "calibration capacity must be a positive number, got {}",
                self.capacity
            )));
        }
        if self.raw_full_scale <= 0 {
            return Err(DaqError::Configuration(format!(
                "raw_full_scale must be positive, got {}",
                self.raw_full_scale
            )));
        }
        if self.unit.trim().is_empty() {
            return Err(DaqError::Configuration("unit label must not be empty".into()));
        }
        Ok(())
    }
}

/// Convert a register code to physical units.
pub fn convert(raw: u16, config: &CalibrationConfig) -> f64 {
    if i32::from(raw) == config.invalid_raw_sentinel {
        return 0.0;
    }
    // Reinterpret as 16-bit two's complement: codes above 32767 are negative.
    let signed = raw as i16;
    f64::from(signed) * config.scale_factor()
}

/// Parse a text token as a decimal value.
pub fn parse_token(token: &str) -> AppResult<f64> {
    let trimmed = token.trim();
    let value = trimmed.parse::<f64>().map_err(|e| DaqError::Parse {
        token: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if !value.is_finite() {
        return Err(DaqError::Parse {
            token: trimmed.to_string(),
            reason: "value is not finite".to_string(),
        });
    }
    Ok(value)
}

/// Convert any raw reading to physical units.
pub fn calibrate(raw: &RawReading, config: &CalibrationConfig) -> AppResult<f64> {
    match raw {
        RawReading::Register(code) => Ok(convert(*code, config)),
        RawReading::Token(token) => parse_token(token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sentinel_maps_to_zero() {
        for capacity in [1.0, 100.0, 2500.0] {
            let cfg = CalibrationConfig::with_capacity(capacity);
            assert_eq!(convert(65535, &cfg), 0.0);
        }
    }

    #[test]
    fn test_full_scale() {
        let cfg = CalibrationConfig::with_capacity(100.0);
        assert!(approx_eq(convert(32767, &cfg), 100.0));
        assert_eq!(convert(0, &cfg), 0.0);
    }

    #[test]
    fn test_first_negative_code() {
        let cfg = CalibrationConfig::with_capacity(100.0);
        let value = convert(32768, &cfg);
        let expected = (32768.0 - 65536.0) * (100.0 / 32767.0);
        assert!(value < 0.0);
        assert!(approx_eq(value, expected));
    }

    #[test]
    fn test_minus_one_code() {
        // 65534 is -2 in two's complement; 65535 is the sentinel, not -1.
        let cfg = CalibrationConfig::with_capacity(32767.0);
        assert!(approx_eq(convert(65534, &cfg), -2.0));
    }

    #[test]
    fn test_deterministic_over_full_range() {
        let cfg = CalibrationConfig::with_capacity(50.0);
        for raw in 0..=u16::MAX {
            let first = convert(raw, &cfg);
            let second = convert(raw, &cfg);
            assert_eq!(first.to_bits(), second.to_bits());
            assert!(first.abs() <= 50.0 * 32768.0 / 32767.0 + 1e-9);
        }
    }

    #[test]
    fn test_custom_sentinel() {
        let cfg = CalibrationConfig {
            invalid_raw_sentinel: 32767,
            ..CalibrationConfig::default()
        };
        assert_eq!(convert(32767, &cfg), 0.0);
        assert!(convert(65535, &cfg) < 0.0);
    }

    #[test]
    fn test_parse_token() {
        assert!(approx_eq(parse_token(" 12.3456\r").unwrap(), 12.3456));
        assert!(approx_eq(parse_token("-0.5").unwrap(), -0.5));
        assert!(matches!(parse_token("ST,GS"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_token("NaN"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_token(""), Err(DaqError::Parse { .. })));
    }

    #[test]
    fn test_calibrate_dispatch() {
        let cfg = CalibrationConfig::with_capacity(100.0);
        assert!(approx_eq(
            calibrate(&RawReading::Register(32767), &cfg).unwrap(),
            100.0
        ));
        // Tokens are already physical and are not scaled.
        assert!(approx_eq(
            calibrate(&RawReading::Token("7.25".into()), &cfg).unwrap(),
            7.25
        ));
    }

    #[test]
    fn test_validate() {
        assert!(CalibrationConfig::default().validate().is_ok());
        assert!(CalibrationConfig::with_capacity(0.0).validate().is_err());
        assert!(CalibrationConfig::with_capacity(-5.0).validate().is_err());
        assert!(CalibrationConfig::with_capacity(f64::NAN).validate().is_err());
        let cfg = CalibrationConfig {
            raw_full_scale: 0,
            ..CalibrationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
