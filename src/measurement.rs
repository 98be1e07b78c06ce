//! Measurement data types shared between the poller, the recorder and consumers.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Unconverted value obtained directly from the transport.
///
/// Only the calibration module interprets it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawReading {
    /// 16-bit holding register content.
    Register(u16),
    /// Decoded text token from a line-oriented frame.
    Token(String),
}

impl std::fmt::Display for RawReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawReading::Register(code) => write!(f, "{}", code),
            RawReading::Token(token) => write!(f, "{:?}", token),
        }
    }
}

/// A calibrated reading as produced by the poller, before it is stamped.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    /// Physical value in the configured unit.
    pub value: f64,
    /// What the transport returned.
    pub raw: RawReading,
    /// When the poll cycle completed the read.
    pub polled_at: Instant,
}

/// A timestamped, calibrated sample.
///
/// `elapsed_seconds` is measured from the origin in force when the controller accepted the
/// reading: the session start while recording, the connection instant otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the origin, non-negative and non-decreasing.
    pub elapsed_seconds: f64,
    /// Physical value in the configured unit.
    pub value: f64,
    /// What the transport returned.
    pub raw: RawReading,
}

impl Sample {
    /// Stamp a reading accepted at `accepted_at` relative to `origin`.
    ///
    /// An acceptance instant before the origin saturates to zero elapsed time.
    pub fn stamp(reading: &Reading, origin: Instant, accepted_at: Instant) -> Self {
        Self {
            elapsed_seconds: accepted_at.saturating_duration_since(origin).as_secs_f64(),
            value: reading.value,
            raw: reading.raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_raw_reading_display() {
        assert_eq!(RawReading::Register(65535).to_string(), "65535");
        assert_eq!(RawReading::Token("12.5".into()).to_string(), "\"12.5\"");
    }

    #[test]
    fn test_sample_clone() {
        let sample = Sample {
            elapsed_seconds: 1.25,
            value: -3.5,
            raw: RawReading::Register(65000),
        };
        let copy = sample.clone();
        assert_eq!(sample, copy);
        assert_eq!(copy.raw, RawReading::Register(65000));
    }

    #[test]
    fn test_stamp_is_relative_to_origin() {
        let origin = Instant::now();
        let reading = Reading {
            value: 4.5,
            raw: RawReading::Token("4.5".into()),
            polled_at: origin,
        };

        let sample = Sample::stamp(&reading, origin, origin + Duration::from_millis(1500));
        assert_eq!(sample.elapsed_seconds, 1.5);
        assert_eq!(sample.value, 4.5);

        // Readings accepted before the origin clamp to zero.
        let early = Sample::stamp(&reading, origin + Duration::from_secs(1), origin);
        assert_eq!(early.elapsed_seconds, 0.0);
    }
}
