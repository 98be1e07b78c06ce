//! Simulated load cell.
//!
//! Produces a slow sinusoidal load with a little noise, encoded exactly the way a Modbus
//! indicator would report it: a 16-bit two's-complement register code. This lets the whole
//! pipeline, calibration included, run without hardware.

use super::Transport;
use crate::error::{AppResult, ConnError, ConnErrorKind, DaqError};
use crate::measurement::RawReading;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tracing::debug;

/// Shape of the synthetic load curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Peak amplitude in raw codes.
    #[serde(default = "default_peak_code")]
    pub peak_code: u16,
    /// Period of one load cycle, in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Uniform noise amplitude in raw codes.
    #[serde(default = "default_noise_codes")]
    pub noise_codes: u16,
    /// Report the device as unplugged after this many reads.
    #[serde(default)]
    pub fail_after: Option<u64>,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_peak_code() -> u16 {
    24_000
}

fn default_period_ms() -> u64 {
    10_000
}

fn default_noise_codes() -> u16 {
    40
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            peak_code: default_peak_code(),
            period_ms: default_period_ms(),
            noise_codes: default_noise_codes(),
            fail_after: None,
            seed: None,
        }
    }
}

impl SimulatedConfig {
    /// Reject curves that cannot be encoded as a signed 16-bit code.
    pub fn validate(&self) -> AppResult<()> {
        if self.period_ms == 0 {
            return Err(DaqError::Configuration(
                "simulated period_ms must be positive".into(),
            ));
        }
        let swing = u32::from(self.peak_code) + u32::from(self.noise_codes);
        if swing > i16::MAX as u32 {
            return Err(DaqError::Configuration(format!(
                "simulated peak_code + noise_codes must not exceed {}, got {}",
                i16::MAX,
                swing
            )));
        }
        Ok(())
    }
}

/// Synthetic instrument implementing [`Transport`].
pub struct SimulatedLoadCell {
    config: SimulatedConfig,
    rng: StdRng,
    reads: u64,
    closed: bool,
}

impl SimulatedLoadCell {
    /// Create a simulated cell; seeded from entropy unless `config.seed` is set.
    pub fn new(config: SimulatedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            reads: 0,
            closed: false,
        }
    }

    /// Load code for the given read index, before noise.
    fn curve(&self, index: u64) -> f64 {
        // Reads are nominally 100 ms apart; the curve only needs to look plausible.
        let t_ms = index as f64 * 100.0;
        let phase = (t_ms / self.config.period_ms as f64) * TAU;
        f64::from(self.config.peak_code) * phase.sin()
    }

    fn unplugged(&self, message: &str) -> DaqError {
        ConnError::new(ConnErrorKind::Closed, "simulated", message).into()
    }
}

#[async_trait]
impl Transport for SimulatedLoadCell {
    async fn read_one(&mut self) -> AppResult<RawReading> {
        if self.closed {
            return Err(self.unplugged("transport already closed"));
        }
        if let Some(limit) = self.config.fail_after {
            if self.reads >= limit {
                return Err(self.unplugged("simulated device unplugged"));
            }
        }

        let noise = if self.config.noise_codes == 0 {
            0.0
        } else {
            let amplitude = f64::from(self.config.noise_codes);
            self.rng.gen_range(-amplitude..=amplitude)
        };
        let code = (self.curve(self.reads) + noise).round() as i16;
        self.reads += 1;
        Ok(RawReading::Register(code as u16))
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.closed {
            self.closed = true;
            debug!(reads = self.reads, "Simulated load cell closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
