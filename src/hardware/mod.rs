//! Instrument transports.
//!
//! A [`Transport`] yields one [`RawReading`] per call. Which concrete link is used is decided
//! at connect time from a [`TransportConfig`]:
//!
//! - [`serial_line`]: newline-delimited ASCII frames, optional activation sequence
//! - [`modbus_rtu`]: single holding-register read over Modbus RTU
//! - [`simulated`]: synthetic load curve for running without hardware
//! - [`mock`]: scripted test double with an instrumented read counter
//!
//! Opening is delegated to a [`TransportOpener`] so the session controller can be driven by
//! test doubles.

pub mod mock;
pub mod modbus_rtu;
pub mod serial_line;
pub mod simulated;

use crate::error::{AppResult, ConnError, ConnErrorKind, DaqError};
use crate::measurement::RawReading;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub use modbus_rtu::ModbusRtuConfig;
pub use serial_line::SerialLineConfig;
pub use simulated::SimulatedConfig;

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used as a serial
/// port. This includes `tokio_serial::SerialStream` (real hardware) and
/// `tokio::io::DuplexStream` (testing).
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// A byte-stream link to the instrument.
///
/// Implementations perform at most one outstanding request at a time, so readings arrive in
/// the order they were taken. `read_one` may wait indefinitely; the poller bounds every call
/// with its read timeout, so implementations must keep partial frames across cancellation.
#[async_trait]
pub trait Transport: Send {
    /// Read one raw value from the instrument.
    async fn read_one(&mut self) -> AppResult<RawReading>;

    /// Release the link. Further reads fail with a `Closed` error.
    async fn close(&mut self) -> AppResult<()>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// Opens transports from configuration.
#[async_trait]
pub trait TransportOpener: Send + Sync {
    /// Open the link described by `config`, including any activation handshake.
    async fn open(&self, config: &TransportConfig) -> AppResult<Box<dyn Transport>>;
}

/// Link selection, tagged by `kind` in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Newline-delimited text frames on a serial port.
    Serial(SerialLineConfig),
    /// Modbus RTU holding register on a serial port.
    Modbus(ModbusRtuConfig),
    /// Synthetic instrument.
    Simulated(SimulatedConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Simulated(SimulatedConfig::default())
    }
}

impl TransportConfig {
    /// Human-readable endpoint (port name or "simulated").
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Serial(cfg) => cfg.port.clone(),
            TransportConfig::Modbus(cfg) => format!("{}#{}", cfg.port, cfg.unit_id),
            TransportConfig::Simulated(_) => "simulated".to_string(),
        }
    }

    /// Poll interval used when the acquisition settings do not fix one.
    ///
    /// Text instruments stream quickly; Modbus needs a full request/response per cycle.
    pub fn default_poll_interval(&self) -> Duration {
        match self {
            TransportConfig::Serial(_) => Duration::from_millis(100),
            TransportConfig::Modbus(_) => Duration::from_millis(200),
            TransportConfig::Simulated(_) => Duration::from_millis(100),
        }
    }

    /// Reject settings no link could work with.
    pub fn validate(&self) -> AppResult<()> {
        let (port, baud_rate) = match self {
            TransportConfig::Serial(cfg) => (&cfg.port, cfg.baud_rate),
            TransportConfig::Modbus(cfg) => (&cfg.port, cfg.baud_rate),
            TransportConfig::Simulated(cfg) => return cfg.validate(),
        };
        if port.trim().is_empty() {
            return Err(DaqError::Configuration("serial port name is empty".into()));
        }
        if baud_rate == 0 {
            return Err(DaqError::Configuration(format!(
                "baud rate for '{}' must be positive",
                port
            )));
        }
        Ok(())
    }
}

/// Opens real serial hardware or the simulated instrument.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceOpener;

#[async_trait]
impl TransportOpener for DeviceOpener {
    async fn open(&self, config: &TransportConfig) -> AppResult<Box<dyn Transport>> {
        match config {
            TransportConfig::Serial(cfg) => serial_line::open(cfg).await,
            TransportConfig::Modbus(cfg) => modbus_rtu::open(cfg).await,
            TransportConfig::Simulated(cfg) => Ok(Box::new(simulated::SimulatedLoadCell::new(
                cfg.clone(),
            ))),
        }
    }
}

/// Open a serial port without blocking the async runtime.
///
/// Standard settings are applied: 8N1, no flow control.
#[cfg(feature = "instrument_serial")]
pub(crate) async fn open_serial_port(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::from(ConnError::new(
                    ConnErrorKind::Open,
                    port_path_owned.clone(),
                    e.to_string(),
                ))
            })
    })
    .await
    .map_err(|e| {
        DaqError::from(ConnError::new(
            ConnErrorKind::Open,
            port_path,
            format!("spawn_blocking for serial port opening failed: {}", e),
        ))
    })?
}

#[cfg(not(feature = "instrument_serial"))]
pub(crate) fn serial_disabled<T>() -> AppResult<T> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let serial = TransportConfig::Serial(SerialLineConfig::new("/dev/ttyUSB0"));
        let modbus = TransportConfig::Modbus(ModbusRtuConfig::new("/dev/ttyUSB0"));
        assert_eq!(serial.default_poll_interval(), Duration::from_millis(100));
        assert_eq!(modbus.default_poll_interval(), Duration::from_millis(200));
        assert_eq!(modbus.endpoint(), "/dev/ttyUSB0#1");
    }

    #[test]
    fn test_validate() {
        assert!(TransportConfig::Serial(SerialLineConfig::new("")).validate().is_err());
        let mut cfg = ModbusRtuConfig::new("COM6");
        cfg.baud_rate = 0;
        assert!(TransportConfig::Modbus(cfg).validate().is_err());
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_tagging() {
        let parsed: TransportConfig = toml::from_str(
            r#"
            kind = "modbus"
            port = "COM6"
            register = 4
            unit_id = 2
            "#,
        )
        .unwrap();
        match parsed {
            TransportConfig::Modbus(cfg) => {
                assert_eq!(cfg.port, "COM6");
                assert_eq!(cfg.baud_rate, 9600);
                assert_eq!(cfg.register, 4);
                assert_eq!(cfg.unit_id, 2);
            }
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_opener_simulated() {
        let mut transport = DeviceOpener
            .open(&TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(transport.describe(), "simulated");
        assert!(matches!(
            transport.read_one().await.unwrap(),
            RawReading::Register(_)
        ));
    }
}
