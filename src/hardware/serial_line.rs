//! Line-oriented serial transport.
//!
//! Protocol overview:
//! - Format: one ASCII frame per line, LF (or CRLF) terminated
//! - Plain instruments send a bare decimal value per line (e.g. `12.3456`)
//! - Tokenized instruments send delimited fields (e.g. `ST,GS,+0012.34kg`); `delimiter` and
//!   `field` pick the value token
//! - Some instruments stay silent until a vendor-specific activation sequence is written
//!   once after opening the port
//!
//! Frames are accumulated in a buffer owned by the transport, so a read cancelled by the
//! poller's timeout keeps the partial frame and the next read completes it.
//!
//! Streaming instruments usually send faster than the poll rate. Each read therefore drains
//! every complete frame already buffered and reports only the newest one, so the value handed
//! to the poller is never older than one frame. Input that was waiting before the transport
//! attached is discarded.

use super::{SerialPortIO, Transport};
use crate::error::{AppResult, ConnError, ConnErrorKind, DaqError};
use crate::measurement::RawReading;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, trace};

/// Settings for a line-oriented serial instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialLineConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM6").
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Bytes written once after opening, before the first read.
    #[serde(default)]
    pub activation_sequence: Vec<u8>,
    /// Field separator for tokenized frames. `None` takes the whole line.
    #[serde(default)]
    pub delimiter: Option<char>,
    /// Zero-based index of the value token when `delimiter` is set.
    #[serde(default)]
    pub field: usize,
    /// Drop a trailing unit suffix such as `kg` or `N` from the token.
    #[serde(default)]
    pub strip_unit_suffix: bool,
}

fn default_baud_rate() -> u32 {
    9600
}

impl SerialLineConfig {
    /// Plain float-per-line instrument at 9600 baud.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            activation_sequence: Vec::new(),
            delimiter: None,
            field: 0,
            strip_unit_suffix: false,
        }
    }

    /// Select one field of a delimited frame.
    pub fn with_token(mut self, delimiter: char, field: usize) -> Self {
        self.delimiter = Some(delimiter);
        self.field = field;
        self
    }

    /// Write `sequence` to the instrument right after opening.
    pub fn with_activation(mut self, sequence: impl Into<Vec<u8>>) -> Self {
        self.activation_sequence = sequence.into();
        self
    }
}

/// Serial transport reading newline-terminated text frames.
pub struct SerialLineTransport<S: SerialPortIO> {
    endpoint: String,
    reader: BufReader<S>,
    pending: Vec<u8>,
    delimiter: Option<char>,
    field: usize,
    strip_unit_suffix: bool,
    closed: bool,
}

impl<S: SerialPortIO> SerialLineTransport<S> {
    /// Wrap an open port, sending the activation sequence first if one is configured.
    ///
    /// Bytes already waiting on the port are discarded.
    #[instrument(skip(port, config), fields(endpoint = %config.port), err)]
    pub async fn attach(port: S, config: &SerialLineConfig) -> AppResult<Self> {
        let mut reader = BufReader::new(port);
        let stale = discard_ready_input(&mut reader);
        if stale > 0 {
            debug!(bytes = stale, "Discarded input received before attach");
        }

        if !config.activation_sequence.is_empty() {
            let port = reader.get_mut();
            let activation_failed = |e: std::io::Error| {
                DaqError::from(ConnError::new(
                    ConnErrorKind::Open,
                    config.port.clone(),
                    format!("failed to write activation sequence: {}", e),
                ))
            };
            port.write_all(&config.activation_sequence)
                .await
                .map_err(activation_failed)?;
            port.flush().await.map_err(activation_failed)?;
            debug!(
                bytes = config.activation_sequence.len(),
                "Activation sequence sent"
            );
        }

        Ok(Self {
            endpoint: config.port.clone(),
            reader,
            pending: Vec::with_capacity(64),
            delimiter: config.delimiter,
            field: config.field,
            strip_unit_suffix: config.strip_unit_suffix,
            closed: false,
        })
    }

    fn closed_error(&self, message: &str) -> DaqError {
        ConnError::new(ConnErrorKind::Closed, self.endpoint.clone(), message).into()
    }

    /// Next complete, non-blank frame, terminator included. `None` at end of stream.
    ///
    /// Cancel safe: bytes of an unfinished frame stay in `pending`.
    async fn next_frame(&mut self) -> AppResult<Option<Vec<u8>>> {
        loop {
            let n = self
                .reader
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(|e| DaqError::from(ConnError::from_io(self.endpoint.clone(), &e)))?;

            if n == 0 {
                return Ok(None);
            }
            if !self.pending.ends_with(b"\n") {
                // Stream ended mid-frame; the next read reports the closed link.
                continue;
            }

            let frame = std::mem::take(&mut self.pending);
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    /// Pick the value token out of a complete, trimmed line.
    fn select_token<'a>(&self, line: &'a str) -> AppResult<&'a str> {
        let token = match self.delimiter {
            None => line,
            Some(delimiter) => {
                let fields: Vec<&str> = line.split(delimiter).collect();
                fields.get(self.field).map(|f| f.trim()).ok_or_else(|| {
                    DaqError::Decode(format!(
                        "frame '{}' has {} fields, expected field {}",
                        line,
                        fields.len(),
                        self.field
                    ))
                })?
            }
        };
        if self.strip_unit_suffix {
            Ok(token.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%'))
        } else {
            Ok(token)
        }
    }
}

#[async_trait]
impl<S: SerialPortIO> Transport for SerialLineTransport<S> {
    async fn read_one(&mut self) -> AppResult<RawReading> {
        if self.closed {
            return Err(self.closed_error("transport already closed"));
        }

        let Some(mut frame) = self.next_frame().await? else {
            return Err(self.closed_error("end of stream (device disconnected)"));
        };

        // Frames already buffered are newer; keep the latest one.
        let mut skipped = 0usize;
        while let Some(next) = self.next_frame().now_or_never() {
            match next? {
                Some(newer) => {
                    frame = newer;
                    skipped += 1;
                }
                None => break,
            }
        }
        if skipped > 0 {
            trace!(skipped, "Skipped stale frames");
        }

        let text = String::from_utf8(frame)
            .map_err(|e| DaqError::Decode(format!("frame is not valid UTF-8: {}", e)))?;
        let line = text.trim();
        trace!(frame = line, "Frame received");
        let token = self.select_token(line)?;
        Ok(RawReading::Token(token.to_string()))
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.reader
            .get_mut()
            .shutdown()
            .await
            .map_err(|e| DaqError::from(ConnError::from_io(self.endpoint.clone(), &e)))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Drop whatever the port has already delivered, without waiting for more.
fn discard_ready_input<S: SerialPortIO>(reader: &mut BufReader<S>) -> usize {
    let mut discarded = 0;
    while let Some(Ok(buffered)) = reader.fill_buf().now_or_never() {
        let n = buffered.len();
        if n == 0 {
            break;
        }
        reader.consume(n);
        discarded += n;
    }
    discarded
}

/// Open a serial port and attach a line transport to it.
#[cfg(feature = "instrument_serial")]
pub async fn open(config: &SerialLineConfig) -> AppResult<Box<dyn Transport>> {
    let port = super::open_serial_port(&config.port, config.baud_rate).await?;
    let transport = SerialLineTransport::attach(port, config).await?;
    Ok(Box::new(transport))
}

/// Serial support is compiled out.
#[cfg(not(feature = "instrument_serial"))]
pub async fn open(_config: &SerialLineConfig) -> AppResult<Box<dyn Transport>> {
    super::serial_disabled()
}
