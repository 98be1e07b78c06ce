//! Session recording: session clock, in-memory sample buffer and the CSV log.
//!
//! The log format is fixed:
//!
//! ```text
//! Tempo (s),Forca (kgf)
//! 0.1000,12.3456
//! 0.2000,12.4012
//! ```
//!
//! Every line is flushed as soon as it is written so an abrupt stop loses at most the sample
//! being written. A write failure is reported once; the session then continues in memory only
//! and the failure is carried into the [`SessionSummary`].

use crate::error::{AppResult, DaqError};
use crate::measurement::{Reading, Sample};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type LogWriter = csv::Writer<Box<dyn Write + Send>>;

/// Result of offering a sample to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Buffered and written to the log.
    Written,
    /// Buffered only; the log failed earlier in this session.
    Buffered,
    /// Not recorded: no session, or elapsed time went backwards.
    Rejected,
}

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Log destination.
    pub path: PathBuf,
    /// Samples accepted during the session.
    pub sample_count: usize,
    /// Time from session start to stop.
    pub duration: Duration,
    /// First log write failure, if any.
    pub write_error: Option<String>,
}

struct Session {
    path: PathBuf,
    started_at: Instant,
    samples: Vec<Sample>,
    log: Option<LogWriter>,
    write_error: Option<String>,
}

impl Session {
    fn last_elapsed(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.elapsed_seconds)
    }
}

/// Owns at most one recording session at a time.
pub struct Recorder {
    unit: String,
    session: Option<Session>,
}

impl Recorder {
    /// Create an idle recorder labelling values with `unit`.
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            session: None,
        }
    }

    /// Begin a session at `started_at`, creating or truncating `destination`.
    pub fn start(&mut self, started_at: Instant, destination: &Path) -> AppResult<()> {
        self.ensure_idle()?;
        let file = File::create(destination).map_err(|e| {
            error!(path = %destination.display(), error = %e, "Cannot create session log");
            DaqError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot create '{}': {}", destination.display(), e),
            ))
        })?;
        self.start_with_writer(
            started_at,
            destination.to_path_buf(),
            Box::new(BufWriter::new(file)),
        )
    }

    /// Begin a session writing to an arbitrary sink; `path` is only reported.
    pub fn start_with_writer(
        &mut self,
        started_at: Instant,
        path: PathBuf,
        writer: Box<dyn Write + Send>,
    ) -> AppResult<()> {
        self.ensure_idle()?;

        let mut log = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(writer);
        log.write_record(["Tempo (s)".to_string(), format!("Forca ({})", self.unit)])?;
        log.flush()?;

        info!(path = %path.display(), "Recording started");
        self.session = Some(Session {
            path,
            started_at,
            samples: Vec::new(),
            log: Some(log),
            write_error: None,
        });
        Ok(())
    }

    fn ensure_idle(&self) -> AppResult<()> {
        match &self.session {
            None => Ok(()),
            Some(session) => Err(DaqError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("session already recording to '{}'", session.path.display()),
            ))),
        }
    }

    /// Stamp a reading against the session clock. `None` when idle.
    pub fn accept(&self, reading: &Reading, accepted_at: Instant) -> Option<Sample> {
        self.session
            .as_ref()
            .map(|session| Sample::stamp(reading, session.started_at, accepted_at))
    }

    /// Append a sample to the buffer and the log.
    ///
    /// Returns `Err` exactly once per session, on the first log write failure.
    pub fn record(&mut self, sample: Sample) -> AppResult<RecordOutcome> {
        let Some(session) = self.session.as_mut() else {
            return Ok(RecordOutcome::Rejected);
        };
        if sample.elapsed_seconds < session.last_elapsed() {
            warn!(
                elapsed = sample.elapsed_seconds,
                last = session.last_elapsed(),
                "Out-of-order sample rejected"
            );
            return Ok(RecordOutcome::Rejected);
        }

        let line = [
            format!("{:.4}", sample.elapsed_seconds),
            format!("{:.4}", sample.value),
        ];
        session.samples.push(sample);

        let Some(log) = session.log.as_mut() else {
            return Ok(RecordOutcome::Buffered);
        };
        let written = log
            .write_record(&line)
            .map_err(DaqError::from)
            .and_then(|_| log.flush().map_err(DaqError::from));
        match written {
            Ok(()) => Ok(RecordOutcome::Written),
            Err(err) => {
                error!(
                    path = %session.path.display(),
                    error = %err,
                    "Session log write failed, continuing in memory"
                );
                session.write_error = Some(err.to_string());
                session.log = None;
                Err(err)
            }
        }
    }

    /// Flush and close the log, returning what the session produced. `None` when idle.
    pub fn finish(&mut self) -> Option<SessionSummary> {
        let mut session = self.session.take()?;
        if let Some(mut log) = session.log.take() {
            if let Err(e) = log.flush() {
                error!(path = %session.path.display(), error = %e, "Final flush failed");
                session.write_error.get_or_insert_with(|| e.to_string());
            }
        }

        let summary = SessionSummary {
            path: session.path,
            sample_count: session.samples.len(),
            duration: Instant::now().saturating_duration_since(session.started_at),
            write_error: session.write_error,
        };
        info!(
            path = %summary.path.display(),
            samples = summary.sample_count,
            duration_s = summary.duration.as_secs_f64(),
            "Recording stopped"
        );
        Some(summary)
    }

    /// Flush and close the log. Idempotent: returns 0 when no session is active.
    pub fn stop(&mut self) -> usize {
        match self.finish() {
            Some(summary) => summary.sample_count,
            None => {
                debug!("Stop requested with no active session");
                0
            }
        }
    }

    /// Whether a session is active.
    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Samples of the active session.
    pub fn samples(&self) -> &[Sample] {
        self.session
            .as_ref()
            .map(|s| s.samples.as_slice())
            .unwrap_or(&[])
    }

    /// Active log destination.
    pub fn path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    /// The log write failure of the active session, if any.
    pub fn degraded(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.write_error.as_deref())
    }
}
