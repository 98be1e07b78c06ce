//! # Load-Cell DAQ Core Library
//!
//! This crate acquires force readings from a load-cell instrument over a byte-stream link
//! (newline-delimited serial text or a Modbus RTU holding register), converts them to
//! calibrated physical units and records timestamped samples for the duration of an
//! operator-controlled test session. The `loadcell-daq` binary is a thin command-line front
//! end over this library.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: The `Transport` trait and its implementations (serial text, Modbus RTU,
//!   a simulated cell and a scripted mock), plus the `TransportOpener` seam.
//! - **`calibration`**: Pure raw-to-physical conversion.
//! - **`poller`**: The background acquisition loop with its failure budget.
//! - **`recorder`**: Session clock, in-memory buffer and the append-only CSV log.
//! - **`session`**: The `SessionController` actor: connection and recording state machines,
//!   sample delivery to subscribers.
//! - **`messages`**: Commands sent from controller handles to the actor.
//! - **`measurement`**: `RawReading`, `Reading` and `Sample`.
//! - **`config`**: Figment-based layered configuration.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The crate-wide `DaqError` and the transport-level `ConnError`.
//!
//! ## Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use loadcell_daq::{config::Settings, session::SessionController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let controller = SessionController::spawn(&settings)?;
//! controller.connect().await?;
//!
//! let mut samples = controller.subscribe();
//! controller.start_recording("ensaio.txt").await?;
//! while let Some(sample) = samples.next().await {
//!     if sample.elapsed_seconds > 5.0 {
//!         break;
//!     }
//! }
//! let summary = controller.stop_recording().await?;
//! println!("{} samples written to {}", summary.sample_count, summary.path.display());
//! controller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod messages;
pub mod poller;
pub mod recorder;
pub mod session;

pub use calibration::CalibrationConfig;
pub use error::{AppResult, ConnError, ConnErrorKind, DaqError};
pub use measurement::{RawReading, Reading, Sample};
pub use session::{ConnectionState, EngineStatus, RecordingState, SessionController};
