//! Background acquisition loop.
//!
//! The poller owns the transport while the connection is up. Every cycle it performs one
//! bounded read, calibrates the result and publishes a [`PollEvent`] to the session
//! controller, then waits out the poll interval.
//!
//! ## Channel semantics
//!
//! Events travel over a `tokio::sync::broadcast` ring of `event_capacity` slots. Sending never
//! blocks the poller: when the controller falls behind, the oldest pending event is
//! overwritten and the controller's next receive reports how many events it missed
//! (`RecvError::Lagged`). Recent data wins over stale data.
//!
//! ## Cancellation
//!
//! The loop reads the connection state from a `watch` channel written only by the controller.
//! It checks the state before every read and also wakes on a state change while waiting for
//! the next tick, so a disconnect never waits for a full interval. Reads themselves are bounded
//! by `read_timeout`. On exit the transport is handed back through the task's `JoinHandle`
//! together with the reason the loop ended.
//!
//! ## Failure budget
//!
//! Timeouts, protocol errors and undecodable frames increment a consecutive-failure counter;
//! any successful transport read resets it. `max_consecutive_failures` failures in a row are
//! tolerated, the next one faults the loop. A structural error (port gone) faults immediately.
//! A token that decodes but does not parse is dropped without touching the counter.

use crate::calibration::{calibrate, CalibrationConfig};
use crate::error::{ConnError, ConnErrorKind, DaqError};
use crate::hardware::Transport;
use crate::measurement::Reading;
use crate::session::ConnectionState;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Timing and failure policy for one poll loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Time between the starts of two reads.
    pub interval: Duration,
    /// Upper bound for a single read.
    pub read_timeout: Duration,
    /// Consecutive failures tolerated before the loop faults.
    pub max_consecutive_failures: u32,
    /// Slots in the event ring.
    pub event_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            read_timeout: Duration::from_secs(1),
            max_consecutive_failures: 3,
            event_capacity: 64,
        }
    }
}

/// What the poller reports to the controller.
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A calibrated reading.
    Reading(Reading),
    /// A read failed but the failure budget is not exhausted yet (or just was).
    ReadFailed {
        /// The failure.
        error: ConnError,
        /// Failures in a row, including this one.
        consecutive: u32,
    },
    /// A frame arrived but could not be turned into a value.
    FrameDropped {
        /// Why the frame was dropped.
        reason: String,
    },
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// The connection state left `Connected`.
    Cancelled,
    /// A structural error, or one failure too many.
    Faulted(ConnError),
}

/// Returned by the poll task when it ends.
pub struct PollerExit {
    /// The transport, still open; closing it is the controller's job.
    pub transport: Box<dyn Transport>,
    /// Why the loop ended.
    pub reason: ExitReason,
    /// Read attempts performed.
    pub cycles: u64,
}

impl std::fmt::Debug for PollerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerExit")
            .field("transport", &self.transport.describe())
            .field("reason", &self.reason)
            .field("cycles", &self.cycles)
            .finish()
    }
}

/// The controller's end of a running poller.
pub struct PollerLink {
    /// Event ring receiver.
    pub events: broadcast::Receiver<PollEvent>,
    /// Resolves to the transport once the loop has ended.
    pub handle: JoinHandle<PollerExit>,
}

/// Spawns poll loops.
pub struct Poller;

impl Poller {
    /// Start polling `transport` until `state` leaves `Connected` or the link faults.
    pub fn spawn(
        transport: Box<dyn Transport>,
        calibration: CalibrationConfig,
        config: PollerConfig,
        state: watch::Receiver<ConnectionState>,
    ) -> PollerLink {
        let (events_tx, events) = broadcast::channel(config.event_capacity.max(1));
        let span = info_span!("poller", endpoint = %transport.describe());
        let handle =
            tokio::spawn(run(transport, calibration, config, state, events_tx).instrument(span));
        PollerLink { events, handle }
    }
}

async fn run(
    mut transport: Box<dyn Transport>,
    calibration: CalibrationConfig,
    config: PollerConfig,
    mut state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<PollEvent>,
) -> PollerExit {
    let endpoint = transport.describe();
    info!(
        endpoint = %endpoint,
        interval_ms = config.interval.as_millis() as u64,
        "Poll loop started"
    );

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u32 = 0;
    let mut cycles: u64 = 0;

    let reason = loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            break ExitReason::Cancelled;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    // Controller gone.
                    break ExitReason::Cancelled;
                }
                continue;
            }
        }

        if *state.borrow() != ConnectionState::Connected {
            break ExitReason::Cancelled;
        }

        cycles += 1;
        let outcome = match timeout(config.read_timeout, transport.read_one()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ConnError::new(
                ConnErrorKind::Timeout,
                endpoint.clone(),
                format!("no response within {:?}", config.read_timeout),
            )
            .into()),
        };

        let failure = match outcome {
            Ok(raw) => {
                failures = 0;
                match calibrate(&raw, &calibration) {
                    Ok(value) => {
                        let reading = Reading {
                            value,
                            raw,
                            polled_at: Instant::now(),
                        };
                        // No receiver only happens during controller teardown.
                        let _ = events.send(PollEvent::Reading(reading));
                    }
                    Err(err) => {
                        debug!(endpoint = %endpoint, raw = %raw, error = %err, "Frame dropped");
                        let _ = events.send(PollEvent::FrameDropped {
                            reason: err.to_string(),
                        });
                    }
                }
                continue;
            }
            Err(DaqError::Connection(err)) => err,
            Err(err) if err.is_frame_error() => {
                debug!(endpoint = %endpoint, error = %err, "Undecodable frame");
                let _ = events.send(PollEvent::FrameDropped {
                    reason: err.to_string(),
                });
                ConnError::new(ConnErrorKind::Protocol, endpoint.clone(), err.to_string())
            }
            Err(err) => ConnError::new(ConnErrorKind::Protocol, endpoint.clone(), err.to_string()),
        };

        if failure.is_structural() {
            error!(endpoint = %endpoint, error = %failure, "Link lost, poll loop faulted");
            break ExitReason::Faulted(failure);
        }

        failures += 1;
        let _ = events.send(PollEvent::ReadFailed {
            error: failure.clone(),
            consecutive: failures,
        });
        if failures > config.max_consecutive_failures {
            error!(
                endpoint = %endpoint,
                consecutive = failures,
                error = %failure,
                "Too many consecutive read failures, poll loop faulted"
            );
            break ExitReason::Faulted(failure);
        }
        warn!(
            endpoint = %endpoint,
            consecutive = failures,
            error = %failure,
            "Read failed"
        );
    };

    info!(endpoint = %endpoint, cycles, reason = ?reason, "Poll loop stopped");
    PollerExit {
        transport,
        reason,
        cycles,
    }
}
