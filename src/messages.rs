//! Message types for actor-based communication.
//!
//! This module defines the commands a [`SessionController`](crate::session::SessionController)
//! handle sends to the session actor. Commands travel over an mpsc channel and each variant
//! carries a oneshot sender for its reply.
//!
//! # Message Flow
//!
//! ```text
//! Caller                             Session actor
//! ------                             -------------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                    3. Receive command
//!                                    4. Process (mutate state)
//!                                    5. Send response
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Each variant has a helper that builds the command and returns the receiver to await:
//!
//! ```rust
//! use loadcell_daq::messages::SessionCommand;
//!
//! let (cmd, rx) = SessionCommand::stop_recording();
//! // cmd_tx.send(cmd).await?;
//! // let summary = rx.await??;
//! ```

use crate::error::AppResult;
use crate::hardware::TransportConfig;
use crate::recorder::SessionSummary;
use crate::session::EngineStatus;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Commands accepted by the session actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// Open the transport and start polling.
    ///
    /// Only valid while `Disconnected`. `None` uses the transport the engine was built with.
    Connect {
        /// Transport override for this connection.
        transport: Option<TransportConfig>,
        /// Response channel for the connect result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stop polling and close the transport.
    ///
    /// Valid from `Connected` and `Faulted`. An active recording is stopped first.
    Disconnect {
        /// Response channel for the disconnect result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Begin a recording session writing to `destination`.
    StartRecording {
        /// Log file path
        destination: PathBuf,
        /// Response channel for the start result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// End the recording session.
    StopRecording {
        /// Response channel carrying the session summary
        response: oneshot::Sender<AppResult<SessionSummary>>,
    },

    /// Snapshot of states and counters.
    GetStatus {
        /// Response channel for the snapshot
        response: oneshot::Sender<EngineStatus>,
    },

    /// Disconnect if needed and end the actor.
    ///
    /// After sending this command, the actor stops processing further commands.
    Shutdown {
        /// Response channel, answered once teardown is complete
        response: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    /// Helper to create a Connect command
    pub fn connect(
        transport: Option<TransportConfig>,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Connect {
                transport,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Disconnect command
    pub fn disconnect() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disconnect { response: tx }, rx)
    }

    /// Helper to create a StartRecording command
    pub fn start_recording(destination: PathBuf) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::StartRecording {
                destination,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a StopRecording command
    pub fn stop_recording() -> (Self, oneshot::Receiver<AppResult<SessionSummary>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopRecording { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<EngineStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::StartRecording { .. } => "start_recording",
            Self::StopRecording { .. } => "stop_recording",
            Self::GetStatus { .. } => "get_status",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_helper_pairs_reply_channel() {
        let (cmd, rx) = SessionCommand::stop_recording();
        assert_eq!(cmd.name(), "stop_recording");
        match cmd {
            SessionCommand::StopRecording { response } => {
                let summary = SessionSummary {
                    path: PathBuf::from("ensaio.txt"),
                    sample_count: 3,
                    duration: std::time::Duration::from_secs(1),
                    write_error: None,
                };
                response.send(Ok(summary.clone())).unwrap();
                assert_eq!(rx.await.unwrap().unwrap(), summary);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
