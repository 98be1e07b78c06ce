//! Session controller: connection lifecycle, recording lifecycle and sample delivery.
//!
//! The controller is an actor. A single Tokio task owns the transport configuration, the
//! running [`Poller`], the [`Recorder`] and every counter; callers hold a cheap, cloneable
//! [`SessionController`] handle that sends [`SessionCommand`]s and awaits the replies.
//!
//! # State machines
//!
//! ```text
//!                connect()                 open ok
//! Disconnected ───────────► Connecting ───────────► Connected
//!      ▲  ▲                     │ open failed          │  │
//!      │  └─────────────────────┘                      │  │ poller fault
//!      │            disconnect()                       │  ▼
//!      └───────────────────────────────────────────────┴─ Faulted
//!
//! Idle ──start_recording()──► Recording ──stop_recording() / leaving Connected──► Idle
//! ```
//!
//! Both states are published through `watch` channels written only by the actor. The poller
//! reads the connection state to know when to stop. When the connection leaves `Connected`
//! the recording is stopped first, so an observer that sees `Faulted` or `Disconnected`
//! always sees `Idle` as well.
//!
//! # Data flow
//!
//! ```text
//! Poller ──broadcast ring──► actor ──stamp──┬──► Recorder (CSV log)
//!                                           └──► subscribers (broadcast stream)
//! ```
//!
//! The actor never reconnects by itself: after a fault an explicit `disconnect()` is required
//! before the next `connect()`.

use crate::calibration::CalibrationConfig;
use crate::config::{AcquisitionConfig, Settings};
use crate::error::{AppResult, ConnError, ConnErrorKind, DaqError};
use crate::hardware::{DeviceOpener, TransportConfig, TransportOpener};
use crate::measurement::{Reading, Sample};
use crate::messages::SessionCommand;
use crate::poller::{ExitReason, PollEvent, Poller, PollerConfig, PollerExit, PollerLink};
use crate::recorder::{RecordOutcome, Recorder, SessionSummary};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport open.
    Disconnected,
    /// Transport is being opened.
    Connecting,
    /// Transport open, poller running.
    Connected,
    /// The poller stopped on an I/O error; `disconnect()` is required.
    Faulted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// Recording state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    /// No session.
    Idle,
    /// A session is writing to its log.
    Recording,
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingState::Idle => f.write_str("idle"),
            RecordingState::Recording => f.write_str("recording"),
        }
    }
}

/// Snapshot returned by [`SessionController::status`].
///
/// Counters cover the current (or last) connection and reset on `connect()`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    /// Link state.
    pub connection: ConnectionState,
    /// Recording state.
    pub recording: RecordingState,
    /// Transport description while connected.
    pub endpoint: Option<String>,
    /// Calibrated readings received from the poller.
    pub samples_received: u64,
    /// Frames that could not be turned into a value.
    pub frames_dropped: u64,
    /// Reads that failed (timeouts, protocol errors).
    pub read_failures: u64,
    /// Poller events overwritten before the controller could take them.
    pub events_lagged: u64,
    /// Samples the recorder refused as out of order.
    pub samples_rejected: u64,
    /// Most recent sample.
    pub last_sample: Option<Sample>,
    /// Samples in the active recording session.
    pub session_samples: usize,
    /// Active log destination.
    pub log_path: Option<PathBuf>,
    /// Last log write failure.
    pub storage_error: Option<String>,
    /// Error that faulted the connection.
    pub fault: Option<ConnError>,
    /// Summary of the most recently finished session.
    pub last_session: Option<SessionSummary>,
}

/// Handle to the session actor.
///
/// Cloning is cheap; all clones talk to the same actor.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<SessionCommand>,
    connection: watch::Receiver<ConnectionState>,
    recording: watch::Receiver<RecordingState>,
    samples: broadcast::Sender<Sample>,
}

impl SessionController {
    /// Spawn an engine for real (or simulated) hardware described by `settings`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(settings: &Settings) -> AppResult<Self> {
        Self::spawn_with_opener(
            settings.calibration.clone(),
            settings.acquisition.clone(),
            settings.transport.clone(),
            Arc::new(DeviceOpener),
        )
    }

    /// Spawn an engine that opens transports through `opener`.
    ///
    /// Calibration is fixed for the lifetime of the engine.
    pub fn spawn_with_opener(
        calibration: CalibrationConfig,
        acquisition: AcquisitionConfig,
        transport: TransportConfig,
        opener: Arc<dyn TransportOpener>,
    ) -> AppResult<Self> {
        calibration.validate()?;
        acquisition.validate()?;

        let (command_tx, command_rx) = mpsc::channel(acquisition.command_capacity.max(1));
        let (connection_tx, connection_rx) = watch::channel(ConnectionState::Disconnected);
        let (recording_tx, recording_rx) = watch::channel(RecordingState::Idle);
        let (samples_tx, _) = broadcast::channel(acquisition.sample_capacity.max(1));

        let actor = SessionActor {
            recorder: Recorder::new(calibration.unit.clone()),
            calibration,
            acquisition,
            transport,
            opener,
            connection: connection_tx,
            recording: recording_tx,
            samples: samples_tx.clone(),
            link: None,
            active_poller: None,
            endpoint: None,
            connected_at: None,
            counters: Counters::default(),
            last_sample: None,
            storage_error: None,
            fault: None,
            last_session: None,
        };
        tokio::spawn(actor.run(command_rx).instrument(info_span!("session")));

        Ok(Self {
            commands: command_tx,
            connection: connection_rx,
            recording: recording_rx,
            samples: samples_tx,
        })
    }

    async fn request<T>(
        &self,
        command: SessionCommand,
        reply: oneshot::Receiver<T>,
    ) -> AppResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DaqError::ControllerUnavailable)?;
        reply.await.map_err(|_| DaqError::ControllerUnavailable)
    }

    /// Open the configured transport and start polling.
    #[instrument(skip(self), err)]
    pub async fn connect(&self) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::connect(None);
        self.request(cmd, rx).await?
    }

    /// Open `transport` instead of the configured one; it becomes the new default.
    #[instrument(skip(self, transport), fields(endpoint = %transport.endpoint()), err)]
    pub async fn connect_to(&self, transport: TransportConfig) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::connect(Some(transport));
        self.request(cmd, rx).await?
    }

    /// Stop polling and close the transport. Valid from `Connected` and `Faulted`.
    #[instrument(skip(self), err)]
    pub async fn disconnect(&self) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::disconnect();
        self.request(cmd, rx).await?
    }

    /// Begin recording to `destination`. Only valid while `Connected` and `Idle`.
    #[instrument(skip(self, destination), fields(path = %destination.as_ref().display()), err)]
    pub async fn start_recording(&self, destination: impl AsRef<std::path::Path>) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::start_recording(destination.as_ref().to_path_buf());
        self.request(cmd, rx).await?
    }

    /// End the recording session and return its summary.
    #[instrument(skip(self), err)]
    pub async fn stop_recording(&self) -> AppResult<SessionSummary> {
        let (cmd, rx) = SessionCommand::stop_recording();
        self.request(cmd, rx).await?
    }

    /// Snapshot of states and counters.
    pub async fn status(&self) -> AppResult<EngineStatus> {
        let (cmd, rx) = SessionCommand::get_status();
        self.request(cmd, rx).await
    }

    /// Disconnect if needed and stop the actor. Later requests fail with
    /// [`DaqError::ControllerUnavailable`].
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::shutdown();
        self.request(cmd, rx).await
    }

    /// Samples from the next one onwards.
    ///
    /// A subscriber that falls more than `sample_capacity` samples behind skips the ones it
    /// missed instead of slowing the engine down.
    pub fn subscribe(&self) -> BoxStream<'static, Sample> {
        BroadcastStream::new(self.samples.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(sample) => Some(sample),
                    Err(lagged) => {
                        debug!(error = %lagged, "Sample subscriber lagged");
                        None
                    }
                }
            })
            .boxed()
    }

    /// Connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Recording state changes.
    pub fn watch_recording(&self) -> watch::Receiver<RecordingState> {
        self.recording.clone()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Current recording state.
    pub fn recording_state(&self) -> RecordingState {
        *self.recording.borrow()
    }
}

#[derive(Debug, Default)]
struct Counters {
    samples_received: u64,
    frames_dropped: u64,
    read_failures: u64,
    events_lagged: u64,
    samples_rejected: u64,
}

enum LinkEvent {
    Poll(PollEvent),
    Lagged(u64),
    Closed,
}

async fn next_link_event(link: &mut Option<PollerLink>) -> LinkEvent {
    match link {
        Some(link) => match link.events.recv().await {
            Ok(event) => LinkEvent::Poll(event),
            Err(RecvError::Lagged(missed)) => LinkEvent::Lagged(missed),
            Err(RecvError::Closed) => LinkEvent::Closed,
        },
        None => std::future::pending().await,
    }
}

struct SessionActor {
    calibration: CalibrationConfig,
    acquisition: AcquisitionConfig,
    transport: TransportConfig,
    opener: Arc<dyn TransportOpener>,
    connection: watch::Sender<ConnectionState>,
    recording: watch::Sender<RecordingState>,
    samples: broadcast::Sender<Sample>,
    recorder: Recorder,
    link: Option<PollerLink>,
    active_poller: Option<PollerConfig>,
    endpoint: Option<String>,
    connected_at: Option<Instant>,
    counters: Counters,
    last_sample: Option<Sample>,
    storage_error: Option<String>,
    fault: Option<ConnError>,
    last_session: Option<SessionSummary>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("Session actor started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown { response }) => {
                        self.teardown().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All controller handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                event = next_link_event(&mut self.link) => self.on_link_event(event).await,
            }
        }

        info!("Session actor stopped");
    }

    async fn handle(&mut self, command: SessionCommand) {
        debug!(command = command.name(), "Command received");
        match command {
            SessionCommand::Connect {
                transport,
                response,
            } => {
                let result = self.connect(transport).await;
                let _ = response.send(result);
            }
            SessionCommand::Disconnect { response } => {
                let result = self.disconnect().await;
                let _ = response.send(result);
            }
            SessionCommand::StartRecording {
                destination,
                response,
            } => {
                let result = self.start_recording(destination);
                let _ = response.send(result);
            }
            SessionCommand::StopRecording { response } => {
                let result = self.stop_recording();
                let _ = response.send(result);
            }
            SessionCommand::GetStatus { response } => {
                let _ = response.send(self.status());
            }
            SessionCommand::Shutdown { response } => {
                // Handled by the run loop; answer anyway so the caller never hangs.
                self.teardown().await;
                let _ = response.send(());
            }
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    fn recording_state(&self) -> RecordingState {
        *self.recording.borrow()
    }

    fn invalid(&self, operation: &'static str) -> DaqError {
        DaqError::InvalidState {
            operation,
            connection: self.connection_state(),
            recording: self.recording_state(),
        }
    }

    async fn connect(&mut self, transport: Option<TransportConfig>) -> AppResult<()> {
        if self.connection_state() != ConnectionState::Disconnected {
            return Err(self.invalid("connect"));
        }
        if let Some(transport) = transport {
            transport.validate()?;
            self.transport = transport;
        }

        let endpoint = self.transport.endpoint();
        self.connection.send_replace(ConnectionState::Connecting);
        info!(endpoint = %endpoint, "Connecting");

        let opened = match timeout(
            self.acquisition.open_timeout(),
            self.opener.open(&self.transport),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(ConnError::new(
                ConnErrorKind::Timeout,
                endpoint.clone(),
                format!("open did not complete within {:?}", self.acquisition.open_timeout()),
            )
            .into()),
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "Connection failed");
                self.connection.send_replace(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        let poller_config = self.acquisition.poller_config(&self.transport);
        self.counters = Counters::default();
        self.last_sample = None;
        self.fault = None;
        self.endpoint = Some(transport.describe());
        self.connected_at = Some(Instant::now());
        self.connection.send_replace(ConnectionState::Connected);
        self.link = Some(Poller::spawn(
            transport,
            self.calibration.clone(),
            poller_config.clone(),
            self.connection.subscribe(),
        ));
        self.active_poller = Some(poller_config);
        info!(endpoint = %endpoint, "Connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Faulted => {}
            _ => return Err(self.invalid("disconnect")),
        }

        self.force_stop_recording();
        self.connection.send_replace(ConnectionState::Disconnected);
        if let Some(link) = self.link.take() {
            self.reap(link).await;
        }
        self.active_poller = None;
        self.connected_at = None;
        let endpoint = self.endpoint.take();
        info!(endpoint = ?endpoint, "Disconnected");
        Ok(())
    }

    /// Wait for a cancelled poller to hand the transport back, then close it.
    async fn reap(&mut self, link: PollerLink) {
        let PollerLink { events, mut handle } = link;
        drop(events);

        let read_timeout = self
            .active_poller
            .as_ref()
            .map_or_else(|| self.acquisition.read_timeout(), |p| p.read_timeout);
        let grace = read_timeout.saturating_add(self.acquisition.shutdown_grace());

        match timeout(grace, &mut handle).await {
            Ok(Ok(exit)) => {
                debug!(cycles = exit.cycles, reason = ?exit.reason, "Poll task joined");
                close_transport(exit).await;
            }
            Ok(Err(join_error)) => {
                error!(error = %join_error, "Poll task failed");
            }
            Err(_elapsed) => {
                warn!(grace_ms = grace.as_millis() as u64, "Poll task did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn start_recording(&mut self, destination: PathBuf) -> AppResult<()> {
        if self.connection_state() != ConnectionState::Connected
            || self.recording_state() != RecordingState::Idle
        {
            return Err(self.invalid("start recording"));
        }

        if let Err(err) = self.recorder.start(Instant::now(), &destination) {
            self.storage_error = Some(err.to_string());
            return Err(err);
        }
        self.storage_error = None;
        self.recording.send_replace(RecordingState::Recording);
        Ok(())
    }

    fn stop_recording(&mut self) -> AppResult<SessionSummary> {
        if self.recording_state() != RecordingState::Recording {
            return Err(self.invalid("stop recording"));
        }
        self.force_stop_recording()
            .ok_or_else(|| self.invalid("stop recording"))
    }

    /// Close the active session, if any, and publish `Idle`.
    fn force_stop_recording(&mut self) -> Option<SessionSummary> {
        let summary = self.recorder.finish()?;
        self.recording.send_replace(RecordingState::Idle);
        if let Some(write_error) = &summary.write_error {
            self.storage_error = Some(write_error.clone());
        }
        self.last_session = Some(summary.clone());
        Some(summary)
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Poll(PollEvent::Reading(reading)) => self.on_reading(reading),
            LinkEvent::Poll(PollEvent::ReadFailed { error, consecutive }) => {
                self.counters.read_failures += 1;
                debug!(error = %error, consecutive, "Poller reported read failure");
            }
            LinkEvent::Poll(PollEvent::FrameDropped { reason }) => {
                self.counters.frames_dropped += 1;
                debug!(reason = %reason, "Poller dropped a frame");
            }
            LinkEvent::Lagged(missed) => {
                self.counters.events_lagged += missed;
                warn!(missed, "Controller fell behind the poller, oldest events dropped");
            }
            LinkEvent::Closed => self.on_poller_finished().await,
        }
    }

    fn on_reading(&mut self, reading: Reading) {
        let accepted_at = Instant::now();
        self.counters.samples_received += 1;

        let sample = match self.recorder.accept(&reading, accepted_at) {
            Some(sample) => {
                match self.recorder.record(sample.clone()) {
                    Ok(RecordOutcome::Rejected) => self.counters.samples_rejected += 1,
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "Sample could not be written to the session log");
                        self.storage_error = Some(err.to_string());
                    }
                }
                sample
            }
            None => Sample::stamp(
                &reading,
                self.connected_at.unwrap_or(accepted_at),
                accepted_at,
            ),
        };

        self.last_sample = Some(sample.clone());
        // No subscribers is fine.
        let _ = self.samples.send(sample);
    }

    /// The poller ended on its own: collect the transport and handle the fault.
    async fn on_poller_finished(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        self.active_poller = None;

        let outcome = link.handle.await;
        let fault = match &outcome {
            Ok(exit) => match &exit.reason {
                ExitReason::Faulted(err) => Some(err.clone()),
                ExitReason::Cancelled => None,
            },
            Err(join_error) => {
                error!(error = %join_error, "Poll task failed");
                let endpoint = self.endpoint.clone().unwrap_or_default();
                Some(ConnError::new(
                    ConnErrorKind::Closed,
                    endpoint,
                    join_error.to_string(),
                ))
            }
        };
        let exit = outcome.ok();

        let Some(fault) = fault else {
            debug!("Poll task ended after cancellation");
            if let Some(exit) = exit {
                close_transport(exit).await;
            }
            return;
        };

        if let Some(summary) = self.force_stop_recording() {
            warn!(
                samples = summary.sample_count,
                path = %summary.path.display(),
                "Recording stopped by connection fault"
            );
        }
        if let Some(exit) = exit {
            close_transport(exit).await;
        }
        error!(error = %fault, "Connection faulted; disconnect required");
        self.fault = Some(fault);
        self.connection.send_replace(ConnectionState::Faulted);
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            connection: self.connection_state(),
            recording: self.recording_state(),
            endpoint: self.endpoint.clone(),
            samples_received: self.counters.samples_received,
            frames_dropped: self.counters.frames_dropped,
            read_failures: self.counters.read_failures,
            events_lagged: self.counters.events_lagged,
            samples_rejected: self.counters.samples_rejected,
            last_sample: self.last_sample.clone(),
            session_samples: self.recorder.samples().len(),
            log_path: self.recorder.path().map(|p| p.to_path_buf()),
            storage_error: self.storage_error.clone(),
            fault: self.fault.clone(),
            last_session: self.last_session.clone(),
        }
    }

    async fn teardown(&mut self) {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Faulted => {
                if let Err(err) = self.disconnect().await {
                    warn!(error = %err, "Disconnect during shutdown failed");
                }
            }
            _ => {
                self.force_stop_recording();
            }
        }
    }
}

async fn close_transport(exit: PollerExit) {
    let mut transport = exit.transport;
    if let Err(err) = transport.close().await {
        warn!(endpoint = %transport.describe(), error = %err, "Closing transport failed");
    }
}
