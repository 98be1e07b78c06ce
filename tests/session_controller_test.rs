//! Integration tests for the session controller state machine.
//!
//! All tests run with paused time: the mock transport answers instantly, timeouts elapse as
//! soon as every task is idle, and elapsed-time assertions are exact.

use futures::StreamExt;
use loadcell_daq::calibration::CalibrationConfig;
use loadcell_daq::config::AcquisitionConfig;
use loadcell_daq::hardware::mock::{MockOpener, MockResponse, MockTransport};
use loadcell_daq::hardware::TransportConfig;
use loadcell_daq::session::{ConnectionState, RecordingState, SessionController};
use loadcell_daq::{ConnErrorKind, DaqError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn acquisition() -> AcquisitionConfig {
    AcquisitionConfig {
        poll_interval_ms: Some(POLL_INTERVAL.as_millis() as u64),
        ..AcquisitionConfig::default()
    }
}

fn spawn(opener: Arc<MockOpener>) -> SessionController {
    SessionController::spawn_with_opener(
        CalibrationConfig::with_capacity(100.0),
        acquisition(),
        TransportConfig::default(),
        opener,
    )
    .expect("valid engine configuration")
}

fn log_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("log file readable")
        .lines()
        .map(str::to_string)
        .collect()
}

fn assert_invalid_state<T: std::fmt::Debug>(result: Result<T, DaqError>) {
    match result {
        Err(DaqError::InvalidState { .. }) => {}
        other => panic!("expected InvalidState, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_operations_rejected_in_wrong_state() {
    let opener = Arc::new(MockOpener::new([MockTransport::steady(1000)]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();

    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    assert_invalid_state(controller.disconnect().await);
    assert_invalid_state(controller.start_recording(dir.path().join("a.txt")).await);
    assert_invalid_state(controller.stop_recording().await);
    assert!(!dir.path().join("a.txt").exists());

    controller.connect().await.unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Connected);
    assert_invalid_state(controller.connect().await);
    assert_invalid_state(controller.stop_recording().await);

    controller.disconnect().await.unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_open_returns_to_disconnected() {
    let opener = Arc::new(MockOpener::default());
    let controller = spawn(opener.clone());

    match controller.connect().await {
        Err(DaqError::Connection(err)) => assert_eq!(err.kind, ConnErrorKind::Open),
        other => panic!("expected open failure, got {:?}", other),
    }
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    assert_eq!(opener.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recording_writes_one_line_per_sample() {
    let opener = Arc::new(MockOpener::new([MockTransport::steady(16384)]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ensaio.txt");

    controller.connect().await.unwrap();
    controller.start_recording(&path).await.unwrap();
    // Everything broadcast from here on was also recorded.
    let mut samples = controller.subscribe();
    assert_eq!(controller.recording_state(), RecordingState::Recording);

    let received: Vec<_> = samples.by_ref().take(10).collect().await;
    let summary = controller.stop_recording().await.unwrap();
    assert_eq!(controller.recording_state(), RecordingState::Idle);

    assert!(summary.sample_count >= received.len());
    assert_eq!(summary.path, path);
    assert!(summary.write_error.is_none());

    let lines = log_lines(&path);
    assert_eq!(lines.len(), summary.sample_count + 1);
    assert_eq!(lines[0], "Tempo (s),Forca (kgf)");

    let mut previous = 0.0;
    for line in &lines[1..] {
        let (elapsed, value) = line.split_once(',').unwrap();
        let elapsed: f64 = elapsed.parse().unwrap();
        assert!(elapsed >= previous, "elapsed went backwards in {:?}", lines);
        previous = elapsed;
        // 16384 / 32767 * 100
        assert_eq!(value, "50.0015");
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected_without_resetting_session() {
    let opener = Arc::new(MockOpener::new([MockTransport::steady(100)]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");

    controller.connect().await.unwrap();
    controller.start_recording(&first).await.unwrap();
    let mut samples = controller.subscribe();
    let _ = samples.by_ref().take(3).collect::<Vec<_>>().await;

    let before = controller.status().await.unwrap().session_samples;
    assert!(before >= 3);

    assert_invalid_state(controller.start_recording(&second).await);
    assert!(!second.exists());

    let status = controller.status().await.unwrap();
    assert_eq!(status.recording, RecordingState::Recording);
    assert_eq!(status.log_path.as_deref(), Some(first.as_path()));
    assert!(status.session_samples >= before);

    let summary = controller.stop_recording().await.unwrap();
    assert_eq!(log_lines(&first).len(), summary.sample_count + 1);
}

#[tokio::test(start_paused = true)]
async fn test_unplug_while_recording_faults_and_closes_log() {
    let script: Vec<_> = (1..=5).map(|i| MockResponse::Register(i * 100)).collect();
    let transport = MockTransport::new(script, MockResponse::Unplugged);
    let tracker = transport.tracker();
    let opener = Arc::new(MockOpener::new([transport]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fault.txt");

    let mut connection = controller.watch_connection();
    let recording = controller.watch_recording();
    controller.connect().await.unwrap();
    controller.start_recording(&path).await.unwrap();

    connection
        .wait_for(|state| *state == ConnectionState::Faulted)
        .await
        .unwrap();
    // Recording is forced idle before the fault is published.
    assert_eq!(*recording.borrow(), RecordingState::Idle);

    let status = controller.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Faulted);
    assert_eq!(status.recording, RecordingState::Idle);
    assert!(status.fault.as_ref().is_some_and(|f| f.is_structural()));
    assert!(tracker.is_closed());

    let summary = status.last_session.expect("forced stop leaves a summary");
    assert_eq!(summary.path, path);
    assert_eq!(log_lines(&path).len(), summary.sample_count + 1);
    // Only the reading polled before start_recording can be missing from the log.
    assert!(
        (4..=5).contains(&summary.sample_count),
        "readings queued before the unplug must be kept, got {}",
        summary.sample_count
    );

    assert_invalid_state(controller.stop_recording().await);
}

#[tokio::test(start_paused = true)]
async fn test_fourth_timeout_faults_connection() {
    let mut script = vec![MockResponse::Register(10); 2];
    script.extend(vec![MockResponse::Timeout; 4]);
    let transport = MockTransport::new(script, MockResponse::Register(10));
    let tracker = transport.tracker();
    let opener = Arc::new(MockOpener::new([transport]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timeouts.txt");

    let mut connection = controller.watch_connection();
    controller.connect().await.unwrap();
    controller.start_recording(&path).await.unwrap();
    connection
        .wait_for(|state| *state == ConnectionState::Faulted)
        .await
        .unwrap();

    let status = controller.status().await.unwrap();
    assert_eq!(status.recording, RecordingState::Idle);
    assert_eq!(
        status.fault.as_ref().map(|f| f.kind),
        Some(ConnErrorKind::Timeout)
    );
    assert_eq!(status.read_failures, 4);
    assert_eq!(tracker.reads(), 6);
    assert!(tracker.is_closed());

    let summary = status.last_session.expect("session closed by the fault");
    assert_eq!(log_lines(&path).len(), summary.sample_count + 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_polling_within_one_interval() {
    let transport = MockTransport::steady(500);
    let tracker = transport.tracker();
    let opener = Arc::new(MockOpener::new([transport]));
    let controller = spawn(opener);

    controller.connect().await.unwrap();
    let mut samples = controller.subscribe();
    let _ = samples.by_ref().take(3).collect::<Vec<_>>().await;

    let requested = Instant::now();
    controller.disconnect().await.unwrap();
    assert!(requested.elapsed() <= POLL_INTERVAL);
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

    let reads_at_disconnect = tracker.reads();
    assert!(tracker.is_closed());
    tokio::time::sleep(POLL_INTERVAL * 10).await;
    assert_eq!(tracker.reads(), reads_at_disconnect);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_recording_closes_session() {
    let opener = Arc::new(MockOpener::new([MockTransport::steady(2000)]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disconnect.txt");

    controller.connect().await.unwrap();
    controller.start_recording(&path).await.unwrap();
    let mut samples = controller.subscribe();
    let _ = samples.by_ref().take(2).collect::<Vec<_>>().await;
    controller.disconnect().await.unwrap();

    let status = controller.status().await.unwrap();
    assert_eq!(status.recording, RecordingState::Idle);
    let summary = status.last_session.unwrap();
    assert!(summary.sample_count >= 2);
    assert_eq!(log_lines(&path).len(), summary.sample_count + 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_automatic_reconnect_after_fault() {
    let first = MockTransport::new([MockResponse::Register(1)], MockResponse::Unplugged);
    let second = MockTransport::steady(2);
    let opener = Arc::new(MockOpener::new([first, second]));
    let controller = spawn(opener.clone());

    let mut connection = controller.watch_connection();
    controller.connect().await.unwrap();
    connection
        .wait_for(|state| *state == ConnectionState::Faulted)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(controller.connection_state(), ConnectionState::Faulted);
    assert_eq!(opener.opens(), 1);

    // Faulted requires an explicit disconnect first.
    assert_invalid_state(controller.connect().await);
    controller.disconnect().await.unwrap();
    assert!(controller.status().await.unwrap().fault.is_some());

    controller.connect().await.unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Connected);
    assert_eq!(opener.opens(), 2);
    assert!(controller.status().await.unwrap().fault.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_bad_frames_are_counted_not_fatal() {
    let script = vec![
        MockResponse::Line("12.5".into()),
        MockResponse::Line("ST,GS".into()),
        MockResponse::Malformed,
        MockResponse::Line("13.0".into()),
    ];
    let transport = MockTransport::new(script, MockResponse::Line("13.5".into()));
    let opener = Arc::new(MockOpener::new([transport]));
    let controller = spawn(opener);

    controller.connect().await.unwrap();
    let mut samples = controller.subscribe();
    let values: Vec<f64> = samples
        .by_ref()
        .take(3)
        .map(|sample| sample.value)
        .collect()
        .await;

    // Subscription starts after connect, so the first reading may already be gone.
    assert!(values.contains(&13.0));
    assert!(values.contains(&13.5));

    let status = controller.status().await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert_eq!(status.frames_dropped, 2);
    assert_eq!(status.read_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_everything() {
    let transport = MockTransport::steady(10);
    let tracker = transport.tracker();
    let opener = Arc::new(MockOpener::new([transport]));
    let controller = spawn(opener);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shutdown.txt");

    controller.connect().await.unwrap();
    controller.start_recording(&path).await.unwrap();
    controller.shutdown().await.unwrap();

    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    assert_eq!(controller.recording_state(), RecordingState::Idle);
    assert!(tracker.is_closed());
    assert_eq!(log_lines(&path)[0], "Tempo (s),Forca (kgf)");

    assert!(matches!(
        controller.status().await,
        Err(DaqError::ControllerUnavailable)
    ));
}
