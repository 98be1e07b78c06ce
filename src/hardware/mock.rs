//! Scripted test double for the transport layer.
//!
//! A [`MockTransport`] replays a queue of [`MockResponse`]s and then repeats a fallback
//! response forever. Every call to `read_one` is counted through a shared [`MockTracker`], so
//! tests can assert exactly how many reads the poller issued even after the transport has been
//! moved into the engine.
//!
//! [`MockOpener`] hands out prepared transports in order, standing in for the serial port
//! layer when testing the session controller.

use super::{Transport, TransportConfig, TransportOpener};
use crate::error::{AppResult, ConnError, ConnErrorKind, DaqError};
use crate::measurement::RawReading;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MOCK_ENDPOINT: &str = "mock";

/// One scripted outcome of `read_one`.
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// Answer with a register code.
    Register(u16),
    /// Answer with a text token.
    Line(String),
    /// Never answer; the poller's read timeout fires.
    Timeout,
    /// Answer with a frame that does not decode.
    Malformed,
    /// Answer with a protocol error (CRC mismatch, exception response).
    ProtocolError,
    /// The device disappears.
    Unplugged,
}

/// Shared view of a mock transport's activity.
#[derive(Debug, Clone, Default)]
pub struct MockTracker {
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl MockTracker {
    /// Number of `read_one` calls issued so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transport that replays a script.
#[derive(Debug)]
pub struct MockTransport {
    script: VecDeque<MockResponse>,
    fallback: MockResponse,
    latency: Option<Duration>,
    tracker: MockTracker,
}

impl MockTransport {
    /// Replay `script`, then keep answering with `fallback`.
    pub fn new(script: impl IntoIterator<Item = MockResponse>, fallback: MockResponse) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback,
            latency: None,
            tracker: MockTracker::default(),
        }
    }

    /// A healthy device answering the same register code forever.
    pub fn steady(code: u16) -> Self {
        Self::new([], MockResponse::Register(code))
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Handle for observing this transport after it has been handed off.
    pub fn tracker(&self) -> MockTracker {
        self.tracker.clone()
    }

    fn error(kind: ConnErrorKind, message: &str) -> DaqError {
        ConnError::new(kind, MOCK_ENDPOINT, message).into()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_one(&mut self) -> AppResult<RawReading> {
        self.tracker.reads.fetch_add(1, Ordering::SeqCst);
        if self.tracker.is_closed() {
            return Err(Self::error(ConnErrorKind::Closed, "transport already closed"));
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let response = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match response {
            MockResponse::Register(code) => Ok(RawReading::Register(code)),
            MockResponse::Line(token) => Ok(RawReading::Token(token)),
            MockResponse::Timeout => std::future::pending().await,
            MockResponse::Malformed => Err(DaqError::Decode("scripted malformed frame".into())),
            MockResponse::ProtocolError => {
                Err(Self::error(ConnErrorKind::Protocol, "scripted CRC mismatch"))
            }
            MockResponse::Unplugged => {
                Err(Self::error(ConnErrorKind::Closed, "scripted device unplug"))
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.tracker.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        MOCK_ENDPOINT.to_string()
    }
}

/// Opener that hands out prepared mock transports in order.
///
/// Once the queue is exhausted every further open fails with an `Open` error.
#[derive(Debug, Default)]
pub struct MockOpener {
    transports: Mutex<VecDeque<MockTransport>>,
    opens: AtomicUsize,
}

impl MockOpener {
    /// Serve `transports` one per `open` call.
    pub fn new(transports: impl IntoIterator<Item = MockTransport>) -> Self {
        Self {
            transports: Mutex::new(transports.into_iter().collect()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Number of `open` calls, successful or not.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportOpener for MockOpener {
    async fn open(&self, config: &TransportConfig) -> AppResult<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(ConnError::new(
                ConnErrorKind::Open,
                config.endpoint(),
                "no device attached",
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let mut transport = MockTransport::new(
            [MockResponse::Line("1.5".into()), MockResponse::Malformed],
            MockResponse::Register(9),
        );
        let tracker = transport.tracker();

        assert_eq!(
            transport.read_one().await.unwrap(),
            RawReading::Token("1.5".into())
        );
        assert!(matches!(transport.read_one().await, Err(DaqError::Decode(_))));
        assert_eq!(transport.read_one().await.unwrap(), RawReading::Register(9));
        assert_eq!(transport.read_one().await.unwrap(), RawReading::Register(9));
        assert_eq!(tracker.reads(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_answers() {
        let mut transport = MockTransport::new([MockResponse::Timeout], MockResponse::Register(0));
        let result =
            tokio::time::timeout(Duration::from_secs(1), transport.read_one()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_observable() {
        let mut transport = MockTransport::steady(1);
        let tracker = transport.tracker();
        transport.close().await.unwrap();
        assert!(tracker.is_closed());
        match transport.read_one().await {
            Err(DaqError::Connection(err)) => assert!(err.is_structural()),
            other => panic!("expected closed link, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_opener_runs_dry() {
        let opener = MockOpener::new([MockTransport::steady(1)]);
        let config = TransportConfig::default();
        assert!(opener.open(&config).await.is_ok());
        match opener.open(&config).await {
            Err(DaqError::Connection(err)) => assert_eq!(err.kind, ConnErrorKind::Open),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opener should be exhausted"),
        }
        assert_eq!(opener.opens(), 2);
    }
}
