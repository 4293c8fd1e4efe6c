/// `controller.rs` — PTT and frequency control
///
/// Wraps the pluggable transport with engine-side state: PTT and frequency
/// tracking, idempotent no-op-safe PTT on a dead link, disconnect events,
/// and an optional auto-reconnect loop. Transport calls may block on I/O and
/// run on blocking tasks; the controller handle itself is cheap to clone.
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::{EngineError, Result};
use crate::radio::transport::RadioTransport;

#[derive(Debug, Clone)]
pub enum RadioEvent {
    Connected { reconnect_attempts: u32 },
    Disconnected { reason: String },
    FrequencyChanged { hz: u64 },
    Error { message: String },
}

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 6;

struct Inner {
    transport: Mutex<Box<dyn RadioTransport>>,
    connected: AtomicBool,
    ptt: AtomicBool,
    frequency_hz: AtomicU64,
    reconnect_attempts: AtomicU32,
    auto_reconnect: AtomicBool,
    reconnecting: AtomicBool,
    tx: UnboundedSender<RadioEvent>,
}

#[derive(Clone)]
pub struct RadioController {
    inner: Arc<Inner>,
}

impl RadioController {
    pub fn new(transport: Box<dyn RadioTransport>, tx: UnboundedSender<RadioEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: Mutex::new(transport),
                connected: AtomicBool::new(false),
                ptt: AtomicBool::new(false),
                frequency_hz: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                auto_reconnect: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                tx,
            }),
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            inner.transport.lock().unwrap().connect()
        })
        .await
        .map_err(|e| EngineError::RadioTransport(e.to_string()))?;

        match result {
            Ok(()) => {
                self.inner.connected.store(true, Ordering::SeqCst);
                let attempts = self.inner.reconnect_attempts.load(Ordering::SeqCst);
                let _ = self.inner.tx.send(RadioEvent::Connected {
                    reconnect_attempts: attempts,
                });
                Ok(())
            }
            Err(e) => {
                let _ = self.inner.tx.send(RadioEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.ptt.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            inner.transport.lock().unwrap().disconnect()
        })
        .await;
        let _ = self.inner.tx.send(RadioEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Synchronous connect for the resource lifecycle (transport calls are
    /// quick: a socket dial or serial open).
    pub fn connect_blocking(&self) -> Result<()> {
        let result = self.inner.transport.lock().unwrap().connect();
        match result {
            Ok(()) => {
                self.inner.connected.store(true, Ordering::SeqCst);
                let attempts = self.inner.reconnect_attempts.load(Ordering::SeqCst);
                let _ = self.inner.tx.send(RadioEvent::Connected {
                    reconnect_attempts: attempts,
                });
                Ok(())
            }
            Err(e) => {
                let _ = self.inner.tx.send(RadioEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Synchronous counterpart of `disconnect`.
    pub fn disconnect_blocking(&self, reason: &str) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.ptt.store(false, Ordering::SeqCst);
        let _ = self.inner.transport.lock().unwrap().disconnect();
        let _ = self.inner.tx.send(RadioEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Transport-level failure noticed mid-operation: mark down, emit, and
    /// kick the reconnect loop when enabled.
    fn handle_link_loss(&self, reason: &str) {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        self.inner.ptt.store(false, Ordering::SeqCst);
        if !was_connected {
            return;
        }
        let _ = self.inner.tx.send(RadioEvent::Disconnected {
            reason: reason.to_string(),
        });
        if self.inner.auto_reconnect.load(Ordering::SeqCst) {
            self.spawn_reconnect_loop();
        }
    }

    fn spawn_reconnect_loop(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        tokio::spawn(async move {
            for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
                tokio::time::sleep(RECONNECT_DELAY).await;
                controller
                    .inner
                    .reconnect_attempts
                    .store(attempt, Ordering::SeqCst);
                log::info!("radio reconnect attempt {attempt}/{MAX_RECONNECT_ATTEMPTS}");
                if controller.connect().await.is_ok() {
                    controller.inner.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
            }
            controller.inner.reconnecting.store(false, Ordering::SeqCst);
            log::warn!("radio reconnect gave up after {MAX_RECONNECT_ATTEMPTS} attempts");
        });
    }

    // ── PTT ───────────────────────────────────────────────────────────────

    /// Idempotent; succeeds as a state-only update when the link is down so
    /// a dead rig never wedges the transmit pipeline.
    pub async fn set_ptt(&self, on: bool) -> Result<()> {
        self.inner.ptt.store(on, Ordering::SeqCst);
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            inner.transport.lock().unwrap().set_ptt(on)
        })
        .await
        .map_err(|e| EngineError::RadioTransport(e.to_string()))?;

        if let Err(e) = result {
            self.handle_link_loss(&e.to_string());
            return Err(e);
        }
        Ok(())
    }

    pub fn is_ptt(&self) -> bool {
        self.inner.ptt.load(Ordering::SeqCst)
    }

    // ── Frequency ─────────────────────────────────────────────────────────

    pub async fn set_frequency(&self, hz: u64) -> Result<()> {
        self.inner.frequency_hz.store(hz, Ordering::SeqCst);
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            inner.transport.lock().unwrap().set_frequency(hz)
        })
        .await
        .map_err(|e| EngineError::RadioTransport(e.to_string()))?;

        match result {
            Ok(()) => {
                let _ = self.inner.tx.send(RadioEvent::FrequencyChanged { hz });
                Ok(())
            }
            Err(e) => {
                self.handle_link_loss(&e.to_string());
                Err(e)
            }
        }
    }

    pub fn get_frequency(&self) -> u64 {
        self.inner.frequency_hz.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Let tests and the engine report an externally observed link loss.
    pub fn report_disconnect(&self, reason: &str) {
        self.handle_link_loss(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::transport::mock::{MockOp, MockTransport};
    use tokio::sync::mpsc::unbounded_channel;

    fn controller() -> (RadioController, MockTransport, tokio::sync::mpsc::UnboundedReceiver<RadioEvent>) {
        let mock = MockTransport::default();
        let (tx, rx) = unbounded_channel();
        let c = RadioController::new(Box::new(mock.clone()), tx);
        (c, mock, rx)
    }

    #[tokio::test]
    async fn connect_then_ptt_round_trip() {
        let (c, mock, mut rx) = controller();
        c.connect().await.unwrap();
        assert!(c.is_connected());
        assert!(matches!(
            rx.recv().await.unwrap(),
            RadioEvent::Connected {
                reconnect_attempts: 0
            }
        ));

        c.set_ptt(true).await.unwrap();
        assert!(c.is_ptt());
        c.set_ptt(false).await.unwrap();
        assert!(!c.is_ptt());
        let ops = mock.0.lock().unwrap().ops.clone();
        assert_eq!(
            ops,
            vec![MockOp::Connect, MockOp::Ptt(true), MockOp::Ptt(false)]
        );
    }

    #[tokio::test]
    async fn ptt_on_disconnected_transport_is_a_noop_success() {
        let (c, mock, _rx) = controller();
        c.set_ptt(true).await.unwrap();
        // Internal state updated, transport untouched.
        assert!(c.is_ptt());
        assert!(mock.0.lock().unwrap().ops.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_during_ptt_reports_disconnect() {
        let (c, mock, mut rx) = controller();
        c.connect().await.unwrap();
        let _ = rx.recv().await;

        mock.fail_next("io error");
        assert!(c.set_ptt(true).await.is_err());
        assert!(!c.is_connected());
        assert!(!c.is_ptt());
        match rx.recv().await.unwrap() {
            RadioEvent::Disconnected { reason } => assert_eq!(reason, "io error"),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn frequency_changes_are_tracked_and_announced() {
        let (c, _mock, mut rx) = controller();
        c.connect().await.unwrap();
        let _ = rx.recv().await;
        c.set_frequency(14_074_000).await.unwrap();
        assert_eq!(c.get_frequency(), 14_074_000);
        assert!(matches!(
            rx.recv().await.unwrap(),
            RadioEvent::FrequencyChanged { hz: 14_074_000 }
        ));
    }
}
