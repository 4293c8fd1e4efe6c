/// `events.rs` — typed station event bus
///
/// Every externally observable happening in the engine flows through one
/// `StationEvent` enum broadcast over a tokio channel. The HTTP/WebSocket
/// collaborator subscribes here; internal components use direct channels and
/// only mirror user-facing happenings onto the bus.
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::qso::{OperatorStatus, QsoRecord};
use crate::slots::{SlotInfo, SlotPack};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StationEvent {
    SlotStart {
        slot: SlotInfo,
    },
    SubWindow {
        slot: SlotInfo,
        window_idx: usize,
    },
    SlotPackUpdated {
        slot_pack: SlotPack,
    },
    OperatorStatusUpdate {
        status: OperatorStatus,
    },
    OperatorsList {
        operators: Vec<OperatorStatus>,
    },
    SystemStatus {
        state: String,
        detail: Option<String>,
    },
    ModeChanged {
        mode: String,
    },
    PttStatusChanged {
        active: bool,
    },
    VolumeGainChanged {
        gain: f32,
        gain_db: f32,
    },
    TransmissionComplete {
        operator_id: String,
        success: bool,
        duration_sec: Option<f64>,
        mixed_with: Vec<String>,
        error: Option<String>,
    },
    TransmissionLog {
        operator_id: String,
        /// `HHMMSS` UTC stamp of the encode dispatch.
        time: String,
        message: String,
        frequency: f32,
        slot_start_ms: i64,
    },
    RadioStatusChanged {
        connected: bool,
        frequency_hz: Option<u64>,
    },
    RadioError {
        message: String,
    },
    RadioDisconnectedDuringTransmission {
        reason: String,
        recommendation: String,
    },
    TimingWarning {
        slot_id: String,
        expected_encodes: u32,
        completed_encodes: u32,
    },
    FrequencyChanged {
        frequency_hz: u64,
    },
    RecordQso {
        record: QsoRecord,
    },
    DecodeError {
        slot_id: String,
        window_idx: usize,
        message: String,
    },
    EncodeError {
        operator_id: String,
        message: String,
    },
}

// ── EventBus ─────────────────────────────────────────────────────────────────

/// Cloneable fan-out handle. Subscribers hold a `broadcast::Receiver`; the
/// engine state machine acquires receivers on start and drops them on stop,
/// so no subscription outlives a run.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. A bus with no subscribers is not
    /// an error; events are simply dropped.
    pub fn publish(&self, event: StationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
