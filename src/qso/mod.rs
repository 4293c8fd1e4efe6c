pub mod manager;
pub mod message;
pub mod operator;
pub mod strategy;

use serde::{Deserialize, Serialize};

pub use manager::{OperatorManager, TransmitRequest};
pub use operator::{MidSlotChange, RadioOperator};
pub use strategy::{
    MemoryWorkedLog, QsoContext, QsoState, QsoStrategy, StrategySnapshot, WorkedLog,
};

// ── Operator configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub id: String,
    pub my_callsign: String,
    pub my_grid: String,
    pub audio_freq_hz: f32,
    /// Cycle phases this operator may transmit on: {0,1} for even/odd
    /// modes, absolute cycle numbers for continuous modes.
    pub transmit_cycles: Vec<i64>,
    pub max_qso_timeout_cycles: i64,
    pub max_call_attempts: u32,
    pub auto_reply_to_cq: bool,
    pub auto_resume_cq_after_fail: bool,
    pub auto_resume_cq_after_success: bool,
    pub reply_to_worked_stations: bool,
    pub prioritize_new_calls: bool,
    pub mode: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            id: "operator-1".into(),
            my_callsign: String::new(),
            my_grid: String::new(),
            audio_freq_hz: 1_500.0,
            transmit_cycles: vec![0],
            max_qso_timeout_cycles: 10,
            max_call_attempts: 5,
            auto_reply_to_cq: false,
            auto_resume_cq_after_fail: true,
            auto_resume_cq_after_success: true,
            reply_to_worked_stations: true,
            prioritize_new_calls: true,
            mode: "FT8".into(),
        }
    }
}

// ── Public snapshots ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorStatus {
    pub id: String,
    pub callsign: String,
    pub running: bool,
    pub state: QsoState,
    pub target_callsign: Option<String>,
    pub attempts: u32,
    pub transmit_cycles: Vec<i64>,
    pub audio_freq_hz: f32,
}

/// Completed contact handed to external log storage via `record_qso`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QsoRecord {
    pub my_callsign: String,
    pub their_callsign: String,
    pub their_grid: Option<String>,
    pub report_sent: Option<i32>,
    pub report_received: Option<i32>,
    pub mode: String,
    pub completed_at_ms: i64,
}
