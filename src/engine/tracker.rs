/// `tracker.rs` — per-transmission phase timestamps
///
/// Pure diagnostics: request → encode → mix → playback → completion stamps
/// keyed by (operator, slot). Surfaced through status queries so timing
/// regressions in the encode→mix→play→PTT chain can be measured instead of
/// guessed at.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransmissionPhases {
    pub requested_ms: Option<i64>,
    pub encode_completed_ms: Option<i64>,
    pub mixed_ready_ms: Option<i64>,
    pub playback_started_ms: Option<i64>,
    pub completed_ms: Option<i64>,
    pub success: Option<bool>,
}

#[derive(Default)]
pub struct TransmissionTracker {
    phases: HashMap<(String, i64), TransmissionPhases>,
}

impl TransmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, operator_id: &str, slot_start_ms: i64) -> &mut TransmissionPhases {
        self.phases
            .entry((operator_id.to_string(), slot_start_ms))
            .or_default()
    }

    pub fn requested(&mut self, operator_id: &str, slot_start_ms: i64, now_ms: i64) {
        self.entry(operator_id, slot_start_ms).requested_ms = Some(now_ms);
    }

    pub fn encode_completed(&mut self, operator_id: &str, slot_start_ms: i64, now_ms: i64) {
        self.entry(operator_id, slot_start_ms).encode_completed_ms = Some(now_ms);
    }

    pub fn mixed_ready(&mut self, operator_id: &str, slot_start_ms: i64, now_ms: i64) {
        self.entry(operator_id, slot_start_ms).mixed_ready_ms = Some(now_ms);
    }

    pub fn playback_started(&mut self, operator_id: &str, slot_start_ms: i64, now_ms: i64) {
        self.entry(operator_id, slot_start_ms).playback_started_ms = Some(now_ms);
    }

    pub fn completed(
        &mut self,
        operator_id: &str,
        slot_start_ms: i64,
        now_ms: i64,
        success: bool,
    ) {
        let entry = self.entry(operator_id, slot_start_ms);
        entry.completed_ms = Some(now_ms);
        entry.success = Some(success);
    }

    pub fn get(&self, operator_id: &str, slot_start_ms: i64) -> Option<&TransmissionPhases> {
        self.phases.get(&(operator_id.to_string(), slot_start_ms))
    }

    /// Drop records for slots older than `cutoff_ms`.
    pub fn prune(&mut self, cutoff_ms: i64) {
        self.phases.retain(|(_, slot), _| *slot >= cutoff_ms);
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}
