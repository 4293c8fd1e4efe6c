/// `manager.rs` — operator coordination
///
/// Holds every operator, collects their transmit requests at encode time
/// into a FIFO that is snapshotted-and-cleared in one step, answers the
/// scheduler's "is anyone transmitting this cycle" question, and routes
/// slot-pack updates plus user commands to the right operator.
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::EncodeRequest;
use crate::events::{EventBus, StationEvent};
use crate::mode::ModeDescriptor;
use crate::qso::operator::{CommandResponse, OperatorCommand, RadioOperator};
use crate::qso::strategy::WorkedLog;
use crate::qso::{OperatorConfig, OperatorStatus};
use crate::slots::{SlotInfo, SlotPack};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitRequest {
    pub operator_id: String,
    pub message: String,
}

pub struct OperatorManager {
    operators: Vec<RadioOperator>,
    pending: Vec<TransmitRequest>,
    mode: ModeDescriptor,
    events: EventBus,
    worked: Arc<dyn WorkedLog>,
}

impl OperatorManager {
    pub fn new(mode: ModeDescriptor, events: EventBus, worked: Arc<dyn WorkedLog>) -> Self {
        Self {
            operators: Vec::new(),
            pending: Vec::new(),
            mode,
            events,
            worked,
        }
    }

    pub fn set_mode(&mut self, mode: ModeDescriptor) {
        self.mode = mode;
    }

    pub fn mode(&self) -> &ModeDescriptor {
        &self.mode
    }

    // ── Operator CRUD ─────────────────────────────────────────────────────

    /// Insert or reconfigure; reconfiguration happens in place so the
    /// operator keeps any QSO in flight.
    pub fn upsert_operator(&mut self, config: OperatorConfig) {
        match self.operators.iter_mut().find(|o| o.id() == config.id) {
            Some(existing) => existing.set_config(config),
            None => self
                .operators
                .push(RadioOperator::new(config, Arc::clone(&self.worked))),
        }
        self.broadcast_list();
    }

    pub fn remove_operator(&mut self, id: &str) -> bool {
        let before = self.operators.len();
        self.operators.retain(|o| o.id() != id);
        let removed = self.operators.len() != before;
        if removed {
            self.pending.retain(|r| r.operator_id != id);
            self.broadcast_list();
        }
        removed
    }

    pub fn operator(&self, id: &str) -> Option<&RadioOperator> {
        self.operators.iter().find(|o| o.id() == id)
    }

    pub fn operator_mut(&mut self, id: &str) -> Option<&mut RadioOperator> {
        self.operators.iter_mut().find(|o| o.id() == id)
    }

    pub fn statuses(&self) -> Vec<OperatorStatus> {
        self.operators.iter().map(|o| o.status()).collect()
    }

    pub fn start_all_operators(&mut self) {
        for op in self.operators.iter_mut() {
            op.start();
        }
        self.broadcast_list();
    }

    /// Radio loss or engine stop: every operator goes quiet.
    pub fn stop_all_operators(&mut self) {
        for op in self.operators.iter_mut() {
            op.stop();
        }
        self.pending.clear();
        self.broadcast_list();
    }

    fn broadcast_list(&self) {
        self.events.publish(StationEvent::OperatorsList {
            operators: self.statuses(),
        });
    }

    // ── Transmit flow ─────────────────────────────────────────────────────

    /// At `encode_start`: ask every operator for its message this slot and
    /// queue the requests (each operator contributes at most one).
    pub fn collect_transmit_requests(&mut self, slot: &SlotInfo) {
        let mode = self.mode.clone();
        for op in self.operators.iter_mut() {
            if let Some(message) = op.handle_encode_start(&mode, slot) {
                log::info!("operator {} requests transmit: '{message}'", op.id());
                self.pending.push(TransmitRequest {
                    operator_id: op.id().to_string(),
                    message,
                });
                self.events.publish(StationEvent::OperatorStatusUpdate {
                    status: op.status(),
                });
            }
        }
    }

    /// Snapshot-and-clear the FIFO, turning each surviving request into an
    /// encode request and logging it.
    pub fn process_pending_transmissions(
        &mut self,
        slot: &SlotInfo,
        now_ms: i64,
    ) -> Vec<EncodeRequest> {
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(pending.len());
        for request in pending {
            let Some(op) = self.operator(&request.operator_id) else {
                log::warn!(
                    "dropping transmit request from removed operator {}",
                    request.operator_id
                );
                continue;
            };
            let frequency = op.config().audio_freq_hz;
            self.events.publish(StationEvent::TransmissionLog {
                operator_id: request.operator_id.clone(),
                time: hhmmss(now_ms),
                message: request.message.clone(),
                frequency,
                slot_start_ms: slot.start_ms,
            });
            out.push(EncodeRequest {
                operator_id: request.operator_id,
                message: request.message,
                audio_freq_hz: frequency,
                mode: self.mode.clone(),
                slot_start_ms: slot.start_ms,
                time_since_slot_start_ms: now_ms - slot.start_ms,
            });
        }
        out
    }

    /// Mid-slot change (slot/cycle/content): bypass the queue and build an
    /// immediate encode request for one operator, if it may transmit now.
    /// A replacement of content already requested this slot re-encodes but
    /// does not count (or log) as a second transmit request.
    pub fn check_and_trigger_transmission(
        &mut self,
        operator_id: &str,
        slot: &SlotInfo,
        now_ms: i64,
    ) -> Option<EncodeRequest> {
        let mode = self.mode.clone();
        let op = self.operator_mut(operator_id)?;
        if !op.is_running() || !op.is_transmit_cycle(&mode, slot.start_ms) {
            return None;
        }
        let change = op.handle_mid_slot_change(&mode, slot)?;
        let frequency = op.config().audio_freq_hz;
        if change.replaces_earlier {
            log::info!(
                "mid-slot content replacement for {operator_id}: '{}'",
                change.message
            );
        } else {
            log::info!("mid-slot transmit trigger for {operator_id}: '{}'", change.message);
            self.events.publish(StationEvent::TransmissionLog {
                operator_id: operator_id.to_string(),
                time: hhmmss(now_ms),
                message: change.message.clone(),
                frequency,
                slot_start_ms: slot.start_ms,
            });
        }
        Some(EncodeRequest {
            operator_id: operator_id.to_string(),
            message: change.message,
            audio_freq_hz: frequency,
            mode,
            slot_start_ms: slot.start_ms,
            time_since_slot_start_ms: now_ms - slot.start_ms,
        })
    }

    /// The scheduler's gate: does anyone transmit in the cycle containing
    /// this slot?
    pub fn has_active_transmissions_in_current_cycle(&self, slot_start_ms: i64) -> bool {
        self.operators
            .iter()
            .any(|o| o.wants_transmit() && o.is_transmit_cycle(&self.mode, slot_start_ms))
    }

    // ── Decode flow ───────────────────────────────────────────────────────

    /// Route a slot-pack update to every running operator; completed QSOs
    /// are broadcast for external log storage.
    pub fn on_slot_pack(&mut self, pack: &SlotPack) {
        let cycle = self.mode.cycle_number(pack.start_ms);
        let mut records = Vec::new();
        for op in self.operators.iter_mut() {
            if let Some(record) = op.on_slot_pack(pack, cycle) {
                records.push((op.status(), record));
            }
        }
        for (status, record) in records {
            log::info!(
                "QSO complete: {} worked {}",
                record.my_callsign,
                record.their_callsign
            );
            self.events.publish(StationEvent::RecordQso { record });
            self.events
                .publish(StationEvent::OperatorStatusUpdate { status });
        }
    }

    pub fn handle_command(
        &mut self,
        operator_id: &str,
        command: OperatorCommand,
        cycle: i64,
    ) -> CommandResponse {
        let Some(op) = self.operator_mut(operator_id) else {
            return CommandResponse::Error {
                message: format!("unknown operator '{operator_id}'"),
            };
        };
        let response = op.handle_command(command, cycle);
        let status = op.status();
        self.events
            .publish(StationEvent::OperatorStatusUpdate { status });
        response
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

fn hhmmss(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%H%M%S").to_string())
        .unwrap_or_default()
}
