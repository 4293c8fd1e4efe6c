/// `operator.rs` — one logical operator at the station
///
/// Owns its config and strategy, filters transmit opportunities by cycle,
/// and guarantees at most one transmit request per slot. Several operators
/// can run concurrently on different cycles and audio frequencies.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mode::ModeDescriptor;
use crate::qso::strategy::{QsoStrategy, StrategySnapshot, WorkedLog};
use crate::qso::{OperatorConfig, OperatorStatus, QsoRecord};
use crate::slots::{SlotInfo, SlotPack};

// ── User commands (tagged payloads in, typed responses out) ──────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    GetState,
    GetSlots,
    SetSlot { transmit_cycles: Vec<i64> },
    CallStation { callsign: String, grid: Option<String> },
    ResumeCq,
    Halt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum CommandResponse {
    State { snapshot: StrategySnapshot },
    Slots { transmit_cycles: Vec<i64> },
    Ack,
    Error { message: String },
}

/// A mid-slot change of outbound content. `replaces_earlier` marks a
/// re-encode of a slot the operator already has a transmit request in; the
/// audio is replaced, the request count for the slot stays at one.
#[derive(Debug, Clone, PartialEq)]
pub struct MidSlotChange {
    pub message: String,
    pub replaces_earlier: bool,
}

pub struct RadioOperator {
    config: OperatorConfig,
    strategy: QsoStrategy,
    running: bool,
    /// Slot start and content of the last emitted transmit request; one
    /// request per slot, later changes only replace its content.
    last_transmit: Option<(i64, String)>,
}

impl RadioOperator {
    pub fn new(config: OperatorConfig, worked: Arc<dyn WorkedLog>) -> Self {
        Self {
            config,
            strategy: QsoStrategy::new(worked),
            running: false,
            last_transmit: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Reconfigure in place; the QSO in flight survives unless the callsign
    /// changed under it.
    pub fn set_config(&mut self, config: OperatorConfig) {
        if config.my_callsign != self.config.my_callsign {
            self.strategy.halt();
        }
        self.config = config;
    }

    pub fn start(&mut self) {
        self.running = true;
        if self.config.auto_resume_cq_after_success || self.config.auto_reply_to_cq {
            // A freshly started operator with automation on begins by CQing.
            if !self.strategy.is_active() {
                self.strategy.start_cq();
            }
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.strategy.halt();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether this operator transmits on the cycle containing
    /// `slot_start_ms`.
    pub fn is_transmit_cycle(&self, mode: &ModeDescriptor, slot_start_ms: i64) -> bool {
        let phase = mode.cycle_phase(slot_start_ms);
        self.config.transmit_cycles.contains(&phase)
    }

    /// Whether the operator is actively working (or soliciting) a QSO.
    pub fn wants_transmit(&self) -> bool {
        self.running && self.strategy.is_active()
    }

    // ── Slot plumbing ─────────────────────────────────────────────────────

    /// Called at `encode_start`. Yields the outbound message when this is
    /// our cycle, we are running, the strategy has something to say, and we
    /// have not already transmitted this slot.
    pub fn handle_encode_start(
        &mut self,
        mode: &ModeDescriptor,
        slot: &SlotInfo,
    ) -> Option<String> {
        if !self.running || !self.is_transmit_cycle(mode, slot.start_ms) {
            return None;
        }
        if matches!(&self.last_transmit, Some((s, _)) if *s == slot.start_ms) {
            return None;
        }
        let message = self
            .strategy
            .handle_transmit_slot(&self.config, slot.cycle_number)?;
        self.last_transmit = Some((slot.start_ms, message.clone()));
        Some(message)
    }

    /// Mid-slot content change. When the operator has not transmitted this
    /// slot yet, this IS its one request for the slot. When it has, the new
    /// content only replaces the earlier audio; unchanged content yields
    /// nothing, so a slot never sees more than one transmit request per
    /// operator.
    pub fn handle_mid_slot_change(
        &mut self,
        mode: &ModeDescriptor,
        slot: &SlotInfo,
    ) -> Option<MidSlotChange> {
        if !self.running || !self.is_transmit_cycle(mode, slot.start_ms) {
            return None;
        }
        let already_sent = matches!(&self.last_transmit, Some((s, _)) if *s == slot.start_ms);
        if !already_sent {
            let message = self
                .strategy
                .handle_transmit_slot(&self.config, slot.cycle_number)?;
            self.last_transmit = Some((slot.start_ms, message.clone()));
            return Some(MidSlotChange {
                message,
                replaces_earlier: false,
            });
        }
        // Replacement path: re-render without attempt accounting and only
        // re-encode when the content actually changed.
        let message = self.strategy.current_message(&self.config)?;
        if matches!(&self.last_transmit, Some((_, m)) if *m == message) {
            return None;
        }
        self.last_transmit = Some((slot.start_ms, message.clone()));
        Some(MidSlotChange {
            message,
            replaces_earlier: true,
        })
    }

    /// Feed a slot pack update through the strategy; completed QSOs bubble
    /// up for the manager to record.
    pub fn on_slot_pack(&mut self, pack: &SlotPack, cycle: i64) -> Option<QsoRecord> {
        if !self.running {
            return None;
        }
        self.strategy.on_slot_pack(&self.config, pack, cycle)
    }

    pub fn handle_command(&mut self, command: OperatorCommand, cycle: i64) -> CommandResponse {
        match command {
            OperatorCommand::GetState => CommandResponse::State {
                snapshot: self.strategy.snapshot(),
            },
            OperatorCommand::GetSlots => CommandResponse::Slots {
                transmit_cycles: self.config.transmit_cycles.clone(),
            },
            OperatorCommand::SetSlot { transmit_cycles } => {
                if transmit_cycles.is_empty() {
                    return CommandResponse::Error {
                        message: "transmit_cycles must not be empty".into(),
                    };
                }
                self.config.transmit_cycles = transmit_cycles;
                CommandResponse::Ack
            }
            OperatorCommand::CallStation { callsign, grid } => {
                self.strategy.call_station(callsign, grid, cycle);
                CommandResponse::Ack
            }
            OperatorCommand::ResumeCq => {
                self.strategy.start_cq();
                CommandResponse::Ack
            }
            OperatorCommand::Halt => {
                self.strategy.halt();
                CommandResponse::Ack
            }
        }
    }

    pub fn status(&self) -> OperatorStatus {
        let snapshot = self.strategy.snapshot();
        OperatorStatus {
            id: self.config.id.clone(),
            callsign: self.config.my_callsign.clone(),
            running: self.running,
            state: snapshot.state,
            target_callsign: snapshot.context.target_callsign,
            attempts: snapshot.context.attempts,
            transmit_cycles: self.config.transmit_cycles.clone(),
            audio_freq_hz: self.config.audio_freq_hz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::FT8;
    use crate::qso::strategy::MemoryWorkedLog;

    // An even FT8 cycle: 1_700_000_010_000 / 15_000 = 113_333_334.
    const EVEN_SLOT: i64 = 1_700_000_010_000;
    const ODD_SLOT: i64 = EVEN_SLOT + 15_000;

    fn operator(transmit_cycles: Vec<i64>) -> RadioOperator {
        let config = OperatorConfig {
            id: "op1".into(),
            my_callsign: "AA1AA".into(),
            my_grid: "FN42".into(),
            transmit_cycles,
            auto_reply_to_cq: true,
            ..OperatorConfig::default()
        };
        RadioOperator::new(config, Arc::new(MemoryWorkedLog::new()))
    }

    fn slot(start_ms: i64) -> SlotInfo {
        SlotInfo::synthesized(start_ms, &FT8)
    }

    #[test]
    fn transmits_only_on_configured_cycle() {
        let mut op = operator(vec![0]);
        op.start();
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_some());
        assert!(op.handle_encode_start(&FT8, &slot(ODD_SLOT)).is_none());
    }

    #[test]
    fn at_most_one_request_per_slot() {
        let mut op = operator(vec![0]);
        op.start();
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_some());
        // Mid-slot re-fire of encode_start must not double-emit.
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_none());
        // The next even slot is fine again.
        assert!(op
            .handle_encode_start(&FT8, &slot(EVEN_SLOT + 30_000))
            .is_some());
    }

    #[test]
    fn stopped_operator_stays_silent() {
        let mut op = operator(vec![0, 1]);
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_none());
        op.start();
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_some());
        op.stop();
        assert!(op.handle_encode_start(&FT8, &slot(ODD_SLOT)).is_none());
    }

    #[test]
    fn set_slot_command_moves_cycles() {
        let mut op = operator(vec![0]);
        op.start();
        let response = op.handle_command(
            OperatorCommand::SetSlot {
                transmit_cycles: vec![1],
            },
            0,
        );
        assert!(matches!(response, CommandResponse::Ack));
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_none());
        assert!(op.handle_encode_start(&FT8, &slot(ODD_SLOT)).is_some());

        assert!(matches!(
            op.handle_command(
                OperatorCommand::SetSlot {
                    transmit_cycles: vec![]
                },
                0
            ),
            CommandResponse::Error { .. }
        ));
    }

    #[test]
    fn mid_slot_change_is_a_replacement_not_a_second_request() {
        let mut op = operator(vec![0]);
        op.start();
        let first = op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).unwrap();

        // Same content: nothing to re-encode.
        assert!(op.handle_mid_slot_change(&FT8, &slot(EVEN_SLOT)).is_none());

        // Retarget mid-slot: the new message replaces the earlier one.
        op.handle_command(
            OperatorCommand::CallStation {
                callsign: "BB2BB".into(),
                grid: None,
            },
            FT8.cycle_number(EVEN_SLOT),
        );
        let change = op.handle_mid_slot_change(&FT8, &slot(EVEN_SLOT)).unwrap();
        assert!(change.replaces_earlier);
        assert_eq!(change.message, "BB2BB AA1AA FN42");
        assert_ne!(change.message, first);

        // The normal path still refuses a second request for the slot.
        assert!(op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).is_none());
        // And an untransmitted slot gets a fresh (non-replacement) request.
        let fresh = op
            .handle_mid_slot_change(&FT8, &slot(EVEN_SLOT + 30_000))
            .unwrap();
        assert!(!fresh.replaces_earlier);
    }

    #[test]
    fn call_station_command_targets_immediately() {
        let mut op = operator(vec![0]);
        op.start();
        op.handle_command(
            OperatorCommand::CallStation {
                callsign: "BB2BB".into(),
                grid: Some("FN31".into()),
            },
            FT8.cycle_number(EVEN_SLOT),
        );
        let message = op.handle_encode_start(&FT8, &slot(EVEN_SLOT)).unwrap();
        assert_eq!(message, "BB2BB AA1AA FN42");
        let status = op.status();
        assert_eq!(status.target_callsign.as_deref(), Some("BB2BB"));
    }
}
