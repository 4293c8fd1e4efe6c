/// `strategy.rs` — automated QSO state machine
///
/// One strategy per operator. States follow the standard six-message
/// exchange: TX1 `CQ`, TX2 call-with-grid, TX3 report, TX4 roger-report,
/// TX5 `RR73`, TX6 `73`, plus an idle sentinel. The strategy is a pure
/// message function over its context: decodes go in, the next outbound
/// message comes out; the operator supplies the config and the cycle
/// number.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::qso::message::{format_report, ParsedMessage};
use crate::qso::{OperatorConfig, QsoRecord};
use crate::slots::SlotPack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QsoState {
    Idle,
    Tx1,
    Tx2,
    Tx3,
    Tx4,
    Tx5,
    Tx6,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QsoContext {
    pub target_callsign: Option<String>,
    pub target_grid: Option<String>,
    /// SNR we measured on their signal and report to them.
    pub report_sent: Option<i32>,
    /// SNR they reported back to us.
    pub report_received: Option<i32>,
    pub attempts: u32,
    pub last_activity_cycle: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub state: QsoState,
    pub context: QsoContext,
}

// ── Worked-station seam ──────────────────────────────────────────────────────

/// Narrow view of the external logbook: enough to suppress or deprioritise
/// stations already in it.
pub trait WorkedLog: Send + Sync {
    fn has_worked(&self, callsign: &str) -> bool;
    fn record(&self, record: &QsoRecord);
}

/// In-memory default; real logbooks live behind the same trait.
#[derive(Default)]
pub struct MemoryWorkedLog {
    worked: Mutex<HashSet<String>>,
}

impl MemoryWorkedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preload(&self, callsigns: &[&str]) {
        let mut worked = self.worked.lock().unwrap();
        for c in callsigns {
            worked.insert((*c).to_string());
        }
    }
}

impl WorkedLog for MemoryWorkedLog {
    fn has_worked(&self, callsign: &str) -> bool {
        self.worked.lock().unwrap().contains(callsign)
    }

    fn record(&self, record: &QsoRecord) {
        self.worked
            .lock()
            .unwrap()
            .insert(record.their_callsign.clone());
    }
}

// ── Strategy ─────────────────────────────────────────────────────────────────

pub struct QsoStrategy {
    state: QsoState,
    ctx: QsoContext,
    worked: Arc<dyn WorkedLog>,
}

impl QsoStrategy {
    pub fn new(worked: Arc<dyn WorkedLog>) -> Self {
        Self {
            state: QsoState::Idle,
            ctx: QsoContext::default(),
            worked,
        }
    }

    pub fn state(&self) -> QsoState {
        self.state
    }

    pub fn context(&self) -> &QsoContext {
        &self.ctx
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            state: self.state,
            context: self.ctx.clone(),
        }
    }

    /// Whether the strategy currently wants transmit slots.
    pub fn is_active(&self) -> bool {
        self.state != QsoState::Idle
    }

    pub fn start_cq(&mut self) {
        self.ctx = QsoContext::default();
        self.state = QsoState::Tx1;
    }

    pub fn halt(&mut self) {
        self.ctx = QsoContext::default();
        self.state = QsoState::Idle;
    }

    /// Directed call initiated by the user.
    pub fn call_station(&mut self, callsign: String, grid: Option<String>, cycle: i64) {
        self.ctx = QsoContext {
            target_callsign: Some(callsign),
            target_grid: grid,
            last_activity_cycle: cycle,
            ..QsoContext::default()
        };
        self.state = QsoState::Tx2;
    }

    // ── Decode input ──────────────────────────────────────────────────────

    /// Feed one updated slot pack. Returns a completed QSO when this pack
    /// confirmed one.
    pub fn on_slot_pack(
        &mut self,
        cfg: &OperatorConfig,
        pack: &SlotPack,
        cycle: i64,
    ) -> Option<QsoRecord> {
        let me = cfg.my_callsign.as_str();
        let mut completed = None;

        for frame in pack.received_frames() {
            let parsed = ParsedMessage::parse(&frame.message);
            if parsed.addressee() == Some(me) {
                if let Some(record) =
                    self.on_directed(cfg, &parsed, frame.snr.round() as i32, pack, cycle)
                {
                    completed = Some(record);
                }
            }
        }

        // Nothing in flight: consider answering a CQ.
        if completed.is_none()
            && cfg.auto_reply_to_cq
            && matches!(self.state, QsoState::Idle | QsoState::Tx1)
        {
            self.consider_cq_replies(cfg, pack, cycle);
        }
        completed
    }

    fn on_directed(
        &mut self,
        cfg: &OperatorConfig,
        parsed: &ParsedMessage,
        heard_snr: i32,
        pack: &SlotPack,
        cycle: i64,
    ) -> Option<QsoRecord> {
        let from = parsed.sender()?.to_string();
        let target_matches = self
            .ctx
            .target_callsign
            .as_deref()
            .map(|t| t == from)
            .unwrap_or(false);

        match (self.state, parsed) {
            // CQ side: a caller answered with grid (or jumped straight to a
            // report).
            (QsoState::Tx1, ParsedMessage::Reply { grid, .. }) => {
                self.ctx = QsoContext {
                    target_callsign: Some(from),
                    target_grid: Some(grid.clone()),
                    report_sent: Some(heard_snr),
                    last_activity_cycle: cycle,
                    ..QsoContext::default()
                };
                self.state = QsoState::Tx3;
                None
            }
            (QsoState::Tx1, ParsedMessage::Report { snr, .. }) => {
                self.ctx = QsoContext {
                    target_callsign: Some(from),
                    report_sent: Some(heard_snr),
                    report_received: Some(*snr),
                    last_activity_cycle: cycle,
                    ..QsoContext::default()
                };
                self.state = QsoState::Tx4;
                None
            }
            // Caller side: the CQing station sent us a report.
            (QsoState::Tx2, ParsedMessage::Report { snr, .. }) if target_matches => {
                self.ctx.report_received = Some(*snr);
                if self.ctx.report_sent.is_none() {
                    self.ctx.report_sent = Some(heard_snr);
                }
                self.touch(cycle);
                self.state = QsoState::Tx4;
                None
            }
            // CQ side: roger-report confirms our report.
            (QsoState::Tx3, ParsedMessage::RogerReport { snr, .. }) if target_matches => {
                self.ctx.report_received = Some(*snr);
                self.touch(cycle);
                self.state = QsoState::Tx5;
                None
            }
            // Caller side: RR73 ends the exchange; we still owe a 73.
            (QsoState::Tx4, ParsedMessage::Rr73 { .. }) if target_matches => {
                self.touch(cycle);
                self.state = QsoState::Tx6;
                Some(self.complete(cfg, pack.start_ms))
            }
            (QsoState::Tx4, ParsedMessage::Seventy3 { .. }) if target_matches => {
                self.touch(cycle);
                let record = self.complete(cfg, pack.start_ms);
                self.finish_success(cfg);
                Some(record)
            }
            // CQ side: their 73 closes it; nothing more to send.
            (QsoState::Tx5, ParsedMessage::Seventy3 { .. }) if target_matches => {
                self.touch(cycle);
                let record = self.complete(cfg, pack.start_ms);
                self.finish_success(cfg);
                Some(record)
            }
            // Any other directed traffic from the target keeps the QSO warm.
            _ => {
                if target_matches {
                    self.touch(cycle);
                }
                None
            }
        }
    }

    fn consider_cq_replies(&mut self, cfg: &OperatorConfig, pack: &SlotPack, cycle: i64) {
        let mut best: Option<(bool, f32, String, Option<String>, i32)> = None;
        for frame in pack.received_frames() {
            let ParsedMessage::Cq { caller, grid, .. } = ParsedMessage::parse(&frame.message)
            else {
                continue;
            };
            if caller == cfg.my_callsign {
                continue;
            }
            let worked = self.worked.has_worked(&caller);
            if worked && !cfg.reply_to_worked_stations {
                continue;
            }
            // Rank: unworked first (when configured), then strongest signal.
            let is_new = !worked;
            let candidate_rank = (cfg.prioritize_new_calls && is_new, frame.snr);
            let beats = match &best {
                None => true,
                Some((best_new, best_snr, ..)) => {
                    candidate_rank > (cfg.prioritize_new_calls && *best_new, *best_snr)
                }
            };
            if beats {
                best = Some((
                    is_new,
                    frame.snr,
                    caller,
                    grid,
                    frame.snr.round() as i32,
                ));
            }
        }

        if let Some((_, _, caller, grid, heard_snr)) = best {
            log::info!("answering CQ from {caller}");
            self.ctx = QsoContext {
                target_callsign: Some(caller),
                target_grid: grid,
                report_sent: Some(heard_snr),
                last_activity_cycle: cycle,
                ..QsoContext::default()
            };
            self.state = QsoState::Tx2;
        }
    }

    // ── Transmit output ───────────────────────────────────────────────────

    /// The message to send this transmit slot, if any. Advances attempt and
    /// timeout accounting; may abort or finish the QSO as a side effect.
    pub fn handle_transmit_slot(&mut self, cfg: &OperatorConfig, cycle: i64) -> Option<String> {
        if self.state == QsoState::Idle {
            return None;
        }

        // Abort checks only bind while a QSO is in flight.
        if self.state != QsoState::Tx1 {
            let stalled = cycle - self.ctx.last_activity_cycle > cfg.max_qso_timeout_cycles;
            let exhausted = self.ctx.attempts >= cfg.max_call_attempts;
            if stalled || exhausted {
                log::info!(
                    "aborting QSO with {:?}: {}",
                    self.ctx.target_callsign,
                    if stalled { "timeout" } else { "attempts exhausted" }
                );
                if cfg.auto_resume_cq_after_fail {
                    self.start_cq();
                } else {
                    self.halt();
                    return None;
                }
            }
        }

        let text = self.current_message(cfg)?;
        match self.state {
            QsoState::Tx6 => {
                // The 73 goes out once; the QSO is already recorded.
                self.finish_success(cfg);
            }
            QsoState::Tx1 => {}
            _ => self.ctx.attempts += 1,
        }
        Some(text)
    }

    /// The message the current state would put on air, with no attempt or
    /// timeout accounting. Used to re-render a transmission when its
    /// content changes mid-slot.
    pub fn current_message(&self, cfg: &OperatorConfig) -> Option<String> {
        let me = cfg.my_callsign.as_str();
        let target = self.ctx.target_callsign.clone();
        Some(match self.state {
            QsoState::Idle => return None,
            QsoState::Tx1 => format!("CQ {me} {}", cfg.my_grid),
            QsoState::Tx2 => format!("{} {me} {}", target?, cfg.my_grid),
            QsoState::Tx3 => format!("{} {me} {}", target?, format_report(self.ctx.report_sent?)),
            QsoState::Tx4 => format!(
                "{} {me} R{}",
                target?,
                format_report(self.ctx.report_sent?)
            ),
            QsoState::Tx5 => format!("{} {me} RR73", target?),
            QsoState::Tx6 => format!("{} {me} 73", target?),
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn touch(&mut self, cycle: i64) {
        self.ctx.last_activity_cycle = cycle;
        self.ctx.attempts = 0;
    }

    fn complete(&self, cfg: &OperatorConfig, completed_at_ms: i64) -> QsoRecord {
        let record = QsoRecord {
            my_callsign: cfg.my_callsign.clone(),
            their_callsign: self.ctx.target_callsign.clone().unwrap_or_default(),
            their_grid: self.ctx.target_grid.clone(),
            report_sent: self.ctx.report_sent,
            report_received: self.ctx.report_received,
            mode: cfg.mode.clone(),
            completed_at_ms,
        };
        self.worked.record(&record);
        record
    }

    fn finish_success(&mut self, cfg: &OperatorConfig) {
        if cfg.auto_resume_cq_after_success {
            self.start_cq();
        } else {
            self.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::FT8;
    use crate::slots::FrameMessage;

    const SLOT: i64 = 1_700_000_010_000;

    fn cfg() -> OperatorConfig {
        OperatorConfig {
            id: "op1".into(),
            my_callsign: "AA1AA".into(),
            my_grid: "FN42".into(),
            auto_reply_to_cq: true,
            max_call_attempts: 3,
            max_qso_timeout_cycles: 4,
            ..OperatorConfig::default()
        }
    }

    fn pack_with(messages: &[(&str, f32)]) -> SlotPack {
        let mut pack = SlotPack::new(SLOT, FT8.slot_ms);
        pack.frames = messages
            .iter()
            .map(|(m, snr)| FrameMessage {
                message: (*m).to_string(),
                snr: *snr,
                dt: 0.1,
                freq: 1_200.0,
                confidence: 0.9,
            })
            .collect();
        pack
    }

    fn strategy() -> QsoStrategy {
        QsoStrategy::new(Arc::new(MemoryWorkedLog::new()))
    }

    #[test]
    fn cq_side_full_exchange() {
        let cfg = cfg();
        let mut s = strategy();
        s.start_cq();
        assert_eq!(s.handle_transmit_slot(&cfg, 0), Some("CQ AA1AA FN42".into()));

        // Caller answers with grid.
        assert!(s
            .on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB FN31", -7.0)]), 1)
            .is_none());
        assert_eq!(s.state(), QsoState::Tx3);
        assert_eq!(s.handle_transmit_slot(&cfg, 2), Some("BB2BB AA1AA -07".into()));

        // Caller rogers with their report.
        assert!(s
            .on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB R-12", -8.0)]), 3)
            .is_none());
        assert_eq!(s.state(), QsoState::Tx5);
        assert_eq!(s.handle_transmit_slot(&cfg, 4), Some("BB2BB AA1AA RR73".into()));

        // 73 closes and records the QSO.
        let record = s
            .on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB 73", -8.0)]), 5)
            .unwrap();
        assert_eq!(record.their_callsign, "BB2BB");
        assert_eq!(record.their_grid.as_deref(), Some("FN31"));
        assert_eq!(record.report_sent, Some(-7));
        assert_eq!(record.report_received, Some(-12));
        // Auto-resume goes back to CQ.
        assert_eq!(s.state(), QsoState::Tx1);
    }

    #[test]
    fn caller_side_full_exchange() {
        let cfg = cfg();
        let mut s = strategy();

        // Hear a CQ, auto-reply kicks in.
        assert!(s
            .on_slot_pack(&cfg, &pack_with(&[("CQ BB2BB FN31", -4.0)]), 0)
            .is_none());
        assert_eq!(s.state(), QsoState::Tx2);
        assert_eq!(s.handle_transmit_slot(&cfg, 1), Some("BB2BB AA1AA FN42".into()));

        // They send us a report.
        s.on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB -10", -5.0)]), 2);
        assert_eq!(s.state(), QsoState::Tx4);
        assert_eq!(s.handle_transmit_slot(&cfg, 3), Some("BB2BB AA1AA R-04".into()));

        // RR73: complete, but we still owe the 73.
        let record = s
            .on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB RR73", -5.0)]), 4)
            .unwrap();
        assert_eq!(record.report_received, Some(-10));
        assert_eq!(s.state(), QsoState::Tx6);
        assert_eq!(s.handle_transmit_slot(&cfg, 5), Some("BB2BB AA1AA 73".into()));
        assert_eq!(s.state(), QsoState::Tx1);
    }

    #[test]
    fn attempts_exhausted_resumes_cq() {
        let cfg = cfg();
        let mut s = strategy();
        s.call_station("BB2BB".into(), None, 0);
        // 3 unanswered calls use up max_call_attempts.
        for cycle in 1..=3 {
            assert!(s.handle_transmit_slot(&cfg, cycle).is_some());
        }
        // Fourth transmit slot aborts and falls back to CQ.
        assert_eq!(s.handle_transmit_slot(&cfg, 4), Some("CQ AA1AA FN42".into()));
        assert_eq!(s.state(), QsoState::Tx1);
        assert!(s.context().target_callsign.is_none());
    }

    #[test]
    fn timeout_without_resume_goes_idle() {
        let mut cfg = cfg();
        cfg.auto_resume_cq_after_fail = false;
        let mut s = strategy();
        s.call_station("BB2BB".into(), None, 0);
        assert!(s.handle_transmit_slot(&cfg, 1).is_some());
        // Way past max_qso_timeout_cycles with no activity.
        assert_eq!(s.handle_transmit_slot(&cfg, 20), None);
        assert_eq!(s.state(), QsoState::Idle);
    }

    #[test]
    fn worked_stations_are_skipped_when_configured() {
        let mut cfg = cfg();
        cfg.reply_to_worked_stations = false;
        let worked = Arc::new(MemoryWorkedLog::new());
        worked.preload(&["BB2BB"]);
        let mut s = QsoStrategy::new(worked);

        s.on_slot_pack(&cfg, &pack_with(&[("CQ BB2BB FN31", -2.0)]), 0);
        assert_eq!(s.state(), QsoState::Idle);

        // An unworked station is answered even when weaker.
        s.on_slot_pack(
            &cfg,
            &pack_with(&[("CQ BB2BB FN31", -2.0), ("CQ CC3CC JN58", -15.0)]),
            1,
        );
        assert_eq!(s.state(), QsoState::Tx2);
        assert_eq!(s.context().target_callsign.as_deref(), Some("CC3CC"));
    }

    #[test]
    fn new_calls_outrank_worked_ones() {
        let cfg = cfg(); // reply_to_worked true, prioritize_new true
        let worked = Arc::new(MemoryWorkedLog::new());
        worked.preload(&["BB2BB"]);
        let mut s = QsoStrategy::new(worked);

        s.on_slot_pack(
            &cfg,
            &pack_with(&[("CQ BB2BB FN31", -1.0), ("CQ CC3CC JN58", -18.0)]),
            0,
        );
        assert_eq!(s.context().target_callsign.as_deref(), Some("CC3CC"));
    }

    #[test]
    fn activity_resets_attempts() {
        let cfg = cfg();
        let mut s = strategy();
        s.call_station("BB2BB".into(), None, 0);
        s.handle_transmit_slot(&cfg, 1);
        s.handle_transmit_slot(&cfg, 2);
        assert_eq!(s.context().attempts, 2);
        s.on_slot_pack(&cfg, &pack_with(&[("AA1AA BB2BB -10", -5.0)]), 3);
        assert_eq!(s.context().attempts, 0);
        assert_eq!(s.state(), QsoState::Tx4);
    }
}
