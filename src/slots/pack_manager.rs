/// `pack_manager.rs` — per-slot aggregation of decode results
///
/// Owns the `slot_id -> SlotPack` map. All mutation happens on the engine
/// dispatcher, so the map needs no lock of its own; persistence is handed
/// off to the background store and the updated pack is broadcast on the
/// event bus.
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::ClockSource;
use crate::codec::DecodeResult;
use crate::events::{EventBus, StationEvent};
use crate::mode::ModeDescriptor;
use crate::qso::message::ParsedMessage;
use crate::slots::pack;
use crate::slots::persistence::SlotPackStore;
use crate::slots::types::{
    slot_id, DecodeHistoryEntry, FrameMessage, SlotInfo, SlotPack, SlotPackStorageRecord,
    StorageOperation, STORAGE_RECORD_VERSION,
};

pub const DEFAULT_PACK_MAX_AGE_MS: i64 = 60_000;

pub struct SlotPackManager {
    packs: HashMap<String, SlotPack>,
    /// Cached id of the pack with the greatest start_ms.
    latest: Option<String>,
    mode: ModeDescriptor,
    clock: Arc<dyn ClockSource>,
    events: EventBus,
    store: Option<SlotPackStore>,
}

impl SlotPackManager {
    pub fn new(mode: ModeDescriptor, clock: Arc<dyn ClockSource>, events: EventBus) -> Self {
        Self {
            packs: HashMap::new(),
            latest: None,
            mode,
            clock,
            events,
            store: None,
        }
    }

    pub fn set_store(&mut self, store: SlotPackStore) {
        self.store = Some(store);
    }

    pub fn take_store(&mut self) -> Option<SlotPackStore> {
        self.store.take()
    }

    /// New slot duration applies to packs created from here on; existing
    /// packs keep their stored end_ms.
    pub fn set_mode(&mut self, mode: ModeDescriptor) {
        self.mode = mode;
    }

    // ── Inputs ────────────────────────────────────────────────────────────

    pub fn process_decode_result(&mut self, result: DecodeResult) {
        let now = self.clock.now();
        let created = !self.packs.contains_key(&result.slot_id);
        let slot_ms = self.mode.slot_ms;
        let pack = self
            .packs
            .entry(result.slot_id.clone())
            .or_insert_with(|| SlotPack::new(result.slot_start_ms, slot_ms));

        let frame_count = result.frames.len();
        pack::append_frames(pack, result.frames, result.window_offset_ms);

        pack.stats.total_decodes += 1;
        if frame_count > 0 {
            pack.stats.successful_decodes += 1;
        }
        pack.stats.total_frames_before_dedup += frame_count as u32;
        pack.stats.total_frames_after_dedup = pack.frames.len() as u32;
        pack.stats.last_updated = now;
        pack.decode_history.push(DecodeHistoryEntry {
            window_idx: result.window_idx,
            timestamp: now,
            frame_count,
            processing_time_ms: result.processing_time_ms,
        });

        if created {
            self.bump_latest(&result.slot_id);
        }
        self.finish_update(&result.slot_id, created, now);
    }

    pub fn add_transmission_frame(
        &mut self,
        slot: &str,
        operator_id: &str,
        message: &str,
        freq_hz: f32,
        timestamp: i64,
    ) {
        let Some(start_ms) = parse_slot_id(slot) else {
            log::warn!("ignoring transmission frame for malformed slot id '{slot}'");
            return;
        };
        let created = !self.packs.contains_key(slot);
        let slot_ms = self.mode.slot_ms;
        let pack = self
            .packs
            .entry(slot.to_string())
            .or_insert_with(|| SlotPack::new(start_ms, slot_ms));

        if !pack::add_transmit_frame(pack, message, freq_hz) {
            return;
        }
        log::debug!("recorded transmit frame for {operator_id} in {slot}: '{message}' @ {freq_hz} Hz");
        pack.stats.total_frames_after_dedup = pack.frames.len() as u32;
        pack.stats.last_updated = timestamp;

        if created {
            self.bump_latest(slot);
        }
        self.finish_update(slot, created, timestamp);
    }

    fn finish_update(&mut self, slot: &str, created: bool, now: i64) {
        let pack = self.packs.get(slot).expect("pack just touched");
        self.persist(pack, created, now);
        self.events.publish(StationEvent::SlotPackUpdated {
            slot_pack: pack.clone(),
        });
    }

    fn persist(&self, pack: &SlotPack, created: bool, now: i64) {
        if let Some(store) = &self.store {
            store.append(SlotPackStorageRecord {
                stored_at: now,
                operation: if created {
                    StorageOperation::Created
                } else {
                    StorageOperation::Updated
                },
                slot_pack: pack.clone(),
                mode: self.mode.name.to_string(),
                version: STORAGE_RECORD_VERSION.to_string(),
            });
        }
    }

    fn bump_latest(&mut self, candidate: &str) {
        let candidate_start = self.packs.get(candidate).map(|p| p.start_ms);
        let current_start = self
            .latest
            .as_ref()
            .and_then(|id| self.packs.get(id))
            .map(|p| p.start_ms);
        if candidate_start > current_start {
            self.latest = Some(candidate.to_string());
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn get_slot_pack(&self, id: &str) -> Option<&SlotPack> {
        self.packs.get(id)
    }

    pub fn get_active_slot_packs(&self) -> Vec<&SlotPack> {
        let mut packs: Vec<&SlotPack> = self.packs.values().collect();
        packs.sort_by_key(|p| p.start_ms);
        packs
    }

    pub fn get_latest_slot_pack(&self) -> Option<&SlotPack> {
        self.latest.as_ref().and_then(|id| self.packs.get(id))
    }

    /// Newest received frame whose sender parses to `callsign`, with a
    /// synthesized SlotInfo for the pack it came from.
    pub fn get_last_message_from_callsign(
        &self,
        callsign: &str,
    ) -> Option<(FrameMessage, SlotInfo)> {
        let mut packs: Vec<&SlotPack> = self.packs.values().collect();
        packs.sort_by_key(|p| std::cmp::Reverse(p.start_ms));
        for pack in packs {
            for frame in pack.received_frames() {
                if ParsedMessage::parse(&frame.message).sender() == Some(callsign) {
                    return Some((
                        frame.clone(),
                        SlotInfo::synthesized(pack.start_ms, &self.mode),
                    ));
                }
            }
        }
        None
    }

    pub fn find_best_transmit_frequency(
        &self,
        slot: &str,
        min_hz: f32,
        max_hz: f32,
        guard_hz: f32,
    ) -> Option<f32> {
        let pack = self.packs.get(slot)?;
        pack::find_best_transmit_frequency(pack, min_hz, max_hz, guard_hz)
    }

    // ── Housekeeping ──────────────────────────────────────────────────────

    /// Sweep packs idle past `max_age_ms`; recompute the cached latest when
    /// it was among them. Returns how many were removed.
    pub fn cleanup_expired(&mut self, max_age_ms: i64) -> usize {
        let cutoff = self.clock.now() - max_age_ms;
        let before = self.packs.len();
        self.packs.retain(|_, p| p.stats.last_updated >= cutoff);
        let removed = before - self.packs.len();
        if removed > 0 {
            log::debug!("expired {removed} slot pack(s)");
            let latest_gone = self
                .latest
                .as_ref()
                .map(|id| !self.packs.contains_key(id))
                .unwrap_or(false);
            if latest_gone {
                self.latest = self
                    .packs
                    .values()
                    .max_by_key(|p| p.start_ms)
                    .map(|p| p.slot_id.clone());
            }
        }
        removed
    }

    /// Frequency change: everything heard so far belongs to the old band.
    pub fn clear_all(&mut self) {
        self.packs.clear();
        self.latest = None;
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

pub fn parse_slot_id(id: &str) -> Option<i64> {
    id.strip_prefix("slot-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mode::FT8;

    const T0: i64 = 1_700_000_000_000 + 10_000; // slot boundary is T0-10000

    fn manager(clock: Arc<ManualClock>) -> SlotPackManager {
        SlotPackManager::new(FT8.clone(), clock, EventBus::new(32))
    }

    fn decode_result(slot_start: i64, frames: Vec<FrameMessage>, window_idx: usize) -> DecodeResult {
        DecodeResult {
            slot_id: slot_id(slot_start),
            slot_start_ms: slot_start,
            window_idx,
            window_offset_ms: 0,
            mode: FT8.clone(),
            frames,
            processing_time_ms: 7,
        }
    }

    fn rx(message: &str, snr: f32, confidence: f32, dt: f32, freq: f32) -> FrameMessage {
        FrameMessage {
            message: message.into(),
            snr,
            dt,
            freq,
            confidence,
        }
    }

    #[test]
    fn creates_one_pack_per_slot_and_updates_stats() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(Arc::clone(&clock));
        m.process_decode_result(decode_result(T0, vec![rx("CQ AA1AA FN42", -9.0, 0.9, 0.1, 1_200.0)], 0));
        m.process_decode_result(decode_result(T0, vec![], 1));

        let pack = m.get_slot_pack(&slot_id(T0)).unwrap();
        assert_eq!(pack.stats.total_decodes, 2);
        assert_eq!(pack.stats.successful_decodes, 1);
        assert_eq!(pack.stats.total_frames_before_dedup, 1);
        assert_eq!(pack.stats.total_frames_after_dedup, 1);
        assert_eq!(pack.decode_history.len(), 2);
        assert_eq!(pack.frames.len() as u32, pack.stats.total_frames_after_dedup);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn dedup_scenario_two_results_keep_frame_b() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(clock);
        m.process_decode_result(decode_result(
            T0,
            vec![rx("AA1AA BB2BB R-05", -14.0, 0.8, 0.40, 1_502.0)],
            0,
        ));
        m.process_decode_result(decode_result(
            T0,
            vec![rx("AA1AA BB2BB R-05", -12.0, 0.7, 0.30, 1_498.0)],
            1,
        ));
        let pack = m.get_slot_pack(&slot_id(T0)).unwrap();
        assert_eq!(pack.frames.len(), 1);
        assert_eq!(pack.frames[0].freq, 1_498.0);
        assert_eq!(pack.frames[0].dt, 0.30);
    }

    #[test]
    fn latest_pack_is_cached_and_recomputed_after_cleanup() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(Arc::clone(&clock));
        m.process_decode_result(decode_result(T0, vec![], 0));
        clock.set(T0 + 15_000 + 100);
        m.process_decode_result(decode_result(T0 + 15_000, vec![], 0));
        assert_eq!(m.get_latest_slot_pack().unwrap().start_ms, T0 + 15_000);

        // Age out only the newer pack by touching the older one later.
        clock.set(T0 + 120_000);
        m.process_decode_result(decode_result(T0, vec![], 1));
        let removed = m.cleanup_expired(DEFAULT_PACK_MAX_AGE_MS);
        assert_eq!(removed, 1);
        assert_eq!(m.get_latest_slot_pack().unwrap().start_ms, T0);
    }

    #[test]
    fn transmission_frame_is_idempotent_within_1hz() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(clock);
        let id = slot_id(T0);
        m.add_transmission_frame(&id, "op1", "CQ AA1AA FN42", 1_500.0, T0 + 1);
        m.add_transmission_frame(&id, "op1", "CQ AA1AA FN42", 1_500.5, T0 + 2);
        let pack = m.get_slot_pack(&id).unwrap();
        assert_eq!(pack.frames.len(), 1);
        assert!(pack.frames[0].is_transmit());
        assert_eq!(pack.frames[0].confidence, 1.0);
    }

    #[test]
    fn last_message_from_callsign_scans_latest_first() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(Arc::clone(&clock));
        m.process_decode_result(decode_result(
            T0,
            vec![rx("CQ BB2BB JN58", -10.0, 0.9, 0.0, 900.0)],
            0,
        ));
        clock.set(T0 + 15_000);
        m.process_decode_result(decode_result(
            T0 + 15_000,
            vec![rx("AA1AA BB2BB -03", -7.0, 0.9, 0.0, 905.0)],
            0,
        ));

        let (frame, info) = m.get_last_message_from_callsign("BB2BB").unwrap();
        assert_eq!(frame.message, "AA1AA BB2BB -03");
        assert_eq!(info.start_ms, T0 + 15_000);
        assert!(m.get_last_message_from_callsign("ZZ9ZZ").is_none());
    }

    #[test]
    fn slot_pack_updated_is_published_in_processing_order() {
        let clock = Arc::new(ManualClock::new(T0));
        let bus = EventBus::new(32);
        let mut rx_events = bus.subscribe();
        let mut m = SlotPackManager::new(FT8.clone(), clock, bus);

        m.process_decode_result(decode_result(T0, vec![rx("CQ AA1AA FN42", -9.0, 0.9, 0.1, 1_200.0)], 0));
        m.process_decode_result(decode_result(T0, vec![], 1));

        let first = rx_events.try_recv().unwrap();
        let second = rx_events.try_recv().unwrap();
        match (first, second) {
            (
                StationEvent::SlotPackUpdated { slot_pack: a },
                StationEvent::SlotPackUpdated { slot_pack: b },
            ) => {
                assert_eq!(a.stats.total_decodes, 1);
                assert_eq!(b.stats.total_decodes, 2);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn clear_all_empties_the_map() {
        let clock = Arc::new(ManualClock::new(T0));
        let mut m = manager(clock);
        m.process_decode_result(decode_result(T0, vec![], 0));
        assert!(!m.is_empty());
        m.clear_all();
        assert!(m.is_empty());
        assert!(m.get_latest_slot_pack().is_none());
    }
}
