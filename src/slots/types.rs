use serde::{Deserialize, Serialize};

use crate::mode::ModeDescriptor;

/// SNR sentinel marking a frame the station transmitted itself.
pub const TRANSMIT_SNR: f32 = -999.0;

// ── SlotInfo ─────────────────────────────────────────────────────────────────

/// Identity and measured phase of one UTC-aligned slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// `"slot-{start_ms}"`
    pub id: String,
    pub start_ms: i64,
    /// `now - effective_fire_time` measured when the event fired.
    pub phase_ms: i64,
    /// `now - start_ms`; negative when compensation fires the event early.
    pub drift_ms: i64,
    pub cycle_number: i64,
    pub utc_seconds: i64,
    pub mode: String,
}

impl SlotInfo {
    pub fn new(start_ms: i64, now_ms: i64, effective_ms: i64, mode: &ModeDescriptor) -> Self {
        Self {
            id: slot_id(start_ms),
            start_ms,
            phase_ms: now_ms - effective_ms,
            drift_ms: now_ms - start_ms,
            cycle_number: mode.cycle_number(start_ms),
            utc_seconds: start_ms.div_euclid(1000),
            mode: mode.name.to_string(),
        }
    }

    /// A SlotInfo for a slot observed only through stored data (no measured
    /// phase available).
    pub fn synthesized(start_ms: i64, mode: &ModeDescriptor) -> Self {
        Self::new(start_ms, start_ms, start_ms, mode)
    }
}

pub fn slot_id(start_ms: i64) -> String {
    format!("slot-{start_ms}")
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// One decoded (or self-transmitted) frame within a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub message: String,
    /// dB; `TRANSMIT_SNR` (-999) marks an own-transmit frame.
    pub snr: f32,
    /// Seconds from slot start.
    pub dt: f32,
    /// Audio frequency in Hz.
    pub freq: f32,
    /// 0..=1
    pub confidence: f32,
}

impl FrameMessage {
    pub fn is_transmit(&self) -> bool {
        self.snr <= TRANSMIT_SNR
    }
}

// ── SlotPack ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotPackStats {
    pub total_decodes: u32,
    pub successful_decodes: u32,
    pub total_frames_before_dedup: u32,
    pub total_frames_after_dedup: u32,
    /// ms since epoch of the last mutation.
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeHistoryEntry {
    pub window_idx: usize,
    pub timestamp: i64,
    pub frame_count: usize,
    pub processing_time_ms: i64,
}

/// Aggregated best-so-far decode state for one slot.
///
/// `frames` keeps every own-transmit frame first (arrival order, never
/// de-duplicated) followed by one best frame per distinct received message
/// text, ordered by first appearance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotPack {
    pub slot_id: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub frames: Vec<FrameMessage>,
    pub stats: SlotPackStats,
    pub decode_history: Vec<DecodeHistoryEntry>,
}

impl SlotPack {
    pub fn new(start_ms: i64, slot_ms: i64) -> Self {
        Self {
            slot_id: slot_id(start_ms),
            start_ms,
            end_ms: start_ms + slot_ms,
            frames: Vec::new(),
            stats: SlotPackStats::default(),
            decode_history: Vec::new(),
        }
    }

    pub fn transmit_frames(&self) -> impl Iterator<Item = &FrameMessage> {
        self.frames.iter().filter(|f| f.is_transmit())
    }

    pub fn received_frames(&self) -> impl Iterator<Item = &FrameMessage> {
        self.frames.iter().filter(|f| !f.is_transmit())
    }
}

// ── Persistence record ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageOperation {
    Created,
    Updated,
}

/// One JSON line in `frames-YYYY-MM-DD.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotPackStorageRecord {
    pub stored_at: i64,
    pub operation: StorageOperation,
    pub slot_pack: SlotPack,
    pub mode: String,
    pub version: String,
}

pub const STORAGE_RECORD_VERSION: &str = "1.0.0";
