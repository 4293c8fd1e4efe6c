use serde::{Deserialize, Deserializer, Serialize};

// ── Mode descriptors ─────────────────────────────────────────────────────────

/// How transmit cycles partition the slot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleType {
    /// Cycles alternate even/odd; an operator transmits on cycle numbers
    /// whose parity is in its `transmit_cycles` set ({0} or {1} or both).
    EvenOdd,
    /// Every cycle is a candidate; `transmit_cycles` holds absolute cycle
    /// numbers.
    Continuous,
}

/// Immutable per-mode timing description.
///
/// All offsets are milliseconds relative to the UTC-aligned slot start.
/// `window_timing` entries are cumulative sub-window lengths at which a
/// decode pass is triggered over `[slot_start, slot_start + entry)`.
///
/// Descriptors are static; deserialisation resolves by name against the
/// known set rather than rebuilding timing tables from the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeDescriptor {
    pub name: &'static str,
    pub slot_ms: i64,
    pub cycle_type: CycleType,
    pub window_timing: &'static [i64],
    /// Lead time before `transmit_timing` at which encoding must start.
    pub encode_advance: i64,
    /// Offset from slot start at which playback should begin.
    pub transmit_timing: i64,
    pub tolerance_ms: i64,
    /// Nominal on-air signal duration in seconds.
    pub signal_duration_sec: f64,
}

pub const FT8: ModeDescriptor = ModeDescriptor {
    name: "FT8",
    slot_ms: 15_000,
    cycle_type: CycleType::EvenOdd,
    window_timing: &[5_000, 10_000, 15_000],
    encode_advance: 1_500,
    transmit_timing: 500,
    tolerance_ms: 20,
    signal_duration_sec: 12.64,
};

pub const FT4: ModeDescriptor = ModeDescriptor {
    name: "FT4",
    slot_ms: 7_500,
    cycle_type: CycleType::EvenOdd,
    window_timing: &[2_500, 5_000, 7_500],
    encode_advance: 1_000,
    transmit_timing: 300,
    tolerance_ms: 20,
    signal_duration_sec: 6.4,
};

impl ModeDescriptor {
    pub fn by_name(name: &str) -> Option<&'static ModeDescriptor> {
        match name.to_ascii_uppercase().as_str() {
            "FT8" => Some(&FT8),
            "FT4" => Some(&FT4),
            _ => None,
        }
    }

    /// Cycle number of the slot containing `start_ms`.
    pub fn cycle_number(&self, slot_start_ms: i64) -> i64 {
        slot_start_ms.div_euclid(self.slot_ms)
    }

    /// Cycle phase an operator's `transmit_cycles` set is matched against.
    pub fn cycle_phase(&self, slot_start_ms: i64) -> i64 {
        let cycle = self.cycle_number(slot_start_ms);
        match self.cycle_type {
            CycleType::EvenOdd => cycle.rem_euclid(2),
            CycleType::Continuous => cycle,
        }
    }

    /// Slot start containing the instant `now_ms`.
    pub fn slot_start_for(&self, now_ms: i64) -> i64 {
        now_ms.div_euclid(self.slot_ms) * self.slot_ms
    }

    /// Expected encoded PCM length at `sample_rate`, used to cap runaway
    /// encoder output (anything over 1.5x is truncated).
    pub fn max_encoded_samples(&self, sample_rate: u32) -> usize {
        (self.signal_duration_sec * 1.5 * sample_rate as f64) as usize
    }
}

impl Default for ModeDescriptor {
    fn default() -> Self {
        FT8.clone()
    }
}

impl<'de> Deserialize<'de> for ModeDescriptor {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Named {
            name: String,
        }
        let named = Named::deserialize(deserializer)?;
        ModeDescriptor::by_name(&named.name)
            .cloned()
            .ok_or_else(|| serde::de::Error::custom(format!("unknown mode '{}'", named.name)))
    }
}
