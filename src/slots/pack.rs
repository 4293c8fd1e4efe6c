/// `pack.rs` — frame aggregation rules for one slot
///
/// Own-transmit frames keep arrival order and are never de-duplicated.
/// Received frames collapse to one best frame per distinct trimmed message
/// text, ordered by the text's first appearance across everything the slot
/// has seen.
use crate::slots::types::{FrameMessage, SlotPack};

/// Audio centre the final tie-break pulls toward.
const CENTER_FREQ_HZ: f32 = 1_500.0;

/// Lexicographic best-frame rule: SNR (if clearly apart), then confidence,
/// then |dt|, then distance from the band centre.
pub fn better<'a>(a: &'a FrameMessage, b: &'a FrameMessage) -> &'a FrameMessage {
    if (a.snr - b.snr).abs() > 3.0 {
        return if a.snr > b.snr { a } else { b };
    }
    if (a.confidence - b.confidence).abs() > 0.1 {
        return if a.confidence > b.confidence { a } else { b };
    }
    if (a.dt.abs() - b.dt.abs()).abs() > 0.05 {
        return if a.dt.abs() < b.dt.abs() { a } else { b };
    }
    if (a.freq - CENTER_FREQ_HZ).abs() <= (b.freq - CENTER_FREQ_HZ).abs() {
        a
    } else {
        b
    }
}

/// Append a decode window's frames to the pack: fold the window offset back
/// into dt, then rebuild `frames` as transmit frames (arrival order) followed
/// by the best received frame per message text (first-appearance order).
pub fn append_frames(pack: &mut SlotPack, incoming: Vec<FrameMessage>, window_offset_ms: i64) {
    let offset_s = window_offset_ms as f32 / 1_000.0;
    let adjusted = incoming.into_iter().map(|mut f| {
        if !f.is_transmit() {
            f.dt -= offset_s;
        }
        f
    });

    let mut transmit: Vec<FrameMessage> = Vec::new();
    let mut groups: Vec<(String, FrameMessage)> = Vec::new();

    for frame in pack.frames.drain(..).chain(adjusted) {
        if frame.is_transmit() {
            transmit.push(frame);
            continue;
        }
        let key = frame.message.trim().to_string();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, best)) => {
                if !std::ptr::eq(better(best, &frame), &*best) {
                    *best = frame;
                }
            }
            None => groups.push((key, frame)),
        }
    }

    pack.frames = transmit;
    pack.frames.extend(groups.into_iter().map(|(_, f)| f));
}

/// Prepend an own-transmit frame unless an equivalent one (same message,
/// |Δfreq| < 1 Hz) is already recorded. Returns whether the pack changed.
pub fn add_transmit_frame(pack: &mut SlotPack, message: &str, freq_hz: f32) -> bool {
    let duplicate = pack
        .frames
        .iter()
        .any(|f| f.is_transmit() && f.message == message && (f.freq - freq_hz).abs() < 1.0);
    if duplicate {
        return false;
    }
    pack.frames.insert(
        0,
        FrameMessage {
            message: message.to_string(),
            snr: crate::slots::types::TRANSMIT_SNR,
            dt: 0.0,
            freq: freq_hz,
            confidence: 1.0,
        },
    );
    true
}

/// Centre of the widest unoccupied gap in `[min, max]`, keeping at least
/// `guard/2` Hz away from each occupied neighbour. No occupancy returns the
/// band midpoint; no wide-enough gap returns None.
pub fn find_best_transmit_frequency(
    pack: &SlotPack,
    min_hz: f32,
    max_hz: f32,
    guard_hz: f32,
) -> Option<f32> {
    let mut used: Vec<f32> = pack
        .frames
        .iter()
        .map(|f| f.freq)
        .filter(|&f| f >= min_hz && f <= max_hz)
        .collect();
    if used.is_empty() {
        return Some((min_hz + max_hz) / 2.0);
    }
    used.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut boundaries = Vec::with_capacity(used.len() + 2);
    boundaries.push(min_hz);
    boundaries.extend(used);
    boundaries.push(max_hz);

    let mut best_gap = 0.0f32;
    let mut best_center = None;
    for pair in boundaries.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > best_gap {
            best_gap = gap;
            best_center = Some((pair[0] + pair[1]) / 2.0);
        }
    }
    // Half the gap is the distance to the nearest neighbour.
    if best_gap / 2.0 >= guard_hz / 2.0 {
        best_center
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::FT8;

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
    fn received_frames_dedupe_by_trimmed_text() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        append_frames(
            &mut pack,
            vec![
                rx("CQ AA1AA FN42", -10.0, 0.9, 0.1, 1_000.0),
                rx("  CQ AA1AA FN42  ", -11.0, 0.9, 0.1, 1_010.0),
                rx("CQ CC3CC JN58", -4.0, 0.9, 0.0, 2_000.0),
            ],
            0,
        );
        assert_eq!(pack.frames.len(), 2);
        assert_eq!(pack.frames[0].message.trim(), "CQ AA1AA FN42");
        assert_eq!(pack.frames[1].message, "CQ CC3CC JN58");
    }

    #[test]
    fn snr_gap_over_3db_wins_outright() {
        let a = rx("X", -14.0, 0.2, 9.0, 100.0);
        let b = rx("X", -10.0, 0.9, 0.0, 1_500.0);
        assert_eq!(better(&a, &b).snr, -10.0);
    }

    #[test]
    fn tie_break_cascade_reaches_dt() {
        // 2 dB apart, confidence apart by exactly 0.1 (not > 0.1), |dt|
        // apart by 0.10: the cascade falls through to dt and B wins.
        let a = rx("AA1AA BB2BB R-05", -14.0, 0.8, 0.40, 1_502.0);
        let b = rx("AA1AA BB2BB R-05", -12.0, 0.7, 0.30, 1_498.0);
        let chosen = better(&a, &b);
        assert_eq!(chosen.dt, 0.30);
        assert_eq!(chosen.freq, 1_498.0);
    }

    #[test]
    fn final_tie_break_is_distance_from_1500() {
        let a = rx("X", -10.0, 0.9, 0.10, 1_900.0);
        let b = rx("X", -10.0, 0.9, 0.12, 1_520.0);
        assert_eq!(better(&a, &b).freq, 1_520.0);
    }

    #[test]
    fn window_offset_folds_into_dt() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        append_frames(&mut pack, vec![rx("X", -10.0, 0.9, 0.5, 1_500.0)], -10_000);
        assert!((pack.frames[0].dt - 10.5).abs() < 1e-3);
    }

    #[test]
    fn transmit_frames_keep_order_and_never_dedupe() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        assert!(add_transmit_frame(&mut pack, "CQ AA1AA FN42", 1_500.0));
        assert!(add_transmit_frame(&mut pack, "CQ BB2BB FN42", 1_800.0));
        // Transmit frames prepend, so newest-first within the transmit block.
        assert_eq!(pack.frames[0].message, "CQ BB2BB FN42");
        // Same text as a *received* frame must not collapse with transmit.
        append_frames(&mut pack, vec![rx("CQ AA1AA FN42", -8.0, 0.9, 0.1, 1_500.0)], 0);
        assert_eq!(pack.frames.len(), 3);
        assert!(pack.frames[0].is_transmit());
        assert!(pack.frames[1].is_transmit());
        assert!(!pack.frames[2].is_transmit());
    }

    #[test]
    fn duplicate_transmit_within_1hz_is_ignored() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        assert!(add_transmit_frame(&mut pack, "CQ AA1AA FN42", 1_500.0));
        assert!(!add_transmit_frame(&mut pack, "CQ AA1AA FN42", 1_500.4));
        assert!(add_transmit_frame(&mut pack, "CQ AA1AA FN42", 1_502.0));
        assert_eq!(pack.frames.len(), 2);
    }

    #[test]
    fn reprocessing_identical_frames_is_idempotent() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        let frames = vec![
            rx("AA1AA BB2BB R-05", -14.0, 0.8, 0.40, 1_502.0),
            rx("AA1AA BB2BB R-05", -12.0, 0.7, 0.30, 1_498.0),
        ];
        append_frames(&mut pack, frames.clone(), 0);
        let first = pack.frames.clone();
        append_frames(&mut pack, frames, 0);
        assert_eq!(pack.frames, first);
    }

    #[test]
    fn best_frequency_on_empty_pack_is_midpoint() {
        let pack = SlotPack::new(0, FT8.slot_ms);
        assert_eq!(
            find_best_transmit_frequency(&pack, 300.0, 3_500.0, 100.0),
            Some(1_900.0)
        );
    }

    #[test]
    fn best_frequency_picks_widest_gap_center() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        append_frames(
            &mut pack,
            vec![
                rx("A", -10.0, 0.9, 0.0, 500.0),
                rx("B", -10.0, 0.9, 0.0, 700.0),
                rx("C", -10.0, 0.9, 0.0, 3_400.0),
            ],
            0,
        );
        // Widest gap is 700..3400 -> center 2050.
        assert_eq!(
            find_best_transmit_frequency(&pack, 300.0, 3_500.0, 100.0),
            Some(2_050.0)
        );
    }

    #[test]
    fn best_frequency_none_when_band_is_packed() {
        let mut pack = SlotPack::new(0, FT8.slot_ms);
        let frames = (0..65)
            .map(|i| rx(&format!("m{i}"), -10.0, 0.9, 0.0, 300.0 + i as f32 * 50.0))
            .collect();
        append_frames(&mut pack, frames, 0);
        // Every gap is 50 Hz < guard 100.
        assert_eq!(
            find_best_transmit_frequency(&pack, 300.0, 3_500.0, 100.0),
            None
        );
    }
}
