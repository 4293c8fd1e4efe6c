/// `scheduler.rs` — sub-window decode driver
///
/// At each sub-window fire the scheduler reads the cumulative audio from the
/// slot boundary out of the ring buffer and queues a decode. Windows are
/// skipped while the station transmits in the current cycle unless the
/// decode-while-transmitting policy allows them.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::AudioRingBuffer;
use crate::codec::{DecodeQueue, DecodeRequest};
use crate::error::Result;
use crate::mode::ModeDescriptor;
use crate::slots::SlotInfo;

pub struct SlotScheduler {
    ring: Arc<AudioRingBuffer>,
    decode_while_transmitting: AtomicBool,
    base_freq_hz: f32,
}

impl SlotScheduler {
    pub fn new(ring: Arc<AudioRingBuffer>, decode_while_transmitting: bool) -> Self {
        Self {
            ring,
            decode_while_transmitting: AtomicBool::new(decode_while_transmitting),
            base_freq_hz: 0.0,
        }
    }

    pub fn set_decode_while_transmitting(&self, allowed: bool) {
        self.decode_while_transmitting.store(allowed, Ordering::SeqCst);
    }

    /// Handle one `sub_window` fire. `transmitting` is the operator
    /// manager's answer for the current cycle.
    pub async fn on_sub_window(
        &self,
        queue: &DecodeQueue,
        slot: &SlotInfo,
        window_idx: usize,
        mode: &ModeDescriptor,
        transmitting: bool,
    ) -> Result<()> {
        let Some(&window_ms) = mode.window_timing.get(window_idx) else {
            log::warn!("sub-window {window_idx} out of range for {}", mode.name);
            return Ok(());
        };
        if transmitting && !self.decode_while_transmitting.load(Ordering::SeqCst) {
            log::debug!(
                "skipping decode window {window_idx} of {}: transmitting",
                slot.id
            );
            return Ok(());
        }

        let pcm = self.ring.read_from_slot_start(slot.start_ms, window_ms);
        queue
            .push(DecodeRequest {
                slot_id: slot.id.clone(),
                slot_start_ms: slot.start_ms,
                window_idx,
                pcm,
                window_offset_ms: window_ms - mode.slot_ms,
                base_freq_hz: self.base_freq_hz,
                mode: mode.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodeOutcome, ScriptedCodec};
    use crate::mode::FT8;
    use tokio::sync::mpsc::unbounded_channel;

    const SLOT: i64 = 1_700_000_010_000;

    fn slot_info() -> SlotInfo {
        SlotInfo::synthesized(SLOT, &FT8)
    }

    #[tokio::test]
    async fn submits_cumulative_window_with_offset() {
        let ring = Arc::new(AudioRingBuffer::with_seconds(16));
        ring.write(&vec![0.5f32; 12_000], SLOT); // first second of the slot

        let codec = Arc::new(ScriptedCodec::new());
        codec.script_decode(vec![]);
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = DecodeQueue::new(codec, 1, out_tx);

        let scheduler = SlotScheduler::new(Arc::clone(&ring), false);
        scheduler
            .on_sub_window(&queue, &slot_info(), 0, &FT8, false)
            .await
            .unwrap();

        match out_rx.recv().await.unwrap() {
            DecodeOutcome::Complete(result) => {
                assert_eq!(result.window_idx, 0);
                // First FT8 window is 5 s: -10 s offset from slot end.
                assert_eq!(result.window_offset_ms, -10_000);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
        queue.shutdown();
    }

    #[tokio::test]
    async fn transmit_cycle_skips_window_unless_policy_allows() {
        let ring = Arc::new(AudioRingBuffer::with_seconds(16));
        let codec = Arc::new(ScriptedCodec::new());
        let (out_tx, mut out_rx) = unbounded_channel();
        let queue = DecodeQueue::new(codec, 1, out_tx);

        let scheduler = SlotScheduler::new(Arc::clone(&ring), false);
        scheduler
            .on_sub_window(&queue, &slot_info(), 0, &FT8, true)
            .await
            .unwrap();
        assert!(out_rx.try_recv().is_err(), "window should have been skipped");

        let permissive = SlotScheduler::new(ring, false);
        permissive.set_decode_while_transmitting(true);
        permissive
            .on_sub_window(&queue, &slot_info(), 1, &FT8, true)
            .await
            .unwrap();
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            DecodeOutcome::Complete(_)
        ));
        queue.shutdown();
    }
}
