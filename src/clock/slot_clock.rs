/// `slot_clock.rs` — UTC-aligned slot event timer
///
/// One named OS thread computes the next due event for the active mode and
/// sleeps until it, re-reading the clock after every fire so drift never
/// accumulates. Events are pushed into the engine dispatcher over an
/// unbounded channel; delivery order equals time order because a single
/// thread fires them.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::clock::ClockSource;
use crate::mode::ModeDescriptor;
use crate::slots::SlotInfo;

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ClockEvent {
    SlotStart(SlotInfo),
    EncodeStart(SlotInfo),
    TransmitStart(SlotInfo),
    SubWindow(SlotInfo, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    SlotStart,
    EncodeStart,
    TransmitStart,
    SubWindow(usize),
}

struct Shared {
    mode: ModeDescriptor,
    compensation_ms: i64,
    /// Staged values applied at the next slot boundary.
    pending_mode: Option<ModeDescriptor>,
    pending_compensation: Option<i64>,
}

// ── SlotClock ────────────────────────────────────────────────────────────────

pub struct SlotClock {
    clock: Arc<dyn ClockSource>,
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    tx: UnboundedSender<ClockEvent>,
}

impl SlotClock {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        mode: ModeDescriptor,
        compensation_ms: i64,
        tx: UnboundedSender<ClockEvent>,
    ) -> Self {
        Self {
            clock,
            shared: Arc::new(Mutex::new(Shared {
                mode,
                compensation_ms,
                pending_mode: None,
                pending_compensation: None,
            })),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            tx,
        }
    }

    pub fn start(&mut self) -> crate::error::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let clock = Arc::clone(&self.clock);
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let tx = self.tx.clone();
        let handle = thread::Builder::new()
            .name("slot-clock".to_string())
            .spawn(move || run_loop(clock, shared, running, tx))
            .map_err(|e| crate::error::EngineError::ResourceStartFailure {
                name: "clock".into(),
                message: e.to_string(),
            })?;
        self.handle = Some(handle);
        log::info!("Slot clock started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        log::info!("Slot clock stopped");
    }

    /// Takes effect at the next slot boundary.
    pub fn set_mode(&self, mode: ModeDescriptor) {
        self.shared.lock().unwrap().pending_mode = Some(mode);
    }

    /// Positive compensation fires every event earlier than nominal.
    /// Takes effect at the next slot boundary.
    pub fn set_compensation(&self, ms: i64) {
        self.shared.lock().unwrap().pending_compensation = Some(ms);
    }

    pub fn compensation_ms(&self) -> i64 {
        self.shared.lock().unwrap().compensation_ms
    }

    pub fn mode(&self) -> ModeDescriptor {
        self.shared.lock().unwrap().mode.clone()
    }

    /// Milliseconds until the next nominal slot boundary.
    pub fn get_next_slot_in(&self) -> i64 {
        let shared = self.shared.lock().unwrap();
        let now = self.clock.now();
        let slot = shared.mode.slot_start_for(now);
        slot + shared.mode.slot_ms - now
    }
}

impl Drop for SlotClock {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Timer loop ───────────────────────────────────────────────────────────────

/// Build the (effective_time, kind) schedule for the slot starting at `start`.
fn slot_schedule(mode: &ModeDescriptor, start: i64, comp: i64) -> Vec<(i64, EventKind)> {
    let mut events = Vec::with_capacity(3 + mode.window_timing.len());
    events.push((start - comp, EventKind::SlotStart));
    let encode_nominal = (start + mode.transmit_timing - mode.encode_advance).max(start);
    events.push((encode_nominal - comp, EventKind::EncodeStart));
    events.push((start + mode.transmit_timing - comp, EventKind::TransmitStart));
    for (idx, w) in mode.window_timing.iter().enumerate() {
        events.push((start + w - comp, EventKind::SubWindow(idx)));
    }
    // Stable on equal times: SlotStart < EncodeStart < TransmitStart < SubWindow.
    events.sort_by_key(|&(t, kind)| (t, kind));
    events
}

fn run_loop(
    clock: Arc<dyn ClockSource>,
    shared: Arc<Mutex<Shared>>,
    running: Arc<AtomicBool>,
    tx: UnboundedSender<ClockEvent>,
) {
    let mut slot_start = {
        let s = shared.lock().unwrap();
        s.mode.slot_start_for(clock.now())
    };
    // Joining mid-slot (or re-gridding after a mode change) skips the
    // already-elapsed part of the slot instead of firing it late.
    let mut fresh = true;

    while running.load(Ordering::SeqCst) {
        // Apply staged changes at the boundary, then snapshot mode/comp for
        // the whole slot.
        let (mode, comp) = {
            let mut s = shared.lock().unwrap();
            if let Some(m) = s.pending_mode.take() {
                s.mode = m;
                slot_start = s.mode.slot_start_for(clock.now());
                fresh = true;
            }
            if let Some(c) = s.pending_compensation.take() {
                s.compensation_ms = c;
            }
            (s.mode.clone(), s.compensation_ms)
        };

        let joined_at = clock.now();
        for (effective, kind) in slot_schedule(&mode, slot_start, comp) {
            if fresh && effective < joined_at {
                continue;
            }
            if !wait_until(&*clock, &running, effective) {
                return;
            }
            let now = clock.now();
            // A fire past tolerance is still delivered; the measured phase
            // travels with the event.
            let late = now - effective;
            if late > mode.tolerance_ms {
                log::debug!(
                    "slot clock fired {late} ms late (tolerance {} ms) for {kind:?}",
                    mode.tolerance_ms
                );
            }
            let info = SlotInfo::new(slot_start, now, effective, &mode);
            let event = match kind {
                EventKind::SlotStart => ClockEvent::SlotStart(info),
                EventKind::EncodeStart => ClockEvent::EncodeStart(info),
                EventKind::TransmitStart => ClockEvent::TransmitStart(info),
                EventKind::SubWindow(idx) => ClockEvent::SubWindow(info, idx),
            };
            if tx.send(event).is_err() {
                // Dispatcher gone; nothing left to drive.
                running.store(false, Ordering::SeqCst);
                return;
            }
        }

        fresh = false;
        slot_start += mode.slot_ms;
    }
}

/// Sleep until `clock.now() >= target` or the clock is stopped. Returns false
/// when stopped. Polls in short quanta so a `ManualClock` can drive it.
fn wait_until(clock: &dyn ClockSource, running: &AtomicBool, target: i64) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = target - clock.now();
        if remaining <= 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(remaining.clamp(1, 25) as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mode::{FT4, FT8};
    use tokio::sync::mpsc::unbounded_channel;

    // A UTC-aligned FT8 boundary: 113_333_335 * 15_000.
    const SLOT: i64 = 1_700_000_025_000;

    fn drain_until(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ClockEvent>,
        want: usize,
    ) -> Vec<ClockEvent> {
        let mut out = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while out.len() < want && std::time::Instant::now() < deadline {
            match rx.try_recv() {
                Ok(e) => out.push(e),
                Err(_) => thread::sleep(Duration::from_millis(2)),
            }
        }
        out
    }

    #[test]
    fn schedule_orders_events_within_a_slot() {
        let events = slot_schedule(&FT8, SLOT, 0);
        let times: Vec<i64> = events.iter().map(|e| e.0).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        // FT8: encode start bounded to the slot start (500 - 1500 < 0).
        assert_eq!(events[0], (SLOT, EventKind::SlotStart));
        assert_eq!(events[1], (SLOT, EventKind::EncodeStart));
        assert!(events.contains(&(SLOT + 500, EventKind::TransmitStart)));
        assert!(events.contains(&(SLOT + 15_000, EventKind::SubWindow(2))));
    }

    #[test]
    fn compensation_shifts_every_fire_earlier() {
        let events = slot_schedule(&FT8, SLOT, 300);
        assert_eq!(events[0].0, SLOT - 300);
        assert!(events.contains(&(SLOT + 500 - 300, EventKind::TransmitStart)));
    }

    #[test]
    fn fires_slot_start_with_measured_phase() {
        let clock = Arc::new(ManualClock::new(SLOT - 10));
        let (tx, mut rx) = unbounded_channel();
        let mut sc = SlotClock::new(clock.clone(), FT8.clone(), 0, tx);
        sc.start().unwrap();

        clock.set(SLOT + 3); // 3 ms past the boundary
        // The tail of the joined slot (its final sub-window sits exactly on
        // the boundary) may fire first; then the new slot opens.
        let events = drain_until(&mut rx, 3);
        sc.stop();

        let slot_start = events
            .iter()
            .find_map(|e| match e {
                ClockEvent::SlotStart(info) => Some(info.clone()),
                _ => None,
            })
            .expect("no SlotStart fired");
        assert_eq!(slot_start.start_ms, SLOT);
        assert_eq!(slot_start.start_ms % FT8.slot_ms, 0);
        assert!(slot_start.phase_ms >= 0);
        assert_eq!(slot_start.id, format!("slot-{SLOT}"));

        let encode_pos = events
            .iter()
            .position(|e| matches!(e, ClockEvent::EncodeStart(i) if i.start_ms == SLOT));
        let slot_pos = events
            .iter()
            .position(|e| matches!(e, ClockEvent::SlotStart(i) if i.start_ms == SLOT));
        assert!(
            encode_pos > slot_pos,
            "encode_start must follow slot_start: {events:?}"
        );
    }

    #[test]
    fn sub_windows_fire_in_index_order() {
        let clock = Arc::new(ManualClock::new(SLOT));
        let (tx, mut rx) = unbounded_channel();
        let mut sc = SlotClock::new(clock.clone(), FT8.clone(), 0, tx);
        sc.start().unwrap();

        clock.set(SLOT + FT8.slot_ms); // whole slot elapses at once
        let events = drain_until(&mut rx, 6);
        sc.stop();

        let windows: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ClockEvent::SubWindow(_, idx) => Some(*idx),
                _ => None,
            })
            .collect();
        assert_eq!(windows, vec![0, 1, 2]);
    }

    #[test]
    fn mode_change_applies_at_next_boundary() {
        let clock = Arc::new(ManualClock::new(SLOT));
        let (tx, mut rx) = unbounded_channel();
        let mut sc = SlotClock::new(clock.clone(), FT8.clone(), 0, tx);
        sc.start().unwrap();

        // Let the FT8 slot play out fully, then switch.
        clock.set(SLOT + FT8.slot_ms);
        let _ = drain_until(&mut rx, 6);
        sc.set_mode(FT4.clone());
        clock.set(SLOT + FT8.slot_ms + FT4.slot_ms);
        let events = drain_until(&mut rx, 6);
        sc.stop();

        let saw_ft4 = events.iter().any(|e| match e {
            ClockEvent::SlotStart(info) => info.mode == "FT4",
            _ => false,
        });
        assert!(saw_ft4, "expected an FT4 slot after the staged mode change");
    }

    #[test]
    fn next_slot_in_counts_down_to_boundary() {
        let clock = Arc::new(ManualClock::new(SLOT + 1_000));
        let (tx, _rx) = unbounded_channel();
        let sc = SlotClock::new(clock, FT8.clone(), 0, tx);
        assert_eq!(sc.get_next_slot_in(), 14_000);
    }
}
