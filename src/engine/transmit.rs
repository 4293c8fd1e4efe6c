/// `transmit.rs` — encode → mix → play → PTT pipeline
///
/// Every completed encode lands here. The pipeline decides when its audio
/// may start (normal trigger, delayed, or mid-slot with leading trim),
/// batches it through the mixer, launches PTT and playback together, and
/// keys PTT off a hold interval after the audio ends. A slot boundary is a
/// hard safety net: whatever is keyed gets unkeyed.
use std::sync::{
    atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::audio::{AudioContribution, AudioMixer, AudioOutput, MixedAudio, PlaybackStatus};
use crate::clock::ClockSource;
use crate::codec::EncodeResult;
use crate::engine::tracker::TransmissionTracker;
use crate::events::{EventBus, StationEvent};
use crate::radio::RadioController;
use crate::slots::SlotInfo;

pub const PTT_HOLD_MS: i64 = 200;
/// A completion this far off the nominal transmit trigger counts as a
/// mid-slot switch.
const MID_SLOT_THRESHOLD_MS: i64 = 100;

pub struct TransmitPipeline {
    clock: Arc<dyn ClockSource>,
    output: Arc<AudioOutput>,
    mixer: Arc<AudioMixer>,
    radio: RadioController,
    events: EventBus,
    tracker: Arc<Mutex<TransmissionTracker>>,
    /// Encodes dispatched vs completed for the current slot.
    expected_encodes: AtomicU32,
    completed_encodes: AtomicU32,
    /// Generation counter: bumping it cancels any scheduled PTT-off.
    ptt_generation: Arc<AtomicU64>,
    ptt_task: Mutex<Option<JoinHandle<()>>>,
    play_task: Mutex<Option<JoinHandle<()>>>,
    /// Composition waiting for its transmit instant; a second mix arriving
    /// before the gate opens merges into it instead of racing it.
    staged: Mutex<Option<MixedAudio>>,
    /// Mirror of the slot clock's compensation so gated playback fires as
    /// early as the rest of the chain.
    compensation_ms: AtomicI64,
}

impl TransmitPipeline {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        output: Arc<AudioOutput>,
        mixer: Arc<AudioMixer>,
        radio: RadioController,
        events: EventBus,
        tracker: Arc<Mutex<TransmissionTracker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            output,
            mixer,
            radio,
            events,
            tracker,
            expected_encodes: AtomicU32::new(0),
            completed_encodes: AtomicU32::new(0),
            ptt_generation: Arc::new(AtomicU64::new(0)),
            ptt_task: Mutex::new(None),
            play_task: Mutex::new(None),
            staged: Mutex::new(None),
            compensation_ms: AtomicI64::new(0),
        })
    }

    pub fn set_compensation(&self, ms: i64) {
        self.compensation_ms.store(ms, Ordering::SeqCst);
    }

    pub fn add_expected_encodes(&self, n: u32) {
        self.expected_encodes.fetch_add(n, Ordering::SeqCst);
    }

    // ── Clock hooks ───────────────────────────────────────────────────────

    /// Slot boundary: force PTT off (safety net), drop any composition that
    /// never made it on air, and reset the counters.
    pub async fn on_slot_start(&self, _slot: &SlotInfo) {
        self.cancel_ptt_timer();
        if let Some(stale) = self.staged.lock().unwrap().take() {
            log::warn!(
                "dropping staged composition for {:?}: its slot ended",
                stale.operator_ids
            );
        }
        if self.radio.is_ptt() {
            log::warn!("PTT still asserted at slot boundary; forcing off");
            self.force_ptt_off().await;
        }
        self.expected_encodes.store(0, Ordering::SeqCst);
        self.completed_encodes.store(0, Ordering::SeqCst);
    }

    /// Transmit trigger: late encodes get a warning, not an abort; their
    /// audio still plays mid-slot.
    pub fn on_transmit_start(&self, slot: &SlotInfo) {
        let expected = self.expected_encodes.load(Ordering::SeqCst);
        let completed = self.completed_encodes.load(Ordering::SeqCst);
        if completed < expected {
            log::warn!(
                "transmit start with {completed}/{expected} encodes ready in {}",
                slot.id
            );
            self.events.publish(StationEvent::TimingWarning {
                slot_id: slot.id.clone(),
                expected_encodes: expected,
                completed_encodes: completed,
            });
        }
    }

    // ── Encode results ────────────────────────────────────────────────────

    pub async fn on_encode_complete(self: &Arc<Self>, result: EncodeResult) {
        let now = self.clock.now();
        self.completed_encodes.fetch_add(1, Ordering::SeqCst);
        let request = &result.request;
        self.tracker
            .lock()
            .unwrap()
            .encode_completed(&result.operator_id, request.slot_start_ms, now);
        // A newer encode for this operator supersedes anything still queued.
        self.mixer.clear_operator_audio(&result.operator_id);

        let transmit_timing = request.mode.transmit_timing;
        let time_since = request.time_since_slot_start_ms;
        let is_mid_slot =
            time_since > 0 && (time_since - transmit_timing).abs() > MID_SLOT_THRESHOLD_MS;

        let elapsed_in_slot = now - request.slot_start_ms;
        let (playback_start_ms, audio_skip_ms) = if is_mid_slot {
            if elapsed_in_slot >= transmit_timing {
                (now, elapsed_in_slot - transmit_timing)
            } else {
                (request.slot_start_ms + transmit_timing, 0)
            }
        } else {
            (request.slot_start_ms + transmit_timing, 0)
        };

        let duration_ms = (result.duration_sec * 1_000.0) as i64;
        let mut pcm = result.pcm;
        if audio_skip_ms > 0 {
            if audio_skip_ms >= duration_ms {
                log::warn!(
                    "operator {} missed its transmit window ({audio_skip_ms} ms past {duration_ms} ms of audio)",
                    result.operator_id
                );
                self.tracker.lock().unwrap().completed(
                    &result.operator_id,
                    request.slot_start_ms,
                    now,
                    false,
                );
                self.events.publish(StationEvent::TransmissionComplete {
                    operator_id: result.operator_id.clone(),
                    success: false,
                    duration_sec: None,
                    mixed_with: Vec::new(),
                    error: Some("missed window".into()),
                });
                return;
            }
            let skip_samples = (audio_skip_ms * result.sample_rate as i64 / 1_000) as usize;
            pcm.drain(..skip_samples.min(pcm.len()));
            log::info!(
                "mid-slot switch for {}: trimmed {audio_skip_ms} ms, {} samples remain",
                result.operator_id,
                pcm.len()
            );
        }

        let contribution = AudioContribution {
            operator_id: result.operator_id.clone(),
            pcm,
            sample_rate: result.sample_rate,
            slot_start_ms: request.slot_start_ms,
            playback_start_ms,
            target_playback_ms: request.slot_start_ms + transmit_timing,
        };

        if self.output.is_playing() {
            // Someone is already on air: fold this contribution in from the
            // current play position.
            self.mixer.add_audio(contribution);
            let elapsed = self.output.stop_current_playback().await;
            let stopped_task = self.play_task.lock().unwrap().take();
            if let Some(handle) = stopped_task {
                let _ = handle.await;
            }
            if let Some(remix) = self.mixer.remix_with_new_audio(elapsed) {
                log::info!(
                    "remixed at +{elapsed} ms for {:?} ({:.2} s remain)",
                    remix.operator_ids,
                    remix.duration_sec
                );
                self.start_playback(remix, false);
            }
        } else {
            self.mixer.add_audio(contribution);
        }
    }

    // ── Mixed audio ───────────────────────────────────────────────────────

    /// Mix window closed: start the composition at its scheduled instant.
    pub fn on_mixed_ready(self: &Arc<Self>, mixed: MixedAudio) {
        let now = self.clock.now();
        {
            let mut tracker = self.tracker.lock().unwrap();
            for op in &mixed.operator_ids {
                tracker.mixed_ready(op, slot_of(&mixed), now);
            }
        }
        self.start_playback(mixed, true);
    }

    /// Launch PTT and playback together. `gate_on_target` holds the launch
    /// until the composition's transmit instant (minus compensation);
    /// remixes play immediately.
    fn start_playback(self: &Arc<Self>, mixed: MixedAudio, gate_on_target: bool) {
        let generation = self.ptt_generation.load(Ordering::SeqCst);

        if gate_on_target {
            let gate = {
                let mut staged = self.staged.lock().unwrap();
                match staged.as_mut() {
                    Some(existing) => {
                        // A waiter already exists; fold this composition in
                        // and let it carry both.
                        *existing = crate::audio::mixer::merge_mixed(existing, &mixed);
                        log::debug!(
                            "merged late composition into staged playback ({:?})",
                            existing.operator_ids
                        );
                        return;
                    }
                    None => {
                        let gate = mixed.target_playback_ms
                            - self.compensation_ms.load(Ordering::SeqCst);
                        *staged = Some(mixed);
                        gate
                    }
                }
            };
            let pipeline = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let wait = gate - pipeline.clock.now();
                if wait > 0 {
                    tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                }
                if pipeline.ptt_generation.load(Ordering::SeqCst) != generation {
                    pipeline.staged.lock().unwrap().take();
                    return; // slot boundary or stop got there first
                }
                let staged = pipeline.staged.lock().unwrap().take();
                let Some(mixed) = staged else { return };
                pipeline.launch(mixed).await;
            });
            *self.play_task.lock().unwrap() = Some(handle);
            return;
        }

        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if pipeline.ptt_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            pipeline.launch(mixed).await;
        });
        *self.play_task.lock().unwrap() = Some(handle);
    }

    /// The actual on-air sequence for one composition.
    async fn launch(self: &Arc<Self>, mixed: MixedAudio) {
        let pipeline = self;
        let now = pipeline.clock.now();
        let slot_start = slot_of(&mixed);
        {
            let mut tracker = pipeline.tracker.lock().unwrap();
            for op in &mixed.operator_ids {
                tracker.playback_started(op, slot_start, now);
            }
        }
        pipeline.mixer.note_playing(&mixed);

        let duration_ms = (mixed.duration_sec * 1_000.0) as i64;
        pipeline.schedule_ptt_off(duration_ms + PTT_HOLD_MS);

        // PTT and playback launch together; the PTT event fires the moment
        // the rig acknowledges, not when the audio ends.
        let ptt = async {
            match pipeline.radio.set_ptt(true).await {
                Ok(()) => pipeline
                    .events
                    .publish(StationEvent::PttStatusChanged { active: true }),
                Err(e) => log::warn!("PTT assert failed: {e}"),
            }
        };
        let play = pipeline.output.play_audio(&mixed.pcm, mixed.sample_rate);
        let ((), play_result) = tokio::join!(ptt, play);

        match play_result {
            Ok(PlaybackStatus::Completed) => {
                pipeline.mixer.note_stopped();
                let finished = pipeline.clock.now();
                let mut tracker = pipeline.tracker.lock().unwrap();
                for op in &mixed.operator_ids {
                    tracker.completed(op, slot_start, finished, true);
                    let mixed_with: Vec<String> = mixed
                        .operator_ids
                        .iter()
                        .filter(|o| *o != op)
                        .cloned()
                        .collect();
                    pipeline.events.publish(StationEvent::TransmissionComplete {
                        operator_id: op.clone(),
                        success: true,
                        duration_sec: Some(mixed.duration_sec),
                        mixed_with,
                        error: None,
                    });
                }
            }
            Ok(PlaybackStatus::Stopped { elapsed_ms }) => {
                // Remix in progress; the successor playback reports.
                log::debug!("playback stopped at {elapsed_ms} ms for recomposition");
            }
            Err(e) => {
                log::error!("playback failed: {e}");
                pipeline.mixer.note_stopped();
                for op in &mixed.operator_ids {
                    pipeline.events.publish(StationEvent::TransmissionComplete {
                        operator_id: op.clone(),
                        success: false,
                        duration_sec: None,
                        mixed_with: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
                pipeline.force_ptt_off().await;
            }
        }
    }

    // ── PTT management ────────────────────────────────────────────────────

    fn schedule_ptt_off(self: &Arc<Self>, delay_ms: i64) {
        self.cancel_ptt_timer();
        let generation = self.ptt_generation.load(Ordering::SeqCst);
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms.max(0) as u64)).await;
            if pipeline.ptt_generation.load(Ordering::SeqCst) == generation {
                if let Err(e) = pipeline.radio.set_ptt(false).await {
                    log::warn!("scheduled PTT release failed: {e}");
                }
                pipeline
                    .events
                    .publish(StationEvent::PttStatusChanged { active: false });
            }
        });
        *self.ptt_task.lock().unwrap() = Some(handle);
    }

    fn cancel_ptt_timer(&self) {
        self.ptt_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.ptt_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub async fn force_ptt_off(&self) {
        self.cancel_ptt_timer();
        if let Err(e) = self.radio.set_ptt(false).await {
            log::warn!("forced PTT release failed: {e}");
        }
        self.events
            .publish(StationEvent::PttStatusChanged { active: false });
    }

    /// Radio loss, step one: kill any on-air audio and PTT. Returns whether
    /// a transmission was in progress, so the caller can decide whether the
    /// user needs the mid-over advisory.
    pub async fn quell_for_disconnect(&self) -> bool {
        let transmitting = self.output.is_playing() || self.radio.is_ptt();
        if self.output.is_playing() {
            let elapsed = self.output.stop_current_playback().await;
            log::warn!("radio disconnected {elapsed} ms into playback");
        }
        self.staged.lock().unwrap().take();
        self.mixer.reset();
        self.force_ptt_off().await;
        transmitting
    }

    /// Radio loss, step two: tell the user what just happened to their
    /// final. Published only once the engine has left RUNNING.
    pub fn publish_disconnect_advisory(&self, reason: &str) {
        self.events
            .publish(StationEvent::RadioDisconnectedDuringTransmission {
                reason: reason.to_string(),
                recommendation:
                    "Reduce transmit power and check the feedline and power supply; RF feedback \
                     during transmit is the usual cause of mid-over radio drops."
                        .into(),
            });
    }

    /// Both disconnect steps back to back, for callers with no state
    /// machine in between.
    pub async fn handle_radio_disconnect(&self, reason: &str) {
        if self.quell_for_disconnect().await {
            self.publish_disconnect_advisory(reason);
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.output.is_playing() || self.radio.is_ptt()
    }
}

fn slot_of(mixed: &MixedAudio) -> i64 {
    mixed.slot_start_ms
}
