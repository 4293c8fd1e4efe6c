/// `mixer.rs` — time-aligned transmit audio mixer
///
/// Per-operator encoded clips are collected for a short mix window (so
/// operators whose encodes complete within ~100 ms of each other share one
/// playback), summed sample-wise with soft clipping, and emitted as one
/// `MixedAudio`. A contribution arriving while a composition is already on
/// air triggers a remix: the playing composition loses its already-played
/// head and is re-summed with the newcomers.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

pub const DEFAULT_MIX_WINDOW_MS: u64 = 100;

// ── Data ─────────────────────────────────────────────────────────────────────

/// One operator's encoded audio queued for mixing.
#[derive(Debug, Clone)]
pub struct AudioContribution {
    pub operator_id: String,
    pub pcm: Vec<f32>,
    pub sample_rate: u32,
    /// Start of the slot this transmission belongs to.
    pub slot_start_ms: i64,
    /// Wall time this contribution wants its first sample played.
    pub playback_start_ms: i64,
    /// Nominal transmit instant the composition is aligned to.
    pub target_playback_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedAudio {
    pub operator_ids: Vec<String>,
    #[serde(skip)]
    pub pcm: Vec<f32>,
    pub sample_rate: u32,
    pub duration_sec: f64,
    pub slot_start_ms: i64,
    pub target_playback_ms: i64,
}

// ── Mixer ────────────────────────────────────────────────────────────────────

struct MixerState {
    pending: Vec<AudioContribution>,
    window_task: Option<JoinHandle<()>>,
    /// Composition currently on air, if any.
    playing: Option<MixedAudio>,
}

pub struct AudioMixer {
    window_ms: u64,
    state: Mutex<MixerState>,
    tx: UnboundedSender<MixedAudio>,
}

impl AudioMixer {
    pub fn new(window_ms: u64, tx: UnboundedSender<MixedAudio>) -> Arc<Self> {
        Arc::new(Self {
            window_ms,
            state: Mutex::new(MixerState {
                pending: Vec::new(),
                window_task: None,
                playing: None,
            }),
            tx,
        })
    }

    /// Queue a contribution. The first addition opens the mix window; the
    /// window close mixes whatever accumulated and emits it.
    pub fn add_audio(self: &Arc<Self>, contribution: AudioContribution) {
        let mut state = self.state.lock().unwrap();
        log::debug!(
            "mixer: +{} samples from {} (target {})",
            contribution.pcm.len(),
            contribution.operator_id,
            contribution.target_playback_ms
        );
        state.pending.push(contribution);
        if state.window_task.is_none() {
            let mixer = Arc::clone(self);
            let window = self.window_ms;
            state.window_task = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(window)).await;
                mixer.flush();
            }));
        }
    }

    /// Drop any queued audio for one operator (stale content superseded by a
    /// newer encode).
    pub fn clear_operator_audio(&self, operator_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|c| c.operator_id != operator_id);
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().unwrap().pending.is_empty()
    }

    /// Record that `mixed` went on air; remixes build on it.
    pub fn note_playing(&self, mixed: &MixedAudio) {
        self.state.lock().unwrap().playing = Some(mixed.clone());
    }

    pub fn note_stopped(&self) {
        self.state.lock().unwrap().playing = None;
    }

    /// Mid-stream recomposition: truncate the playing composition by the
    /// audio already played, merge all pending contributions, and hand back
    /// a clip to be played from offset zero. The caller must already have
    /// stopped playback. Returns None when there is nothing to play.
    pub fn remix_with_new_audio(&self, elapsed_ms: i64) -> Option<MixedAudio> {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.window_task.take() {
            task.abort();
        }
        let pending: Vec<AudioContribution> = state.pending.drain(..).collect();
        let playing = state.playing.take();

        let mut contributions: Vec<AudioContribution> = Vec::new();
        let mut carried_ids: Vec<String> = Vec::new();
        if let Some(current) = playing {
            let skip = (elapsed_ms.max(0) as u64 * current.sample_rate as u64 / 1000) as usize;
            if skip < current.pcm.len() {
                carried_ids = current.operator_ids.clone();
                contributions.push(AudioContribution {
                    operator_id: carried_ids.first().cloned().unwrap_or_default(),
                    pcm: current.pcm[skip..].to_vec(),
                    sample_rate: current.sample_rate,
                    slot_start_ms: current.slot_start_ms,
                    playback_start_ms: 0,
                    target_playback_ms: current.target_playback_ms,
                });
            }
        }
        // Remix target comes from the first pending contribution when one
        // exists; otherwise the truncated remainder keeps its own.
        let target = pending
            .first()
            .map(|c| c.target_playback_ms)
            .or_else(|| contributions.first().map(|c| c.target_playback_ms))?;
        for mut c in pending {
            // A remix plays from offset zero: everything aligns at its start.
            c.playback_start_ms = 0;
            contributions.push(c);
        }
        if contributions.is_empty() {
            return None;
        }
        let mut mixed = mix_contributions(&contributions);
        mixed.target_playback_ms = target;
        for id in carried_ids {
            if !mixed.operator_ids.contains(&id) {
                mixed.operator_ids.push(id);
            }
        }
        state.playing = Some(mixed.clone());
        Some(mixed)
    }

    /// Close the mix window: mix pending contributions and emit.
    pub fn flush(&self) {
        let contributions: Vec<AudioContribution> = {
            let mut state = self.state.lock().unwrap();
            state.window_task = None;
            state.pending.drain(..).collect()
        };
        if contributions.is_empty() {
            return;
        }
        let mixed = mix_contributions(&contributions);
        log::debug!(
            "mixer: emitting {:.2} s for {:?}",
            mixed.duration_sec,
            mixed.operator_ids
        );
        let _ = self.tx.send(mixed);
    }

    /// Drop everything, including the on-air note (engine stop).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = state.window_task.take() {
            task.abort();
        }
        state.pending.clear();
        state.playing = None;
    }
}

// ── Mixing ───────────────────────────────────────────────────────────────────

/// Sum contributions aligned on their playback starts. The earliest start is
/// offset zero; later starters are placed at their relative sample offset.
/// Result length is the furthest-reaching contribution.
pub fn mix_contributions(contributions: &[AudioContribution]) -> MixedAudio {
    debug_assert!(!contributions.is_empty());
    let sample_rate = contributions[0].sample_rate;
    let base = contributions
        .iter()
        .map(|c| c.playback_start_ms)
        .min()
        .unwrap_or(0);

    let mut total_len = 0usize;
    let offsets: Vec<usize> = contributions
        .iter()
        .map(|c| {
            let off =
                ((c.playback_start_ms - base).max(0) as u64 * sample_rate as u64 / 1000) as usize;
            total_len = total_len.max(off + c.pcm.len());
            off
        })
        .collect();

    let mut pcm = vec![0.0f32; total_len];
    for (c, &off) in contributions.iter().zip(&offsets) {
        for (i, &s) in c.pcm.iter().enumerate() {
            pcm[off + i] += s;
        }
    }
    for s in pcm.iter_mut() {
        *s = soft_clip(*s);
    }

    let mut operator_ids: Vec<String> = Vec::new();
    for c in contributions {
        if !operator_ids.contains(&c.operator_id) {
            operator_ids.push(c.operator_id.clone());
        }
    }
    let duration_sec = pcm.len() as f64 / sample_rate as f64;
    let target_playback_ms = contributions
        .iter()
        .map(|c| c.target_playback_ms)
        .min()
        .unwrap_or(base);
    let slot_start_ms = contributions
        .iter()
        .map(|c| c.slot_start_ms)
        .min()
        .unwrap_or(base);

    MixedAudio {
        operator_ids,
        pcm,
        sample_rate,
        duration_sec,
        slot_start_ms,
        target_playback_ms,
    }
}

/// Merge two compositions that share a transmit instant (or nearly so):
/// sample-wise sum aligned on the earlier target, union of operators.
pub fn merge_mixed(a: &MixedAudio, b: &MixedAudio) -> MixedAudio {
    debug_assert_eq!(a.sample_rate, b.sample_rate);
    let rate = a.sample_rate;
    let base = a.target_playback_ms.min(b.target_playback_ms);
    let off_a = ((a.target_playback_ms - base).max(0) as u64 * rate as u64 / 1000) as usize;
    let off_b = ((b.target_playback_ms - base).max(0) as u64 * rate as u64 / 1000) as usize;

    let total = (off_a + a.pcm.len()).max(off_b + b.pcm.len());
    let mut pcm = vec![0.0f32; total];
    for (i, &s) in a.pcm.iter().enumerate() {
        pcm[off_a + i] += s;
    }
    for (i, &s) in b.pcm.iter().enumerate() {
        pcm[off_b + i] += s;
    }
    for s in pcm.iter_mut() {
        *s = soft_clip(*s);
    }

    let mut operator_ids = a.operator_ids.clone();
    for id in &b.operator_ids {
        if !operator_ids.contains(id) {
            operator_ids.push(id.clone());
        }
    }
    let duration_sec = pcm.len() as f64 / rate as f64;
    MixedAudio {
        operator_ids,
        pcm,
        sample_rate: rate,
        duration_sec,
        slot_start_ms: a.slot_start_ms.min(b.slot_start_ms),
        target_playback_ms: base,
    }
}

/// Continuous soft clip into [-1, 1]: unity below the knee, asymptotic above.
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    const KNEE: f32 = 0.95;
    let mag = x.abs();
    if mag <= KNEE {
        x
    } else {
        let over = mag - KNEE;
        x.signum() * (KNEE + (1.0 - KNEE) * (over / (over + (1.0 - KNEE))))
    }
}
