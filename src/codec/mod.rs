/// `codec/` — native FT8/FT4 modem seam
///
/// The modem itself is external; the engine talks to it through
/// `DigiModeCodec` and confines every call to the queue worker threads so a
/// single non-reentrant native library is safe. Decode input is 12 kHz i16,
/// encode output is 48 kHz f32.
pub mod decode_queue;
pub mod encode_queue;

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::mode::ModeDescriptor;

pub use decode_queue::{DecodeOutcome, DecodeQueue, DecodeRequest, DecodeResult};
pub use encode_queue::{EncodeOutcome, EncodeQueue, EncodeRequest, EncodeResult};

/// One raw frame from the native decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDecode {
    pub text: String,
    pub snr_db: f32,
    /// Seconds relative to the start of the supplied PCM.
    pub delta_time_s: f32,
    /// Hz relative to `base_freq_hz`.
    pub delta_freq_hz: f32,
    /// Decoder quality 0..=1; decoders without a metric report 1.0.
    pub confidence: f32,
}

/// The native modem contract.
///
/// Implementations must be callable from a dedicated worker thread; the
/// engine never calls them concurrently with themselves beyond the queue's
/// configured concurrency.
pub trait DigiModeCodec: Send + Sync {
    fn decode(
        &self,
        mode: &ModeDescriptor,
        pcm_12k: &[i16],
        base_freq_hz: f32,
    ) -> std::result::Result<Vec<RawDecode>, String>;

    /// Returns f32 PCM at 48 kHz.
    fn encode(
        &self,
        mode: &ModeDescriptor,
        message: &str,
        audio_freq_hz: f32,
    ) -> std::result::Result<Vec<f32>, String>;
}

// ── Test codec ───────────────────────────────────────────────────────────────

/// Deterministic codec for tests: decode results are scripted, encode
/// produces a sine of the mode's nominal duration at the requested
/// frequency.
#[derive(Default)]
pub struct ScriptedCodec {
    decodes: Mutex<VecDeque<std::result::Result<Vec<RawDecode>, String>>>,
    fail_encode: Mutex<Option<String>>,
    encode_duration_override_ms: Mutex<Option<u64>>,
}

impl ScriptedCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_decode(&self, frames: Vec<RawDecode>) {
        self.decodes.lock().unwrap().push_back(Ok(frames));
    }

    pub fn script_decode_error(&self, message: &str) {
        self.decodes.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn fail_next_encode(&self, message: &str) {
        *self.fail_encode.lock().unwrap() = Some(message.to_string());
    }

    /// Shrink encoded clips so timing tests run in milliseconds, not the
    /// mode's real on-air duration.
    pub fn set_encode_duration_ms(&self, ms: u64) {
        *self.encode_duration_override_ms.lock().unwrap() = Some(ms);
    }
}

impl DigiModeCodec for ScriptedCodec {
    fn decode(
        &self,
        _mode: &ModeDescriptor,
        _pcm_12k: &[i16],
        _base_freq_hz: f32,
    ) -> std::result::Result<Vec<RawDecode>, String> {
        self.decodes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn encode(
        &self,
        mode: &ModeDescriptor,
        _message: &str,
        audio_freq_hz: f32,
    ) -> std::result::Result<Vec<f32>, String> {
        if let Some(err) = self.fail_encode.lock().unwrap().take() {
            return Err(err);
        }
        let rate = 48_000u32;
        let n = match *self.encode_duration_override_ms.lock().unwrap() {
            Some(ms) => (ms * rate as u64 / 1_000) as usize,
            None => (mode.signal_duration_sec * rate as f64) as usize,
        };
        let w = 2.0 * std::f32::consts::PI * audio_freq_hz / rate as f32;
        Ok((0..n).map(|i| (w * i as f32).sin() * 0.5).collect())
    }
}

/// f32 [-1, 1] to i16 full scale, saturating.
pub(crate) fn f32_to_i16(pcm: &[f32]) -> Vec<i16> {
    pcm.iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::FT8;

    #[test]
    fn scripted_codec_replays_decodes_in_order() {
        let codec = ScriptedCodec::new();
        codec.script_decode(vec![RawDecode {
            text: "CQ AA1AA FN42".into(),
            snr_db: -10.0,
            delta_time_s: 0.2,
            delta_freq_hz: 1500.0,
            confidence: 0.9,
        }]);
        let first = codec.decode(&FT8, &[], 0.0).unwrap();
        assert_eq!(first.len(), 1);
        let second = codec.decode(&FT8, &[], 0.0).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn scripted_encode_matches_mode_duration() {
        let codec = ScriptedCodec::new();
        let pcm = codec.encode(&FT8, "CQ AA1AA FN42", 1500.0).unwrap();
        assert_eq!(pcm.len(), (12.64f64 * 48_000.0) as usize);
        assert!(pcm.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn i16_conversion_saturates() {
        let out = f32_to_i16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(out, vec![0, 32_767, -32_767, 32_767]);
    }
}
