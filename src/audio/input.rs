/// `input.rs` — audio capture into the decode ring
///
/// The cpal input callback folds frames to mono and drops them into an
/// SPSC ring; a pump thread drains it, sanitises, resamples the device
/// rate down to the 12 kHz decode rate, and stamps the result into the
/// timestamped ring buffer the slot scheduler reads. The capture callback
/// itself never resamples, never allocates, and never blocks.
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer as _, Producer as _, Split},
    HeapRb,
};

use crate::audio::resampler::resample_linear;
use crate::audio::ring_buffer::{AudioRingBuffer, DECODE_SAMPLE_RATE};
use crate::clock::ClockSource;
use crate::error::{EngineError, Result};

/// Replace NaN/Inf with silence and clamp into [-1, 1], in place.
pub(crate) fn sanitize(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        if !s.is_finite() {
            *s = 0.0;
        } else {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

pub struct AudioInput {
    device_name: Option<String>,
    clock: Arc<dyn ClockSource>,
    ring: Arc<AudioRingBuffer>,
    stream: Mutex<Option<cpal::Stream>>,
    pump_stop: Arc<AtomicBool>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
    /// Smoothed capture peak, f32 bits (for level metering).
    level_bits: Arc<AtomicU32>,
}

// SAFETY: cpal::Stream is !Send on some platforms; all access is gated
// behind the Mutex and confined to start/stop callers.
unsafe impl Send for AudioInput {}
unsafe impl Sync for AudioInput {}

impl AudioInput {
    pub fn new(
        device_name: Option<String>,
        clock: Arc<dyn ClockSource>,
        ring: Arc<AudioRingBuffer>,
    ) -> Self {
        Self {
            device_name,
            clock,
            ring,
            stream: Mutex::new(None),
            pump_stop: Arc::new(AtomicBool::new(false)),
            pump_handle: Mutex::new(None),
            level_bits: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn start(&self) -> Result<()> {
        let host = cpal::default_host();
        let device = match &self.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| EngineError::AudioDevice(e.to_string()))?
                .find(|d| d.name().ok().as_deref() == Some(name.as_str()))
                .ok_or_else(|| EngineError::DeviceNotFound(name.clone()))?,
            None => host
                .default_input_device()
                .ok_or_else(|| EngineError::DeviceNotFound("default input".into()))?,
        };
        let supported = device
            .default_input_config()
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        let device_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;

        // 2 s of raw headroom between the callback and the pump.
        let rb = HeapRb::<f32>::new(device_rate as usize * 2);
        let (mut producer, consumer) = rb.split();
        let level_bits = Arc::clone(&self.level_bits);

        let stream = device
            .build_input_stream(
                &supported.config(),
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mut peak = 0.0f32;
                    // Mono fold: average the frame's channels. Sanitising
                    // waits for the pump thread; the callback only moves
                    // samples.
                    for frame in data.chunks(channels) {
                        let s: f32 = frame.iter().sum::<f32>() / channels as f32;
                        peak = peak.max(s.abs());
                        let _ = producer.try_push(s);
                    }
                    let prev = f32::from_bits(level_bits.load(Ordering::Relaxed));
                    let next = prev * 0.9 + peak * 0.1;
                    level_bits.store(next.to_bits(), Ordering::Relaxed);
                },
                |e| log::error!("input stream error: {e}"),
                None,
            )
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        stream
            .play()
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        *self.stream.lock().unwrap() = Some(stream);

        self.spawn_pump(consumer, device_rate)?;
        log::info!("Audio capture started: {device_rate} Hz, {channels} ch");
        Ok(())
    }

    fn spawn_pump(&self, mut consumer: ringbuf::HeapCons<f32>, device_rate: u32) -> Result<()> {
        self.pump_stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.pump_stop);
        let ring = Arc::clone(&self.ring);
        let clock = Arc::clone(&self.clock);
        let handle = thread::Builder::new()
            .name("capture-pump".to_string())
            .spawn(move || {
                let mut raw: Vec<f32> = Vec::with_capacity(device_rate as usize / 10);
                while !stop.load(Ordering::SeqCst) {
                    raw.clear();
                    while let Some(s) = consumer.try_pop() {
                        raw.push(s);
                        if raw.len() >= device_rate as usize {
                            break;
                        }
                    }
                    if !raw.is_empty() {
                        pump_chunk(&mut raw, device_rate, &*ring, clock.now());
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            })
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        *self.pump_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        *self.stream.lock().unwrap() = None;
        self.pump_stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.pump_handle.lock().unwrap().take() {
            let _ = h.join();
        }
        log::info!("Audio capture stopped");
    }

    /// Smoothed capture peak in [0, 1].
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    pub fn ring(&self) -> &Arc<AudioRingBuffer> {
        &self.ring
    }
}

/// Sanitise and resample one raw chunk to the decode rate, then stamp it
/// into the ring. The chunk's capture time is `now` minus its own duration.
fn pump_chunk(raw: &mut [f32], device_rate: u32, ring: &AudioRingBuffer, now_ms: i64) {
    sanitize(raw);
    let decoded = resample_linear(raw, device_rate, DECODE_SAMPLE_RATE);
    let chunk_ms = raw.len() as i64 * 1000 / device_rate as i64;
    ring.write(&decoded, now_ms - chunk_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_scrubs_nan_inf_and_clamps() {
        let mut buf = vec![0.5, f32::NAN, f32::INFINITY, -3.0, 0.9, f32::NEG_INFINITY];
        sanitize(&mut buf);
        assert_eq!(buf, vec![0.5, 0.0, 0.0, -1.0, 0.9, 0.0]);
    }

    #[test]
    fn pump_chunk_lands_at_decode_rate() {
        let ring = AudioRingBuffer::with_seconds(4);
        let mut raw = vec![0.25f32; 4_800]; // 100 ms @ 48 kHz
        pump_chunk(&mut raw, 48_000, &ring, 1_700_000_000_100);
        // 100 ms at 12 kHz = 1200 samples, stamped 100 ms before `now`.
        let out = ring.read(1_700_000_000_000, 100);
        assert_eq!(out.len(), 1_200);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn successive_chunks_are_contiguous() {
        let ring = AudioRingBuffer::with_seconds(4);
        let t0 = 1_700_000_000_000;
        pump_chunk(&mut vec![0.1f32; 4_800], 48_000, &ring, t0 + 100);
        pump_chunk(&mut vec![0.2f32; 4_800], 48_000, &ring, t0 + 200);
        let out = ring.read(t0, 200);
        assert_eq!(out.len(), 2_400);
        assert!((out[0] - 0.1).abs() < 1e-3);
        assert!((out[1_200] - 0.2).abs() < 1e-3);
    }
}
