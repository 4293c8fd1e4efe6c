/// `output.rs` — transmit audio playback
///
/// Mixed compositions are written to the output device in
/// `frames_per_buffer` chunks with wall-clock pacing: the device is never
/// fed more than ~`prebuffer_ms` ahead of real time, so a stop request
/// takes effect within one chunk and the reported elapsed time tracks what
/// actually left the speaker. At most one playback is active at a time.
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer as _, Producer as _, Split},
    HeapRb,
};

use crate::audio::resampler::resample_linear;
use crate::clock::ClockSource;
use crate::error::{EngineError, Result};

pub const DEFAULT_FRAMES_PER_BUFFER: usize = 768;
pub const DEFAULT_PREBUFFER_MS: i64 = 100;

const MIN_GAIN_DB: f32 = -60.0;
const MAX_GAIN_DB: f32 = 20.0;

// ── Sink seam ────────────────────────────────────────────────────────────────

/// Where paced playback chunks go. Production uses a cpal-backed sink; tests
/// use `NullSink`.
pub trait PlaybackSink: Send {
    /// Offer samples; returns how many were accepted (0 = device full).
    fn write(&mut self, chunk: &[f32]) -> Result<usize>;
    fn sample_rate(&self) -> u32;
}

/// Sink feeding a cpal output stream through an SPSC ring.
pub struct CpalSink {
    _stream: cpal::Stream,
    producer: ringbuf::HeapProd<f32>,
    sample_rate: u32,
}

// SAFETY: cpal::Stream is !Send on some platforms. The sink lives behind the
// AudioOutput mutex and is only touched from the playback task; the stream
// itself is driven by cpal's own callback thread.
unsafe impl Send for CpalSink {}

impl CpalSink {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| EngineError::AudioDevice(e.to_string()))?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| EngineError::DeviceNotFound(name.to_string()))?,
            None => host
                .default_output_device()
                .ok_or_else(|| EngineError::DeviceNotFound("default output".into()))?,
        };
        let config = device
            .default_output_config()
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        // 2 s of mono headroom on the device side.
        let rb = HeapRb::<f32>::new(sample_rate as usize * 2);
        let (producer, mut consumer) = rb.split();

        let stream = device
            .build_output_stream(
                &config.into(),
                move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    // Mono engine feed fanned out to every device channel;
                    // silence when the engine has nothing queued.
                    for frame in output.chunks_mut(channels) {
                        let s = consumer.try_pop().unwrap_or(0.0);
                        for slot in frame.iter_mut() {
                            *slot = s;
                        }
                    }
                },
                |e| log::error!("output stream error: {e}"),
                None,
            )
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;
        stream
            .play()
            .map_err(|e| EngineError::AudioDevice(e.to_string()))?;

        log::info!("Audio output started: {} Hz", sample_rate);
        Ok(Self {
            _stream: stream,
            producer,
            sample_rate,
        })
    }
}

impl PlaybackSink for CpalSink {
    fn write(&mut self, chunk: &[f32]) -> Result<usize> {
        Ok(self.producer.push_slice(chunk))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Test sink: accepts everything and remembers it.
#[derive(Default)]
pub struct NullSink {
    pub written: Vec<f32>,
    sample_rate: u32,
}

impl NullSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            written: Vec::new(),
            sample_rate,
        }
    }
}

impl PlaybackSink for NullSink {
    fn write(&mut self, chunk: &[f32]) -> Result<usize> {
        self.written.extend_from_slice(chunk);
        Ok(chunk.len())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

// ── AudioOutput ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Completed,
    Stopped { elapsed_ms: i64 },
}

struct PlaybackShared {
    active: AtomicBool,
    stop: AtomicBool,
    played_ms: AtomicI64,
}

pub struct AudioOutput {
    clock: Arc<dyn ClockSource>,
    /// Installed by the audio-output resource on start, removed on stop.
    sink: Mutex<Option<Box<dyn PlaybackSink>>>,
    frames_per_buffer: usize,
    prebuffer_ms: i64,
    gain: Mutex<f32>,
    shared: Arc<PlaybackShared>,
    /// When set, every played composition is archived as a WAV here.
    wav_dump_dir: Option<PathBuf>,
}

impl AudioOutput {
    pub fn new(clock: Arc<dyn ClockSource>, sink: Box<dyn PlaybackSink>) -> Self {
        let out = Self::unbound(clock);
        out.set_sink(sink);
        out
    }

    /// An output with no device attached yet; `play_audio` fails until a
    /// sink is installed.
    pub fn unbound(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            sink: Mutex::new(None),
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            prebuffer_ms: DEFAULT_PREBUFFER_MS,
            gain: Mutex::new(1.0),
            shared: Arc::new(PlaybackShared {
                active: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                played_ms: AtomicI64::new(0),
            }),
            wav_dump_dir: None,
        }
    }

    pub fn set_sink(&self, sink: Box<dyn PlaybackSink>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    pub fn clear_sink(&self) {
        *self.sink.lock().unwrap() = None;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn with_wav_dump(mut self, dir: Option<PathBuf>) -> Self {
        self.wav_dump_dir = dir;
        self
    }

    pub fn with_frames_per_buffer(mut self, frames: usize) -> Self {
        self.frames_per_buffer = frames.max(64);
        self
    }

    pub fn is_playing(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    // ── Volume ────────────────────────────────────────────────────────────

    pub fn set_volume_gain(&self, linear: f32) {
        let db = if linear <= 0.0 {
            MIN_GAIN_DB
        } else {
            (20.0 * linear.log10()).clamp(MIN_GAIN_DB, MAX_GAIN_DB)
        };
        *self.gain.lock().unwrap() = 10.0f32.powf(db / 20.0);
    }

    pub fn set_volume_gain_db(&self, db: f32) {
        let db = db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        *self.gain.lock().unwrap() = 10.0f32.powf(db / 20.0);
    }

    pub fn volume_gain(&self) -> f32 {
        *self.gain.lock().unwrap()
    }

    pub fn volume_gain_db(&self) -> f32 {
        20.0 * self.volume_gain().log10()
    }

    // ── Playback ──────────────────────────────────────────────────────────

    /// Play a clip to completion (or until stopped). Resolves once every
    /// chunk has been handed to the device and its duration has elapsed.
    pub async fn play_audio(&self, pcm: &[f32], sample_rate: u32) -> Result<PlaybackStatus> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AudioDevice(
                "playback already active".to_string(),
            ));
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.played_ms.store(0, Ordering::SeqCst);

        let result = self.run_playback(pcm, sample_rate).await;
        self.shared.active.store(false, Ordering::SeqCst);
        result
    }

    async fn run_playback(&self, pcm: &[f32], sample_rate: u32) -> Result<PlaybackStatus> {
        let device_rate = self
            .sink
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.sample_rate())
            .ok_or_else(|| EngineError::AudioDevice("no output sink installed".to_string()))?;
        let gain = self.volume_gain();
        let mut samples = if sample_rate != device_rate {
            resample_linear(pcm, sample_rate, device_rate)
        } else {
            pcm.to_vec()
        };
        if (gain - 1.0).abs() > 1e-6 {
            for s in samples.iter_mut() {
                *s *= gain;
            }
        }
        if let Some(dir) = &self.wav_dump_dir {
            dump_wav(dir.clone(), samples.clone(), device_rate);
        }

        let total_ms = samples.len() as i64 * 1000 / device_rate as i64;
        let started = self.clock.now();
        let mut written: usize = 0;

        while written < samples.len() {
            if self.shared.stop.load(Ordering::SeqCst) {
                let elapsed = self.elapsed_since(started, total_ms);
                self.shared.played_ms.store(elapsed, Ordering::SeqCst);
                return Ok(PlaybackStatus::Stopped { elapsed_ms: elapsed });
            }
            let end = (written + self.frames_per_buffer).min(samples.len());
            let chunk = &samples[written..end];

            // Back-pressure: keep offering until the device takes the chunk.
            let mut offered = 0;
            let mut waited = Duration::ZERO;
            while offered < chunk.len() {
                let n = {
                    let mut sink = self.sink.lock().unwrap();
                    let sink = sink.as_mut().ok_or_else(|| {
                        EngineError::AudioDevice("output sink removed mid-playback".to_string())
                    })?;
                    sink.write(&chunk[offered..])?
                };
                offered += n;
                if offered < chunk.len() {
                    if self.shared.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if waited > Duration::from_millis(2_000) {
                        return Err(EngineError::AudioDevice(
                            "output stalled: device not draining".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    waited += Duration::from_millis(2);
                }
            }
            written += offered;
            if offered < chunk.len() {
                continue; // stop flag hit mid-chunk; loop re-checks it
            }

            // Pacing: stay no more than prebuffer_ms ahead of the wall clock.
            let written_ms = written as i64 * 1000 / device_rate as i64;
            let wall = self.clock.now() - started;
            let ahead = written_ms - wall;
            if ahead > self.prebuffer_ms {
                tokio::time::sleep(Duration::from_millis((ahead - self.prebuffer_ms) as u64))
                    .await;
            }
        }

        // All chunks handed off; wait out the tail so resolution means
        // "audio finished", still honouring stop.
        loop {
            let wall = self.clock.now() - started;
            if wall >= total_ms {
                break;
            }
            if self.shared.stop.load(Ordering::SeqCst) {
                let elapsed = self.elapsed_since(started, total_ms);
                self.shared.played_ms.store(elapsed, Ordering::SeqCst);
                return Ok(PlaybackStatus::Stopped { elapsed_ms: elapsed });
            }
            tokio::time::sleep(Duration::from_millis((total_ms - wall).clamp(1, 10) as u64)).await;
        }

        self.shared.played_ms.store(total_ms, Ordering::SeqCst);
        Ok(PlaybackStatus::Completed)
    }

    fn elapsed_since(&self, started: i64, total_ms: i64) -> i64 {
        (self.clock.now() - started).clamp(0, total_ms)
    }

    /// Request the active playback to abort at the next chunk boundary and
    /// wait for it; returns the ms actually played (0 when idle).
    pub async fn stop_current_playback(&self) -> i64 {
        if !self.shared.active.load(Ordering::SeqCst) {
            return 0;
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        let deadline = Duration::from_millis(1_000);
        let start = std::time::Instant::now();
        while self.shared.active.load(Ordering::SeqCst) {
            if start.elapsed() > deadline {
                log::warn!("stop_current_playback timed out waiting for the playback task");
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        self.shared.played_ms.load(Ordering::SeqCst)
    }
}

// ── WAV archival ─────────────────────────────────────────────────────────────

/// Best-effort diagnostic dump; failures are logged, never surfaced.
fn dump_wav(dir: PathBuf, samples: Vec<f32>, sample_rate: u32) {
    tokio::task::spawn_blocking(move || {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let path = dir.join(format!("tx-{stamp}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let write = || -> std::result::Result<(), hound::Error> {
            let mut writer = hound::WavWriter::create(&path, spec)?;
            for s in &samples {
                writer.write_sample(*s)?;
            }
            writer.finalize()
        };
        if let Err(e) = write() {
            log::warn!("tx WAV dump failed: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn output() -> AudioOutput {
        AudioOutput::new(Arc::new(SystemClock), Box::new(NullSink::new(48_000)))
            .with_frames_per_buffer(256)
    }

    #[tokio::test]
    async fn short_clip_plays_to_completion() {
        let out = output();
        // 50 ms of audio.
        let pcm = vec![0.1f32; 2_400];
        let status = out.play_audio(&pcm, 48_000).await.unwrap();
        assert_eq!(status, PlaybackStatus::Completed);
        assert!(!out.is_playing());
    }

    #[tokio::test]
    async fn stop_reports_elapsed_and_aborts() {
        let out = Arc::new(output());
        let pcm = vec![0.1f32; 48_000]; // 1 s
        let player = Arc::clone(&out);
        let task = tokio::spawn(async move { player.play_audio(&pcm, 48_000).await });

        tokio::time::sleep(Duration::from_millis(120)).await;
        let elapsed = out.stop_current_playback().await;
        assert!(elapsed > 0, "elapsed {elapsed}");
        assert!(elapsed < 1_000);
        match task.await.unwrap().unwrap() {
            PlaybackStatus::Stopped { elapsed_ms } => assert_eq!(elapsed_ms, elapsed),
            other => panic!("expected Stopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_when_idle_is_zero() {
        let out = output();
        assert_eq!(out.stop_current_playback().await, 0);
    }

    #[tokio::test]
    async fn second_playback_while_active_is_rejected() {
        let out = Arc::new(output());
        let pcm = vec![0.0f32; 48_000];
        let player = Arc::clone(&out);
        let task = tokio::spawn(async move { player.play_audio(&pcm, 48_000).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(out.play_audio(&[0.0; 10], 48_000).await.is_err());
        out.stop_current_playback().await;
        let _ = task.await;
    }

    #[test]
    fn gain_clamps_to_db_range() {
        let out = output();
        out.set_volume_gain_db(-100.0);
        assert!((out.volume_gain_db() - (-60.0)).abs() < 0.01);
        out.set_volume_gain_db(40.0);
        assert!((out.volume_gain_db() - 20.0).abs() < 0.01);
        out.set_volume_gain(1.0);
        assert!((out.volume_gain() - 1.0).abs() < 1e-6);
    }

    /// Sink sharing its capture buffer with the test.
    struct SharingSink(Arc<Mutex<NullSink>>);

    impl PlaybackSink for SharingSink {
        fn write(&mut self, chunk: &[f32]) -> Result<usize> {
            self.0.lock().unwrap().write(chunk)
        }
        fn sample_rate(&self) -> u32 {
            self.0.lock().unwrap().sample_rate()
        }
    }

    #[tokio::test]
    async fn gain_scales_written_samples() {
        let captured = Arc::new(Mutex::new(NullSink::new(48_000)));
        let out = AudioOutput::new(
            Arc::new(SystemClock),
            Box::new(SharingSink(Arc::clone(&captured))),
        );
        out.set_volume_gain(0.5);
        let pcm = vec![0.5f32; 480]; // 10 ms
        out.play_audio(&pcm, 48_000).await.unwrap();
        let sink = captured.lock().unwrap();
        assert_eq!(sink.written.len(), 480);
        assert!((sink.written[0] - 0.25).abs() < 1e-3);
    }
}
