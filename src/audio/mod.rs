pub mod input;
pub mod mixer;
pub mod output;
pub mod resampler;
pub mod ring_buffer;

pub use input::AudioInput;
pub use mixer::{AudioContribution, AudioMixer, MixedAudio, DEFAULT_MIX_WINDOW_MS};
pub use output::{AudioOutput, CpalSink, NullSink, PlaybackSink, PlaybackStatus};
pub use ring_buffer::{AudioRingBuffer, DECODE_SAMPLE_RATE};

/// Platform playback/encode rate.
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;
