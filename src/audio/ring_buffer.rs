/// `ring_buffer.rs` — timestamped capture ring at the decode rate
///
/// Fixed-capacity ring of mono f32 samples with an origin timestamp, so
/// readers can ask for an absolute time window and get exactly the samples
/// that cover it. One writer (the capture pump), many readers (slot
/// scheduler, spectrum). Reads copy under a short critical section; the
/// writer never allocates after construction and never blocks on a reader
/// beyond that bounded copy.
use std::sync::Mutex;

/// Internal processing rate used for decoding.
pub const DECODE_SAMPLE_RATE: u32 = 12_000;

struct Inner {
    samples: Vec<f32>,
    /// Timestamp of the very first sample ever written; sample index i maps
    /// to `origin_ms + i * 1000 / rate`.
    origin_ms: Option<i64>,
    /// Samples ever written (monotonic).
    total_written: u64,
    overflow_count: u64,
}

pub struct AudioRingBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    sample_rate: u32,
}

impl AudioRingBuffer {
    pub fn new(capacity_samples: usize, sample_rate: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: vec![0.0; capacity_samples],
                origin_ms: None,
                total_written: 0,
                overflow_count: 0,
            }),
            capacity: capacity_samples,
            sample_rate,
        }
    }

    /// Ring sized to hold `seconds` of audio at the decode rate.
    pub fn with_seconds(seconds: u32) -> Self {
        Self::new((DECODE_SAMPLE_RATE * seconds) as usize, DECODE_SAMPLE_RATE)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append captured samples. The timestamp anchors the ring's timeline on
    /// the first write; afterwards samples are assumed contiguous and the
    /// stamp is only checked for drift logging.
    pub fn write(&self, samples: &[f32], capture_timestamp_ms: i64) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.origin_ms {
            None => inner.origin_ms = Some(capture_timestamp_ms),
            Some(origin) => {
                let expected =
                    origin + (inner.total_written as i64) * 1000 / self.sample_rate as i64;
                let drift = capture_timestamp_ms - expected;
                if drift.abs() > 500 {
                    log::debug!("capture timestamp drift {drift} ms vs ring timeline");
                }
            }
        }

        // Oversized writes keep only the newest `capacity` samples; the rest
        // count as dropped exactly like an overflow.
        let keep = samples.len().min(self.capacity);
        let skipped = samples.len() - keep;
        if skipped > 0 {
            inner.overflow_count += skipped as u64;
        }
        // Samples that will be overwritten in the ring were the oldest
        // retained; one batch drop, counted.
        let retained = (inner.total_written as usize).min(self.capacity);
        let free = self.capacity - retained;
        if keep > free {
            inner.overflow_count += (keep - free) as u64;
        }

        let mut write_pos = (inner.total_written as usize + skipped) % self.capacity;
        for &s in &samples[skipped..] {
            inner.samples[write_pos] = s;
            write_pos = (write_pos + 1) % self.capacity;
        }
        inner.total_written += samples.len() as u64;
    }

    /// Read exactly `duration_ms * rate / 1000` samples covering
    /// `[start_ms, start_ms + duration_ms)`. Missing history (overwritten or
    /// before the origin) and the still-unwritten tail come back as silence.
    pub fn read(&self, start_ms: i64, duration_ms: i64) -> Vec<f32> {
        let n = (duration_ms.max(0) * self.sample_rate as i64 / 1000) as usize;
        let inner = self.inner.lock().unwrap();
        let mut out = vec![0.0f32; n];
        let origin = match inner.origin_ms {
            Some(o) => o,
            None => return out,
        };

        let first_index = (start_ms - origin) * self.sample_rate as i64 / 1000;
        let earliest = inner.total_written.saturating_sub(self.capacity as u64) as i64;
        let latest = inner.total_written as i64;
        for (k, slot) in out.iter_mut().enumerate() {
            let idx = first_index + k as i64;
            if idx >= earliest.max(0) && idx < latest {
                *slot = inner.samples[(idx as usize) % self.capacity];
            }
        }
        out
    }

    /// Cumulative read from a slot boundary, used by the slot scheduler.
    pub fn read_from_slot_start(&self, slot_start_ms: i64, accumulated_ms: i64) -> Vec<f32> {
        self.read(slot_start_ms, accumulated_ms)
    }

    pub fn overflow_count(&self) -> u64 {
        self.inner.lock().unwrap().overflow_count
    }

    pub fn total_written(&self) -> u64 {
        self.inner.lock().unwrap().total_written
    }

    /// Timestamp of the oldest retained sample, if any samples were written.
    pub fn earliest_retained_ms(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        let origin = inner.origin_ms?;
        let earliest = inner.total_written.saturating_sub(self.capacity as u64);
        Some(origin + earliest as i64 * 1000 / self.sample_rate as i64)
    }

    /// Drop all samples and the origin anchor (used on engine restart).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.origin_ms = None;
        inner.total_written = 0;
        inner.overflow_count = 0;
        inner.samples.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn ramp(n: usize, base: f32) -> Vec<f32> {
        (0..n).map(|i| base + i as f32).collect()
    }

    #[test]
    fn read_returns_exact_length_with_zero_padding() {
        let rb = AudioRingBuffer::new(12_000, DECODE_SAMPLE_RATE);
        rb.write(&ramp(1_200, 1.0), T0); // 100 ms
        // Ask for 200 ms starting 50 ms before the origin.
        let out = rb.read(T0 - 50, 200);
        assert_eq!(out.len(), 2_400);
        // Leading 50 ms (600 samples) are silence.
        assert!(out[..600].iter().all(|&s| s == 0.0));
        assert_eq!(out[600], 1.0);
        assert_eq!(out[600 + 1_199], 1_200.0);
        // Tail beyond what was written is silence.
        assert!(out[600 + 1_200..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn overflow_drops_oldest_batch_and_counts() {
        let rb = AudioRingBuffer::new(1_000, DECODE_SAMPLE_RATE);
        rb.write(&ramp(800, 0.0), T0);
        assert_eq!(rb.overflow_count(), 0);
        rb.write(&ramp(800, 1_000.0), T0 + 66);
        // 600 oldest samples were overwritten.
        assert_eq!(rb.overflow_count(), 600);
        assert_eq!(rb.total_written(), 1_600);

        // The start of the timeline now reads as silence.
        let head = rb.read(T0, 10); // first 120 samples
        assert!(head.iter().all(|&s| s == 0.0));
        // The newest samples are intact: sample index 1599 is 1000+799.
        let tail_start_ms = T0 + 1_599 * 1000 / DECODE_SAMPLE_RATE as i64;
        let tail = rb.read(tail_start_ms, 1);
        assert_eq!(tail[0], 1_799.0);
    }

    #[test]
    fn cumulative_slot_read_grows_with_writes() {
        let rb = AudioRingBuffer::with_seconds(16);
        rb.write(&ramp(6_000, 1.0), T0); // 500 ms
        let w0 = rb.read_from_slot_start(T0, 5_000);
        assert_eq!(w0.len(), 60_000);
        assert_eq!(w0[0], 1.0);
        assert!(w0[6_000..].iter().all(|&s| s == 0.0));

        rb.write(&ramp(6_000, 10_000.0), T0 + 500);
        let w1 = rb.read_from_slot_start(T0, 5_000);
        assert_eq!(w1[6_000], 10_000.0);
    }

    #[test]
    fn read_before_any_write_is_silence() {
        let rb = AudioRingBuffer::with_seconds(2);
        let out = rb.read(T0, 100);
        assert_eq!(out.len(), 1_200);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn reset_clears_timeline() {
        let rb = AudioRingBuffer::with_seconds(2);
        rb.write(&ramp(100, 1.0), T0);
        rb.reset();
        assert_eq!(rb.total_written(), 0);
        assert!(rb.earliest_retained_ms().is_none());
    }
}
