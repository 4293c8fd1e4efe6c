use dasp::interpolate::linear::Linear;
use dasp::{signal, Signal};

/// Linear-interpolating mono resampler.
///
/// Good enough for the 48 kHz capture → 12 kHz decode path (the decoder's
/// passband sits far below the fold) and for adapting encoder output to an
/// odd device rate.
pub fn resample_linear(input: &[f32], from_hz: u32, to_hz: u32) -> Vec<f32> {
    if from_hz == to_hz || input.is_empty() {
        return input.to_vec();
    }
    let mut source = signal::from_iter(input.iter().map(|&s| [s]));
    let first = source.next();
    let second = source.next();
    let interp = Linear::new(first, second);
    source
        .from_hz_to_hz(interp, from_hz as f64, to_hz as f64)
        .until_exhausted()
        .map(|frame| frame[0])
        .collect()
}

/// Output length `resample_linear` produces for `input_len` samples.
pub fn resampled_len(input_len: usize, from_hz: u32, to_hz: u32) -> usize {
    if from_hz == to_hz {
        return input_len;
    }
    (input_len as u64 * to_hz as u64 / from_hz as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_rates_match() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 12_000, 12_000), input);
    }

    #[test]
    fn downsample_4_to_1_length() {
        let input: Vec<f32> = (0..48_000).map(|i| (i % 7) as f32 * 0.01).collect();
        let out = resample_linear(&input, 48_000, 12_000);
        let expected = resampled_len(input.len(), 48_000, 12_000);
        assert!(
            (out.len() as i64 - expected as i64).abs() <= 2,
            "len {} vs expected {expected}",
            out.len()
        );
    }

    #[test]
    fn dc_signal_survives_resampling() {
        let input = vec![0.5f32; 4_800];
        let out = resample_linear(&input, 48_000, 12_000);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn upsample_interpolates_between_samples() {
        let input = vec![0.0f32, 1.0];
        let out = resample_linear(&input, 12_000, 48_000);
        assert!(out.len() >= 4);
        // Values climb monotonically through the interpolation span.
        assert!(out.windows(2).all(|w| w[1] >= w[0] - 1e-6));
    }
}
