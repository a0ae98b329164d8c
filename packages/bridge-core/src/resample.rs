//! Linear-interpolation PCM16 resampler with carried phase/remainder state.
//!
//! Two independent [`Resampler`] instances exist per call: one for the
//! telephony → speech-service direction and one for the reverse. Each keeps
//! its own fractional sample position across calls to [`Resampler::process`]
//! so consecutive frames splice together without clicks at the boundary.

/// Stateful linear-interpolation resampler between two fixed PCM16 rates.
#[derive(Debug, Clone)]
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    /// Fractional source-sample position carried into the next `process`
    /// call. Because consecutive chunks are contiguous in the source
    /// stream, treating the new chunk's index 0 as immediately following
    /// the previous chunk's last sample keeps interpolation continuous
    /// across the boundary without needing to retain the previous sample.
    phase: f64,
}

impl Resampler {
    /// Creates a resampler converting from `src_rate` to `dst_rate`, both in Hz.
    #[must_use]
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            src_rate,
            dst_rate,
            phase: 0.0,
        }
    }

    /// Returns true if this resampler is configured as a pass-through
    /// (source rate equals destination rate).
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.src_rate == self.dst_rate
    }

    /// Reconfigures the resampler for a new rate pair, discarding carried
    /// phase/remainder state. Used when the speech service renegotiates a
    /// format mid-call (§7, `FormatMismatch` recovery).
    pub fn reconfigure(&mut self, src_rate: u32, dst_rate: u32) {
        self.src_rate = src_rate;
        self.dst_rate = dst_rate;
        self.phase = 0.0;
    }

    /// Resamples one PCM16 little-endian chunk, returning a new PCM16
    /// little-endian chunk at `dst_rate`.
    ///
    /// `chunk`'s length must be a multiple of 2; any odd trailing byte is
    /// silently ignored (callers slice on frame boundaries upstream, so
    /// this never happens in practice).
    #[must_use]
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.is_noop() {
            return chunk.to_vec();
        }
        if chunk.is_empty() {
            return Vec::new();
        }

        let src: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if src.is_empty() {
            return Vec::new();
        }

        let ratio = self.src_rate as f64 / self.dst_rate as f64;
        let mut out = Vec::with_capacity((src.len() as f64 / ratio).ceil() as usize + 1);
        let mut pos = self.phase;
        let last_idx = src.len() - 1;

        while (pos.floor() as usize) < last_idx {
            let idx = pos.floor() as usize;
            let frac = pos - pos.floor();
            let a = src[idx];
            let b = src[idx + 1];
            let interpolated = a as f64 + (b as f64 - a as f64) * frac;
            out.extend_from_slice(&(interpolated.round() as i16).to_le_bytes());
            pos += ratio;
        }

        self.phase = pos - last_idx as f64;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_from_i16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn noop_when_rates_match() {
        let mut r = Resampler::new(16_000, 16_000);
        assert!(r.is_noop());
        let input = pcm_from_i16(&[1, 2, 3, 4]);
        assert_eq!(r.process(&input), input);
    }

    #[test]
    fn upsamples_16k_to_24k_preserves_length_ratio() {
        let mut r = Resampler::new(16_000, 24_000);
        let input = pcm_from_i16(&vec![1000i16; 320]);
        let out = r.process(&input);
        let out_samples = out.len() / 2;
        // 320 samples at 16k -> ~480 samples at 24k.
        assert!((470..=490).contains(&out_samples), "got {out_samples}");
    }

    #[test]
    fn downsamples_24k_to_16k_preserves_length_ratio() {
        let mut r = Resampler::new(24_000, 16_000);
        let input = pcm_from_i16(&vec![1000i16; 480]);
        let out = r.process(&input);
        let out_samples = out.len() / 2;
        assert!((310..=330).contains(&out_samples), "got {out_samples}");
    }

    #[test]
    fn carries_phase_across_chunks_without_drift_collapse() {
        let mut r = Resampler::new(16_000, 24_000);
        let chunk = pcm_from_i16(&vec![500i16; 320]);
        let first = r.process(&chunk);
        let second = r.process(&chunk);
        assert!(!first.is_empty());
        assert!(!second.is_empty());
    }

    #[test]
    fn constant_signal_resamples_to_constant_signal() {
        let mut r = Resampler::new(16_000, 24_000);
        let input = pcm_from_i16(&vec![777i16; 320]);
        let out = r.process(&input);
        for pair in out.chunks_exact(2) {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            assert!((v - 777).abs() <= 1);
        }
    }

    #[test]
    fn reconfigure_resets_phase() {
        let mut r = Resampler::new(16_000, 24_000);
        r.process(&pcm_from_i16(&vec![100i16; 320]));
        r.reconfigure(24_000, 16_000);
        assert_eq!(r.phase, 0.0);
    }
}
