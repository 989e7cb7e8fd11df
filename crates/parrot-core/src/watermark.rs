//! Keyed spread-spectrum audio watermark.
//!
//! A ±1 chip pattern derived from the key is added at low amplitude. Detection correlates the
//! first difference of the audio with the first difference of the pattern, which suppresses
//! the mostly low-frequency speech energy and leaves the white chip sequence. The correlation
//! is reported as a z-statistic so loud or noisy content cannot swamp it, and the embedding
//! strength follows the local high-frequency energy so the mark stays detectable under it.

use crate::capabilities::Watermarker;
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Key used when the configuration does not name one.
pub const DEFAULT_WATERMARK_KEY: u64 = 0x5041_5252_4f54_574d;

/// Minimum amplitude of the embedded pattern (about -54 dBFS).
pub const DEFAULT_STRENGTH: f32 = 0.002;

/// Pattern amplitude relative to the RMS first difference of each block.
const RELATIVE_STRENGTH: f32 = 0.08;

/// Samples per strength block.
const BLOCK_LEN: usize = 1024;

/// Chip pattern period in samples.
const PATTERN_LEN: usize = 1 << 16;

/// Shorter signals are never reported as watermarked.
pub const MIN_DETECT_SAMPLES: usize = 256;

/// z-score above which a signal counts as marked.
const DETECT_THRESHOLD: f32 = 4.0;

#[derive(Debug, Clone)]
pub struct SpreadSpectrumWatermarker {
    pattern: Vec<f32>,
    strength: f32,
}

impl SpreadSpectrumWatermarker {
    pub fn new(key: u64) -> Self {
        Self::with_strength(key, DEFAULT_STRENGTH)
    }

    /// Watermarker with `strength` as the amplitude floor.
    pub fn with_strength(key: u64, strength: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(key);
        let pattern = (0..PATTERN_LEN)
            .map(|_| if rng.gen::<bool>() { 1.0 } else { -1.0 })
            .collect();
        Self { pattern, strength }
    }

    fn chip(&self, i: usize) -> f32 {
        self.pattern[i % PATTERN_LEN]
    }

    fn chip_diff(&self, i: usize) -> f64 {
        (self.chip(i) - self.chip(i - 1)) as f64
    }

    /// Amplitude used for the block starting at `start`.
    fn block_strength(&self, samples: &[f32], start: usize, len: usize) -> f32 {
        let window = &samples[start.saturating_sub(1)..start + len];
        if window.len() < 2 {
            return self.strength;
        }
        let sum_sq: f32 = window.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
        let rms = (sum_sq / (window.len() - 1) as f32).sqrt();
        self.strength.max(RELATIVE_STRENGTH * rms)
    }

    /// Detection statistic: `Σ dy·dp / sqrt(Σ dy²·dp²)`.
    ///
    /// Roughly standard normal on unmarked audio and large and positive on marked audio.
    pub fn score(&self, samples: &[f32]) -> f32 {
        if samples.len() < 2 {
            return 0.0;
        }
        let mut correlation = 0.0f64;
        let mut variance = 0.0f64;
        for i in 1..samples.len() {
            let dy = (samples[i] - samples[i - 1]) as f64;
            let dp = self.chip_diff(i);
            correlation += dy * dp;
            variance += dy * dy * dp * dp;
        }
        if variance == 0.0 {
            return 0.0;
        }
        (correlation / variance.sqrt()) as f32
    }

    /// Embedded amplitude in units of the strength floor.
    ///
    /// ~1 after one pass over quiet audio, ~2 after two.
    pub fn mark_level(&self, samples: &[f32]) -> f32 {
        if samples.len() < 2 || self.strength <= 0.0 {
            return 0.0;
        }
        let mut correlation = 0.0f64;
        let mut energy = 0.0f64;
        for i in 1..samples.len() {
            let dy = (samples[i] - samples[i - 1]) as f64;
            let dp = self.chip_diff(i);
            correlation += dy * dp;
            energy += dp * dp;
        }
        if energy == 0.0 {
            return 0.0;
        }
        (correlation / (self.strength as f64 * energy)) as f32
    }
}

impl Default for SpreadSpectrumWatermarker {
    fn default() -> Self {
        Self::new(DEFAULT_WATERMARK_KEY)
    }
}

impl Watermarker for SpreadSpectrumWatermarker {
    fn apply(&self, samples: &[f32], _sample_rate: u32) -> Result<Vec<f32>> {
        debug!(samples = samples.len(), "embedding watermark");
        let mut marked = Vec::with_capacity(samples.len());
        for (block, chunk) in samples.chunks(BLOCK_LEN).enumerate() {
            let start = block * BLOCK_LEN;
            let strength = self.block_strength(samples, start, chunk.len());
            marked.extend(
                chunk
                    .iter()
                    .enumerate()
                    .map(|(j, &s)| s + strength * self.chip(start + j)),
            );
        }
        Ok(marked)
    }

    fn detect(&self, samples: &[f32], _sample_rate: u32) -> Result<bool> {
        if samples.len() < MIN_DETECT_SAMPLES {
            return Ok(false);
        }
        Ok(self.score(samples) > DETECT_THRESHOLD)
    }
}
