//! Vocoding and the watermark gate.
//!
//! [`WatermarkedWaveform`] has no public constructor: the only way to obtain audio from this
//! crate is through [`WatermarkGate`], which watermarks every waveform exactly once and refuses
//! to return audio its watermarker cannot detect.

use crate::capabilities::{TokenId, Vocoder, Watermarker};
use crate::conditioning::ConditioningBundle;
use crate::decoder::{CancelFlag, TokenSequence};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Final pipeline output. Always carries the watermark.
#[derive(Debug, Clone)]
pub struct WatermarkedWaveform {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl WatermarkedWaveform {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate.max(1) as f32
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Write as 32-bit float mono WAV.
    pub fn write_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::audio::write_wav(path, &self.samples, self.sample_rate)
    }
}

/// Turns finished token sequences into watermarked audio.
#[derive(Clone)]
pub struct WatermarkGate {
    vocoder: Arc<dyn Vocoder>,
    watermarker: Arc<dyn Watermarker>,
}

impl WatermarkGate {
    pub fn new(vocoder: Arc<dyn Vocoder>, watermarker: Arc<dyn Watermarker>) -> Self {
        Self {
            vocoder,
            watermarker,
        }
    }

    pub fn watermarker(&self) -> &Arc<dyn Watermarker> {
        &self.watermarker
    }

    /// Render one finished decode.
    pub fn render(
        &self,
        sequence: &TokenSequence,
        bundle: &ConditioningBundle,
        cancel: &CancelFlag,
    ) -> Result<WatermarkedWaveform> {
        self.render_all(std::slice::from_ref(sequence), bundle, cancel)
    }

    /// Render several finished decodes back to back as one waveform.
    ///
    /// Segments are vocoded separately and joined before the single watermark pass.
    pub fn render_all(
        &self,
        sequences: &[TokenSequence],
        bundle: &ConditioningBundle,
        cancel: &CancelFlag,
    ) -> Result<WatermarkedWaveform> {
        if let Some(open) = sequences.iter().position(|s| !s.is_finished()) {
            return Err(Error::Render(format!(
                "token sequence {} has not finished decoding",
                open
            )));
        }
        let segments: Vec<&[TokenId]> = sequences.iter().map(|s| s.speech_tokens()).collect();
        self.render_segments(&segments, bundle, cancel)
    }

    /// Render speech tokens that did not come from the decoder (voice conversion).
    pub fn render_tokens(
        &self,
        tokens: &[TokenId],
        bundle: &ConditioningBundle,
        cancel: &CancelFlag,
    ) -> Result<WatermarkedWaveform> {
        self.render_segments(&[tokens], bundle, cancel)
    }

    fn render_segments(
        &self,
        segments: &[&[TokenId]],
        bundle: &ConditioningBundle,
        cancel: &CancelFlag,
    ) -> Result<WatermarkedWaveform> {
        if segments.is_empty() {
            return Err(Error::Render("nothing to render".to_string()));
        }

        let mut samples = Vec::new();
        let mut sample_rate = None;
        for tokens in segments {
            cancel.check()?;
            let raw = self
                .vocoder
                .vocode(tokens, bundle)
                .map_err(|e| Error::Render(e.to_string()))?;
            match sample_rate {
                None => sample_rate = Some(raw.sample_rate),
                Some(rate) if rate != raw.sample_rate => {
                    return Err(Error::Render(format!(
                        "vocoder changed sample rate mid-request ({} -> {})",
                        rate, raw.sample_rate
                    )));
                }
                Some(_) => {}
            }
            samples.extend(raw.samples);
        }
        let sample_rate = match sample_rate {
            Some(rate) if rate > 0 => rate,
            _ => return Err(Error::Render("vocoder reported no sample rate".to_string())),
        };
        if samples.is_empty() {
            return Err(Error::Render("vocoder produced no audio".to_string()));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(Error::Render("vocoder produced non-finite samples".to_string()));
        }

        // Abandoned between vocoding and watermarking: drop the raw audio.
        cancel.check()?;

        let samples = self
            .watermarker
            .apply(&samples, sample_rate)
            .map_err(|e| Error::Render(format!("watermarking failed: {}", e)))?;
        let verified = self
            .watermarker
            .detect(&samples, sample_rate)
            .map_err(|e| Error::Render(format!("watermark check failed: {}", e)))?;
        if !verified {
            return Err(Error::Render(format!(
                "watermark not detectable in {} samples of output",
                samples.len()
            )));
        }
        debug!(
            samples = samples.len(),
            sample_rate, "rendered watermarked waveform"
        );

        Ok(WatermarkedWaveform {
            samples,
            sample_rate,
        })
    }
}
