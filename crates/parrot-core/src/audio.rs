//! Audio I/O utilities and the reference recording type.

use crate::{Error, Result};
use std::path::Path;

/// Sample rate of reference audio fed to the encoders and of vocoder output.
pub const SAMPLE_RATE: u32 = 24000;

/// Mono audio supplied by the caller as a voice reference or conversion source.
///
/// The pipeline only ever reads from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceRecording {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl ReferenceRecording {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Load a WAV file, downmixing to mono.
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        let (samples, sample_rate) = read_wav(path)?;
        Ok(Self::new(samples, sample_rate))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// A recording is usable when it has samples and a non-zero rate.
    pub fn is_usable(&self) -> bool {
        !self.samples.is_empty() && self.sample_rate > 0
    }

    /// Resample to `sample_rate`, borrowing when no conversion is needed.
    pub fn resampled(&self, sample_rate: u32) -> std::borrow::Cow<'_, ReferenceRecording> {
        if self.sample_rate == sample_rate {
            std::borrow::Cow::Borrowed(self)
        } else {
            std::borrow::Cow::Owned(Self::new(
                resample_linear(&self.samples, self.sample_rate, sample_rate),
                sample_rate,
            ))
        }
    }

    /// Keep at most the first `max_samples` samples.
    pub fn truncated(&self, max_samples: usize) -> Self {
        let end = self.samples.len().min(max_samples);
        Self::new(self.samples[..end].to_vec(), self.sample_rate)
    }
}

/// Read a WAV file and return mono samples as f32 in range [-1, 1].
///
/// Automatically converts from various bit depths (16-bit, 24-bit, 32-bit).
pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path)
        .map_err(|e| Error::Audio(format!("Failed to open '{}': {}", path.display(), e)))?;

    let spec = reader.spec();
    let sample_rate = spec.sample_rate;

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("Failed to read samples: {}", e)))?,
        (hound::SampleFormat::Int, 24) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8388608.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("Failed to read samples: {}", e)))?,
        (hound::SampleFormat::Int, 32) => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2147483648.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("Failed to read samples: {}", e)))?,
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("Failed to read samples: {}", e)))?,
        _ => {
            return Err(Error::Audio(format!(
                "Unsupported format: {:?} {}bit",
                spec.sample_format, spec.bits_per_sample
            )))
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    } else {
        samples
    };

    Ok((samples, sample_rate))
}

/// Write samples to a WAV file.
///
/// Samples should be f32 in range [-1, 1].
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| Error::Audio(format!("Failed to create '{}': {}", path.display(), e)))?;

    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Audio(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| Error::Audio(format!("Failed to finalize WAV: {}", e)))?;

    Ok(())
}

/// Resample audio to target sample rate using linear interpolation.
pub fn resample_linear(samples: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if from_sr == to_sr || from_sr == 0 {
        return samples.to_vec();
    }

    let ratio = to_sr as f64 / from_sr as f64;
    let output_len = (samples.len() as f64 * ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        let sample = if src_idx + 1 < samples.len() {
            samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac
        } else if src_idx < samples.len() {
            samples[src_idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_length() {
        let samples = vec![0.0; 16000];
        assert_eq!(resample_linear(&samples, 16000, 24000).len(), 24000);
    }

    #[test]
    fn test_truncated() {
        let rec = ReferenceRecording::new(vec![1.0; 10], 2);
        assert_eq!(rec.truncated(4).samples().len(), 4);
        assert_eq!(rec.truncated(40).samples().len(), 10);
        assert_eq!(rec.duration_secs(), 5.0);
    }

    #[test]
    fn test_usable() {
        assert!(!ReferenceRecording::new(vec![], 24000).is_usable());
        assert!(!ReferenceRecording::new(vec![0.0], 0).is_usable());
        assert!(ReferenceRecording::new(vec![0.0], 24000).is_usable());
    }

    #[test]
    fn test_wav_round_trip_downmix() {
        let path = std::env::temp_dir().join(format!("parrot_audio_{}.wav", std::process::id()));
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..8 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let rec = ReferenceRecording::from_wav(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(rec.sample_rate(), 16000);
        assert_eq!(rec.samples().len(), 8);
        assert!((rec.samples()[0] - 0.25).abs() < 1e-6);
    }
}
