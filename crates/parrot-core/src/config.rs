//! Configuration types for Parrot.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Language tags the multilingual text tokenizer understands.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "ar", "da", "de", "el", "en", "es", "fi", "fr", "he", "hi", "it", "ja", "ko", "ms", "nl", "no",
    "pl", "pt", "ru", "sv", "sw", "tr", "zh",
];

/// Check a language tag against [`SUPPORTED_LANGUAGES`] (case-insensitive).
pub fn validate_language(tag: &str) -> Result<String> {
    let tag = tag.trim().to_lowercase();
    if SUPPORTED_LANGUAGES.contains(&tag.as_str()) {
        Ok(tag)
    } else {
        Err(Error::InvalidConfig(format!(
            "unsupported language '{}', expected one of: {}",
            tag,
            SUPPORTED_LANGUAGES.join(", ")
        )))
    }
}

/// Execution device for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    /// CPU-only inference (always available)
    Cpu,
    /// CUDA GPU inference (requires `cuda` feature)
    #[cfg(feature = "cuda")]
    Cuda(u32),
}

impl Default for Device {
    fn default() -> Self {
        #[cfg(feature = "cuda")]
        {
            Device::Cuda(0)
        }
        #[cfg(not(feature = "cuda"))]
        {
            Device::Cpu
        }
    }
}

/// Model quantization/precision level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelDtype {
    /// Full 32-bit float precision
    #[default]
    Fp32,
    /// Half 16-bit float precision (recommended for GPU)
    Fp16,
    /// 8-bit integer quantization
    Q8,
}

impl ModelDtype {
    /// Returns the filename suffix for this dtype.
    pub fn suffix(&self) -> &'static str {
        match self {
            ModelDtype::Fp32 => "",
            ModelDtype::Fp16 => "_fp16",
            ModelDtype::Q8 => "_quantized",
        }
    }

    /// Parse a dtype name as accepted on the command line.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fp32" => Ok(ModelDtype::Fp32),
            "fp16" => Ok(ModelDtype::Fp16),
            "q8" => Ok(ModelDtype::Q8),
            other => Err(Error::InvalidConfig(format!(
                "unknown dtype '{}', expected fp32, fp16 or q8",
                other
            ))),
        }
    }
}

/// Per-request sampling options for the autoregressive decoder.
///
/// `exaggeration` is carried here for convenience but ends up in the
/// [`ConditioningBundle`](crate::conditioning::ConditioningBundle). Raising it makes speech
/// more expressive and also faster; lowering `cfg_weight` slows the pace back down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sampling temperature. 0 means greedy arg-max. Default: 0.8
    pub temperature: f32,
    /// Nucleus mass in (0, 1]. Default: 1.0
    pub top_p: f32,
    /// Relative probability floor in [0, 1). Default: 0.05
    pub min_p: f32,
    /// Penalty >= 1 for already generated tokens. Default: 1.2
    pub repetition_penalty: f32,
    /// Guidance weight, nominally in [0, 1]. Not clamped. Default: 0.5
    pub cfg_weight: f32,
    /// Maximum generated tokens. Default: 1000
    pub max_tokens: usize,
    /// Expressiveness of the conditioned path. Default: 0.5
    pub exaggeration: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 1.0,
            min_p: 0.05,
            repetition_penalty: 1.2,
            cfg_weight: 0.5,
            max_tokens: 1000,
            exaggeration: 0.5,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding with every filter disabled.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            min_p: 0.0,
            repetition_penalty: 1.0,
            cfg_weight: 1.0,
            max_tokens,
            exaggeration: 0.5,
        }
    }

    /// Check every field against its domain.
    ///
    /// `cfg_weight` is only required to be finite: values outside [0, 1] extrapolate the
    /// guidance blend and are the caller's choice.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !(self.min_p >= 0.0 && self.min_p < 1.0) {
            return invalid(format!("min_p must be in [0, 1), got {}", self.min_p));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty < 1.0 {
            return invalid(format!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            ));
        }
        if !self.cfg_weight.is_finite() {
            return invalid(format!("cfg_weight must be finite, got {}", self.cfg_weight));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be positive".to_string());
        }
        if !self.exaggeration.is_finite() || self.exaggeration < 0.0 {
            return invalid(format!(
                "exaggeration must be >= 0, got {}",
                self.exaggeration
            ));
        }
        Ok(())
    }

    /// Whether decoding picks the arg-max instead of sampling.
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }
}

/// Limits applied while building conditioning from a reference recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sample rate the capabilities expect for reference audio.
    pub model_sample_rate: u32,
    /// Only this many leading seconds of a reference are used.
    pub max_reference_secs: f32,
    /// Upper bound on the prompt-token prefix.
    pub max_prompt_tokens: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_sample_rate: crate::audio::SAMPLE_RATE,
            max_reference_secs: 10.0,
            max_prompt_tokens: 150,
        }
    }
}

impl PipelineConfig {
    /// Number of samples kept from a reference at the model rate.
    pub fn max_reference_samples(&self) -> usize {
        (self.max_reference_secs * self.model_sample_rate as f32) as usize
    }
}

/// Configuration for the ONNX-backed pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution device
    pub device: Device,
    /// Model precision/quantization
    pub dtype: ModelDtype,
    /// Directory to cache downloaded models (None = HF cache default)
    pub cache_dir: Option<PathBuf>,
    /// Conditioning limits
    pub pipeline: PipelineConfig,
    /// Key seeding the watermark pattern
    pub watermark_key: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: Device::default(),
            dtype: ModelDtype::default(),
            cache_dir: None,
            pipeline: PipelineConfig::default(),
            watermark_key: crate::watermark::DEFAULT_WATERMARK_KEY,
        }
    }
}

impl Config {
    /// Create a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    device: Option<Device>,
    dtype: Option<ModelDtype>,
    cache_dir: Option<PathBuf>,
    pipeline: Option<PipelineConfig>,
    watermark_key: Option<u64>,
}

impl ConfigBuilder {
    /// Set the execution device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the model dtype.
    pub fn dtype(mut self, dtype: ModelDtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Set the model cache directory.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Set the conditioning limits.
    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the watermark key.
    pub fn watermark_key(mut self, key: u64) -> Self {
        self.watermark_key = Some(key);
        self
    }

    /// Build the config.
    pub fn build(self) -> Config {
        Config {
            device: self.device.unwrap_or_default(),
            dtype: self.dtype.unwrap_or_default(),
            cache_dir: self.cache_dir,
            pipeline: self.pipeline.unwrap_or_default(),
            watermark_key: self
                .watermark_key
                .unwrap_or(crate::watermark::DEFAULT_WATERMARK_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_is_valid() {
        assert!(SamplingConfig::default().validate().is_ok());
        assert!(SamplingConfig::greedy(5).validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_domain() {
        let bad = [
            SamplingConfig { temperature: -0.1, ..Default::default() },
            SamplingConfig { top_p: 0.0, ..Default::default() },
            SamplingConfig { top_p: 1.5, ..Default::default() },
            SamplingConfig { min_p: 1.0, ..Default::default() },
            SamplingConfig { repetition_penalty: 0.9, ..Default::default() },
            SamplingConfig { cfg_weight: f32::NAN, ..Default::default() },
            SamplingConfig { max_tokens: 0, ..Default::default() },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(Error::InvalidConfig(_))),
                "accepted {:?}",
                cfg
            );
        }
    }

    #[test]
    fn test_cfg_weight_extrapolation_allowed() {
        let cfg = SamplingConfig { cfg_weight: 1.5, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sampling_from_partial_json() {
        let cfg: SamplingConfig = serde_json::from_str(r#"{"temperature": 0.0}"#).unwrap();
        assert!(cfg.is_greedy());
        assert_eq!(cfg.max_tokens, 1000);
    }

    #[test]
    fn test_languages() {
        assert_eq!(validate_language("EN").unwrap(), "en");
        assert!(validate_language("xx").is_err());
    }

    #[test]
    fn test_reference_samples() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.max_reference_samples(), 240_000);
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .dtype(ModelDtype::Q8)
            .watermark_key(7)
            .build();
        assert_eq!(config.dtype, ModelDtype::Q8);
        assert_eq!(config.watermark_key, 7);
        assert_eq!(config.pipeline.max_prompt_tokens, 150);
    }
}
