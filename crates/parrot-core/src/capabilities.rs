//! Capability traits for the neural components the pipeline drives.
//!
//! The pipeline never looks inside a network. Each trait is a function from tensors to
//! tensors; implementations must be read-only after construction so a single `Arc` can be
//! shared by concurrent requests. [`crate::onnx`] implements all of them over ONNX Runtime and
//! tests use small deterministic mocks.

use crate::audio::ReferenceRecording;
use crate::conditioning::ConditioningBundle;
use crate::decoder::TokenSequence;
use crate::Result;
use ndarray::{Array1, Array2};

/// Discrete token id shared by text, prompt and speech tokens.
pub type TokenId = u32;

/// Fixed-length speaker embedding from a reference recording.
pub trait VoiceEmbedder: Send + Sync {
    fn embed(&self, recording: &ReferenceRecording) -> Result<Array1<f32>>;
}

/// Fixed-size acoustic feature matrix from a reference recording.
pub trait AcousticFeatureExtractor: Send + Sync {
    fn extract_acoustic_window(&self, recording: &ReferenceRecording) -> Result<Array2<f32>>;
}

/// Speech to discrete speech tokens.
///
/// Used for the conditioning prompt prefix and for voice-conversion sources.
pub trait SpeechTokenizer: Send + Sync {
    fn tokenize_speech(&self, recording: &ReferenceRecording) -> Result<Vec<TokenId>>;
}

/// Text to tokens. Must be deterministic for a given text and language.
pub trait TextTokenizer: Send + Sync {
    fn tokenize_text(&self, text: &str, language: &str) -> Result<Vec<TokenId>>;
}

/// Next-token logits over the speech vocabulary.
pub trait TokenPredictor: Send + Sync {
    /// Logits for the token following `sequence`.
    ///
    /// With `use_conditioning == false` the bundle's speaker information must not influence
    /// the result.
    fn predict(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        use_conditioning: bool,
    ) -> Result<Vec<f32>>;

    /// Length of every logit vector `predict` returns.
    fn vocab_size(&self) -> usize;

    /// Id that ends generation.
    fn stop_token(&self) -> TokenId;
}

/// Waveform produced by a vocoder before watermarking.
#[derive(Debug, Clone)]
pub struct RawWaveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Speech tokens plus conditioning to audio.
pub trait Vocoder: Send + Sync {
    fn vocode(&self, tokens: &[TokenId], bundle: &ConditioningBundle) -> Result<RawWaveform>;
}

/// Embeds and detects the provenance watermark.
pub trait Watermarker: Send + Sync {
    /// Return a watermarked copy of `samples`.
    fn apply(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>>;

    /// Whether `samples` carry this watermarker's mark.
    fn detect(&self, samples: &[f32], sample_rate: u32) -> Result<bool>;
}
