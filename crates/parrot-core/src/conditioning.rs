//! Conditioning assembly from a reference recording.

use crate::audio::ReferenceRecording;
use crate::capabilities::{AcousticFeatureExtractor, SpeechTokenizer, TokenId, VoiceEmbedder};
use crate::config::PipelineConfig;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::sync::Arc;
use tracing::debug;

/// Everything the decoder and vocoder need to know about the target voice.
///
/// Built once per request (or once per cached voice) and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningBundle {
    speaker_embedding: Array1<f32>,
    prompt_tokens: Vec<TokenId>,
    acoustic_window: Array2<f32>,
    exaggeration: f32,
}

impl ConditioningBundle {
    pub fn new(
        speaker_embedding: Array1<f32>,
        prompt_tokens: Vec<TokenId>,
        acoustic_window: Array2<f32>,
        exaggeration: f32,
    ) -> Self {
        Self {
            speaker_embedding,
            prompt_tokens,
            acoustic_window,
            exaggeration,
        }
    }

    pub fn speaker_embedding(&self) -> &Array1<f32> {
        &self.speaker_embedding
    }

    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.prompt_tokens
    }

    pub fn acoustic_window(&self) -> &Array2<f32> {
        &self.acoustic_window
    }

    /// Expressiveness bias for the conditioned prediction path.
    ///
    /// Higher values also speed up delivery; the two are entangled in the model.
    pub fn exaggeration(&self) -> f32 {
        self.exaggeration
    }

    /// Copy of this bundle with a different exaggeration.
    pub fn with_exaggeration(&self, exaggeration: f32) -> Self {
        Self {
            exaggeration,
            ..self.clone()
        }
    }
}

/// Turns reference recordings into [`ConditioningBundle`]s.
#[derive(Clone)]
pub struct ConditioningBuilder {
    embedder: Arc<dyn VoiceEmbedder>,
    features: Arc<dyn AcousticFeatureExtractor>,
    speech_tokenizer: Arc<dyn SpeechTokenizer>,
    config: PipelineConfig,
}

impl ConditioningBuilder {
    pub fn new(
        embedder: Arc<dyn VoiceEmbedder>,
        features: Arc<dyn AcousticFeatureExtractor>,
        speech_tokenizer: Arc<dyn SpeechTokenizer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            embedder,
            features,
            speech_tokenizer,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resample and cut a recording down to the span conditioning is computed over.
    ///
    /// Only the first `max_reference_secs` seconds survive, so recordings that agree on that
    /// prefix condition identically.
    pub fn prepare_reference(&self, reference: &ReferenceRecording) -> Result<ReferenceRecording> {
        if !reference.is_usable() {
            return Err(Error::MissingReference);
        }
        let resampled = reference.resampled(self.config.model_sample_rate);
        Ok(resampled.truncated(self.config.max_reference_samples()))
    }

    /// Build conditioning from a reference recording.
    pub fn build(
        &self,
        reference: &ReferenceRecording,
        exaggeration: f32,
    ) -> Result<ConditioningBundle> {
        let clip = self.prepare_reference(reference)?;
        debug!(
            input_secs = reference.duration_secs(),
            used_secs = clip.duration_secs(),
            "building conditioning"
        );

        let speaker_embedding = self.embedder.embed(&clip)?;
        let acoustic_window = self.features.extract_acoustic_window(&clip)?;
        let mut prompt_tokens = self.speech_tokenizer.tokenize_speech(&clip)?;
        prompt_tokens.truncate(self.config.max_prompt_tokens);

        Ok(ConditioningBundle::new(
            speaker_embedding,
            prompt_tokens,
            acoustic_window,
            exaggeration,
        ))
    }
}
