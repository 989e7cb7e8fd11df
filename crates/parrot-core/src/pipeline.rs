//! The public generation pipeline: text-to-speech, multilingual text-to-speech and voice
//! conversion, all ending in the watermark gate.

use crate::audio::ReferenceRecording;
use crate::capabilities::{
    AcousticFeatureExtractor, SpeechTokenizer, TextTokenizer, TokenPredictor, Vocoder,
    VoiceEmbedder, Watermarker,
};
use crate::conditioning::{ConditioningBuilder, ConditioningBundle};
use crate::config::{validate_language, PipelineConfig, SamplingConfig};
use crate::decoder::{CancelFlag, Decoder, StreamEvent, TokenSequence};
use crate::render::{WatermarkGate, WatermarkedWaveform};
use crate::voices::{VoiceCache, DEFAULT_VOICE_ID, RECOMMENDED_REFERENCE_SECS};
use crate::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default exaggeration used when voice conversion builds target conditioning.
const CONVERSION_EXAGGERATION: f32 = 0.5;

/// Character limit per chunk in [`Pipeline::synthesize_chunked`].
pub const DEFAULT_CHUNK_CHARS: usize = 300;

/// Read-only handles to every capability the pipeline drives.
#[derive(Clone)]
pub struct Capabilities {
    pub embedder: Arc<dyn VoiceEmbedder>,
    pub features: Arc<dyn AcousticFeatureExtractor>,
    pub speech_tokenizer: Arc<dyn SpeechTokenizer>,
    pub text_tokenizer: Arc<dyn TextTokenizer>,
    pub predictor: Arc<dyn TokenPredictor>,
    pub vocoder: Arc<dyn Vocoder>,
    pub watermarker: Arc<dyn Watermarker>,
}

/// Which voice a request should sound like.
#[derive(Debug, Clone, Copy)]
pub enum VoiceRef<'a> {
    /// Encode this recording for the request
    Recording(&'a ReferenceRecording),
    /// A voice previously added with [`Pipeline::add_voice`]
    Cached(&'a str),
    /// The registered default voice
    Default,
}

impl<'a> From<Option<&'a ReferenceRecording>> for VoiceRef<'a> {
    fn from(reference: Option<&'a ReferenceRecording>) -> Self {
        match reference {
            Some(recording) => VoiceRef::Recording(recording),
            None => VoiceRef::Default,
        }
    }
}

/// Events emitted during chunked generation.
#[derive(Debug, Clone)]
pub enum ChunkEvent {
    /// A text chunk started decoding
    ChunkStarted {
        index: usize,
        total: usize,
        text: String,
    },
    /// A text chunk finished decoding
    ChunkDecoded {
        index: usize,
        total: usize,
        tokens: usize,
    },
}

/// Speech generation pipeline.
///
/// Every method takes `&self`; share one pipeline behind an `Arc` and give each request its
/// own RNG and [`CancelFlag`].
pub struct Pipeline {
    builder: ConditioningBuilder,
    text_tokenizer: Arc<dyn TextTokenizer>,
    speech_tokenizer: Arc<dyn SpeechTokenizer>,
    decoder: Decoder,
    gate: WatermarkGate,
    voices: RwLock<VoiceCache>,
}

impl Pipeline {
    pub fn new(capabilities: Capabilities, config: PipelineConfig) -> Self {
        let Capabilities {
            embedder,
            features,
            speech_tokenizer,
            text_tokenizer,
            predictor,
            vocoder,
            watermarker,
        } = capabilities;

        Self {
            builder: ConditioningBuilder::new(
                embedder,
                features,
                speech_tokenizer.clone(),
                config,
            ),
            text_tokenizer,
            speech_tokenizer,
            decoder: Decoder::new(predictor),
            gate: WatermarkGate::new(vocoder, watermarker),
            voices: RwLock::new(VoiceCache::new()),
        }
    }

    pub fn conditioning_builder(&self) -> &ConditioningBuilder {
        &self.builder
    }

    pub fn watermarker(&self) -> &Arc<dyn Watermarker> {
        self.gate.watermarker()
    }

    /// Encode a reference recording and cache it under `id`.
    pub fn add_voice(
        &self,
        id: impl Into<String>,
        reference: &ReferenceRecording,
        exaggeration: f32,
    ) -> Result<()> {
        let id = id.into();
        if reference.duration_secs() < RECOMMENDED_REFERENCE_SECS {
            warn!(
                voice = %id,
                secs = reference.duration_secs(),
                "reference shorter than {}s, cloning quality may suffer",
                RECOMMENDED_REFERENCE_SECS
            );
        }
        let bundle = self.builder.build(reference, exaggeration)?;
        if self.voices.write().add(id.clone(), bundle) {
            info!(voice = %id, "replaced cached voice");
        } else {
            info!(voice = %id, "added voice");
        }
        Ok(())
    }

    /// Register the voice used when a request has no usable reference.
    pub fn set_default_voice(&self, reference: &ReferenceRecording) -> Result<()> {
        self.add_voice(DEFAULT_VOICE_ID, reference, SamplingConfig::default().exaggeration)
    }

    pub fn remove_voice(&self, id: &str) -> bool {
        self.voices.write().remove(id)
    }

    pub fn list_voices(&self) -> Vec<String> {
        self.voices.read().list()
    }

    pub fn has_voice(&self, id: &str) -> bool {
        self.voices.read().contains(id)
    }

    /// Conditioning for a request.
    ///
    /// An unusable recording falls back to the default voice; with no default the request
    /// fails with [`Error::MissingReference`]. Cached bundles are copied with the requested
    /// exaggeration, never modified in place.
    pub fn resolve_conditioning(
        &self,
        voice: VoiceRef<'_>,
        exaggeration: f32,
    ) -> Result<ConditioningBundle> {
        let cached = |id: &str| {
            self.voices
                .read()
                .get(id)
                .map(|bundle| restamp(bundle, exaggeration))
        };

        match voice {
            VoiceRef::Recording(recording) if recording.is_usable() => {
                self.builder.build(recording, exaggeration)
            }
            VoiceRef::Recording(_) | VoiceRef::Default => {
                cached(DEFAULT_VOICE_ID).ok_or(Error::MissingReference)
            }
            VoiceRef::Cached(id) => cached(id).ok_or_else(|| Error::VoiceNotFound(id.to_string())),
        }
    }

    /// Text-to-speech in `language` (e.g. `"en"`, `"fr"`), cloning `reference` or the default
    /// voice.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        text: &str,
        language: &str,
        reference: Option<&ReferenceRecording>,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<WatermarkedWaveform> {
        self.synthesize(
            text,
            language,
            reference.into(),
            sampling,
            rng,
            &CancelFlag::new(),
            &mut |_| {},
        )
    }

    /// Full-control text-to-speech with cancellation and per-token events.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize<R, F>(
        &self,
        text: &str,
        language: &str,
        voice: VoiceRef<'_>,
        sampling: &SamplingConfig,
        rng: &mut R,
        cancel: &CancelFlag,
        on_token: &mut F,
    ) -> Result<WatermarkedWaveform>
    where
        R: Rng + ?Sized,
        F: FnMut(StreamEvent),
    {
        sampling.validate()?;
        let language = validate_language(language)?;
        let bundle = self.resolve_conditioning(voice, sampling.exaggeration)?;

        let sequence = self.decode_text(text, &language, &bundle, sampling, rng, cancel, on_token)?;
        let waveform = self.gate.render(&sequence, &bundle, cancel)?;
        info!(
            language = %language,
            tokens = sequence.len(),
            stop = ?sequence.stop_reason(),
            secs = waveform.duration_secs(),
            "generated speech"
        );
        Ok(waveform)
    }

    /// Text-to-speech for long inputs: decode sentence chunks one at a time, then render
    /// them together as a single watermarked waveform.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize_chunked<R, F>(
        &self,
        text: &str,
        language: &str,
        voice: VoiceRef<'_>,
        sampling: &SamplingConfig,
        max_chunk_chars: usize,
        rng: &mut R,
        cancel: &CancelFlag,
        callback: &mut F,
    ) -> Result<WatermarkedWaveform>
    where
        R: Rng + ?Sized,
        F: FnMut(ChunkEvent),
    {
        sampling.validate()?;
        let language = validate_language(language)?;
        let chunks = crate::text::chunk_text(text, max_chunk_chars.max(1));
        if chunks.is_empty() {
            return Err(Error::InvalidConfig("text is empty".to_string()));
        }
        let bundle = self.resolve_conditioning(voice, sampling.exaggeration)?;

        let total = chunks.len();
        let mut sequences = Vec::with_capacity(total);
        for (index, chunk) in chunks.into_iter().enumerate() {
            callback(ChunkEvent::ChunkStarted {
                index,
                total,
                text: chunk.clone(),
            });
            let sequence =
                self.decode_text(&chunk, &language, &bundle, sampling, rng, cancel, &mut |_| {})?;
            callback(ChunkEvent::ChunkDecoded {
                index,
                total,
                tokens: sequence.len(),
            });
            sequences.push(sequence);
        }

        let waveform = self.gate.render_all(&sequences, &bundle, cancel)?;
        info!(
            chunks = total,
            secs = waveform.duration_secs(),
            "generated chunked speech"
        );
        Ok(waveform)
    }

    /// Re-voice `source` as the target reference (or the default voice).
    pub fn convert_voice(
        &self,
        source: &ReferenceRecording,
        target: Option<&ReferenceRecording>,
    ) -> Result<WatermarkedWaveform> {
        self.convert_voice_with(source, target.into(), &CancelFlag::new())
    }

    /// Voice conversion with an explicit voice selection and cancel flag.
    ///
    /// The source's speech tokens are vocoded directly under the target's conditioning; no
    /// decoding loop runs.
    pub fn convert_voice_with(
        &self,
        source: &ReferenceRecording,
        target: VoiceRef<'_>,
        cancel: &CancelFlag,
    ) -> Result<WatermarkedWaveform> {
        if !source.is_usable() {
            return Err(Error::Audio("source audio is empty".to_string()));
        }
        let bundle = self.resolve_conditioning(target, CONVERSION_EXAGGERATION)?;
        cancel.check()?;

        let source = source.resampled(self.builder.config().model_sample_rate);
        let tokens = self.speech_tokenizer.tokenize_speech(&source)?;
        debug!(tokens = tokens.len(), "tokenized conversion source");

        let waveform = self.gate.render_tokens(&tokens, &bundle, cancel)?;
        info!(secs = waveform.duration_secs(), "converted voice");
        Ok(waveform)
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_text<R, F>(
        &self,
        text: &str,
        language: &str,
        bundle: &ConditioningBundle,
        sampling: &SamplingConfig,
        rng: &mut R,
        cancel: &CancelFlag,
        on_token: &mut F,
    ) -> Result<TokenSequence>
    where
        R: Rng + ?Sized,
        F: FnMut(StreamEvent),
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidConfig("text is empty".to_string()));
        }
        let request_tokens = self.text_tokenizer.tokenize_text(text, language)?;
        debug!(
            chars = text.chars().count(),
            tokens = request_tokens.len(),
            "tokenized text"
        );
        self.decoder
            .decode_streaming(bundle, &request_tokens, sampling, rng, cancel, on_token)
    }
}

fn restamp(bundle: &ConditioningBundle, exaggeration: f32) -> ConditioningBundle {
    if bundle.exaggeration() == exaggeration {
        bundle.clone()
    } else {
        bundle.with_exaggeration(exaggeration)
    }
}
