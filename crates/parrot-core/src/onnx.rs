//! ONNX Runtime implementation of every model capability.

use crate::audio::{ReferenceRecording, SAMPLE_RATE};
use crate::capabilities::{
    AcousticFeatureExtractor, RawWaveform, SpeechTokenizer, TextTokenizer, TokenId,
    TokenPredictor, Vocoder, VoiceEmbedder,
};
use crate::conditioning::ConditioningBundle;
use crate::config::{Config, ModelDtype};
use crate::decoder::TokenSequence;
use crate::models::{download_models, ModelPaths, ModelSessions};
use crate::pipeline::{Capabilities, Pipeline};
use crate::watermark::SpreadSpectrumWatermarker;
use crate::{Error, Result};

use half::f16;
use ndarray::{concatenate, s, Array, Array1, Array2, Array3, Array4, ArrayD, Axis, Ix3};
use ort::{inputs, session::SessionInputValue, value::Value};
use std::borrow::Cow;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

// Model constants
const START_SPEECH_TOKEN: TokenId = 6561;
const STOP_SPEECH_TOKEN: TokenId = 6562;
const SPEECH_VOCAB_SIZE: usize = 6563;
const SILENCE_TOKEN: i64 = 4299;
const NUM_KV_HEADS: usize = 16;
const HEAD_DIM: usize = 64;

/// Outputs of one speech encoder pass.
struct EncodedReference {
    speaker_embeddings: ArrayD<f32>,
    speaker_features: ArrayD<f32>,
    audio_tokens: ArrayD<i64>,
}

/// Chatterbox ONNX export driven through `ort`.
pub struct OnnxBackend {
    sessions: ModelSessions,
    tokenizer: Tokenizer,
    dtype: ModelDtype,
}

impl OnnxBackend {
    /// Download (if needed) and load every model.
    pub fn from_pretrained(config: &Config) -> Result<Self> {
        info!(dtype = ?config.dtype, "downloading models");
        let paths = download_models(config.dtype, config.cache_dir.as_deref())?;
        Self::from_paths(&paths, config)
    }

    pub fn from_paths(paths: &ModelPaths, config: &Config) -> Result<Self> {
        info!("loading tokenizer");
        let tokenizer =
            Tokenizer::from_file(&paths.tokenizer).map_err(|e| Error::Tokenizer(e.to_string()))?;
        let sessions = ModelSessions::load(paths, config)?;
        Ok(Self {
            sessions,
            tokenizer,
            dtype: config.dtype,
        })
    }

    /// Wire this backend and the configured watermarker into a [`Pipeline`].
    pub fn into_pipeline(self, config: &Config) -> Pipeline {
        let backend = Arc::new(self);
        let capabilities = Capabilities {
            embedder: backend.clone(),
            features: backend.clone(),
            speech_tokenizer: backend.clone(),
            text_tokenizer: backend.clone(),
            predictor: backend.clone(),
            vocoder: backend,
            watermarker: Arc::new(SpreadSpectrumWatermarker::new(config.watermark_key)),
        };
        Pipeline::new(capabilities, config.pipeline.clone())
    }

    fn encode(&self, recording: &ReferenceRecording) -> Result<EncodedReference> {
        let samples = recording.samples().to_vec();
        let audio = Array2::from_shape_vec((1, samples.len()), samples)?;
        let audio_val = Value::from_array(audio.into_dyn())?;

        let mut encoder = self.sessions.speech_encoder.lock();
        let outputs = encoder.run(inputs!["audio_values" => audio_val])?;

        let speaker_embeddings = extract_f32_tensor(&outputs["speaker_embeddings"], self.dtype)?;
        let speaker_features = extract_f32_tensor(&outputs["speaker_features"], self.dtype)?;
        let (s, d) = outputs["audio_tokens"].try_extract_tensor::<i64>()?;
        let audio_tokens = ArrayD::from_shape_vec(shape_to_vec(s), d.to_vec())?;

        Ok(EncodedReference {
            speaker_embeddings,
            speaker_features,
            audio_tokens,
        })
    }

    /// Embed token ids as `[1, len, hidden]`.
    fn embed_ids(&self, ids: &[TokenId]) -> Result<Array3<f32>> {
        let ids: Vec<i64> = ids.iter().map(|&t| t as i64).collect();
        let input_ids = Array2::from_shape_vec((1, ids.len()), ids)?;
        let input_ids_ort = Value::from_array(input_ids.into_dyn())?;

        let mut embed_tokens = self.sessions.embed_tokens.lock();
        let outputs = embed_tokens.run(inputs!["input_ids" => input_ids_ort])?;
        let embeds = extract_f32_tensor(&outputs["inputs_embeds"], self.dtype)?;
        Ok(embeds.into_dimensionality::<Ix3>()?)
    }
}

impl VoiceEmbedder for OnnxBackend {
    fn embed(&self, recording: &ReferenceRecording) -> Result<Array1<f32>> {
        let encoded = self.encode(recording)?;
        let flat: Vec<f32> = encoded.speaker_embeddings.iter().copied().collect();
        Ok(Array1::from_vec(flat))
    }
}

impl AcousticFeatureExtractor for OnnxBackend {
    fn extract_acoustic_window(&self, recording: &ReferenceRecording) -> Result<Array2<f32>> {
        let features = self.encode(recording)?.speaker_features;
        let features = features.into_dimensionality::<Ix3>()?;
        Ok(features.index_axis(Axis(0), 0).to_owned())
    }
}

impl SpeechTokenizer for OnnxBackend {
    fn tokenize_speech(&self, recording: &ReferenceRecording) -> Result<Vec<TokenId>> {
        let tokens = self.encode(recording)?.audio_tokens;
        tokens
            .iter()
            .map(|&t| {
                TokenId::try_from(t)
                    .map_err(|_| Error::Prediction(format!("speech encoder emitted token {}", t)))
            })
            .collect()
    }
}

impl TextTokenizer for OnnxBackend {
    fn tokenize_text(&self, text: &str, language: &str) -> Result<Vec<TokenId>> {
        let tagged;
        let text = if language == "en" {
            text
        } else {
            tagged = format!("[{}]{}", language, text);
            &tagged
        };
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TokenPredictor for OnnxBackend {
    /// Full-context forward pass without a KV cache.
    ///
    /// The conditioning prefix (embedded prompt tokens) is zeroed for the unconditioned pass
    /// so both passes see identical positions.
    fn predict(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        use_conditioning: bool,
    ) -> Result<Vec<f32>> {
        let mut speech = Vec::with_capacity(sequence.len() + 1);
        speech.push(START_SPEECH_TOKEN);
        speech.extend_from_slice(sequence.generated());

        let mut parts = Vec::with_capacity(3);
        if !sequence.prompt_tokens().is_empty() {
            let mut cond = self.embed_ids(sequence.prompt_tokens())?;
            if !use_conditioning {
                cond.fill(0.0);
            }
            parts.push(cond);
        }
        if !sequence.request_tokens().is_empty() {
            parts.push(self.embed_ids(sequence.request_tokens())?);
        }
        parts.push(self.embed_ids(&speech)?);
        let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
        let inputs_embeds: Array3<f32> = concatenate(Axis(1), &views)?;

        let seq_len = inputs_embeds.shape()[1];
        let attention_mask = Array2::<i64>::ones((1, seq_len));
        let position_ids =
            Array::from_iter(0..seq_len as i64).into_shape_with_order((1, seq_len))?;

        let mut dynamic_inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> = Vec::new();
        dynamic_inputs.push((
            "inputs_embeds".into(),
            make_tensor(
                &inputs_embeds.into_dyn(),
                self.sessions.lm_input_is_f16("inputs_embeds"),
            )?
            .into(),
        ));
        dynamic_inputs.push((
            "attention_mask".into(),
            Value::from_array(attention_mask.into_dyn())?.into(),
        ));
        dynamic_inputs.push((
            "position_ids".into(),
            Value::from_array(position_ids.into_dyn())?.into(),
        ));
        if self.sessions.lm_has_input("exaggeration") {
            let exaggeration = if use_conditioning {
                bundle.exaggeration()
            } else {
                0.0
            };
            let value = ArrayD::from_elem(vec![1, 1, 1], exaggeration);
            dynamic_inputs.push((
                "exaggeration".into(),
                make_tensor(&value, self.sessions.lm_input_is_f16("exaggeration"))?.into(),
            ));
        }
        for name in self.sessions.past_key_value_inputs() {
            let empty = Array4::<f32>::zeros((1, NUM_KV_HEADS, 0, HEAD_DIM)).into_dyn();
            dynamic_inputs.push((
                name.to_string().into(),
                make_tensor(&empty, self.sessions.lm_input_is_f16(name))?.into(),
            ));
        }

        let mut lm = self.sessions.language_model.lock();
        let outputs = lm.run(dynamic_inputs)?;
        let logits = extract_f32_tensor(&outputs["logits"], self.dtype)?;
        let last = logits.into_dimensionality::<Ix3>()?.slice(s![0, -1, ..]).to_vec();
        Ok(last)
    }

    fn vocab_size(&self) -> usize {
        SPEECH_VOCAB_SIZE
    }

    fn stop_token(&self) -> TokenId {
        STOP_SPEECH_TOKEN
    }
}

impl Vocoder for OnnxBackend {
    fn vocode(&self, tokens: &[TokenId], bundle: &ConditioningBundle) -> Result<RawWaveform> {
        let speech: Vec<i64> = bundle
            .prompt_tokens()
            .iter()
            .chain(tokens)
            .map(|&t| t as i64)
            .chain(std::iter::repeat(SILENCE_TOKEN).take(3))
            .collect();
        debug!(tokens = speech.len(), "vocoding");
        let speech_input = Array2::from_shape_vec((1, speech.len()), speech)?;

        let speaker_embeddings = bundle.speaker_embedding().clone().insert_axis(Axis(0));
        let speaker_features = bundle.acoustic_window().clone().insert_axis(Axis(0));

        let mut decoder = self.sessions.conditional_decoder.lock();
        let wav_output = decoder.run(inputs![
            "speech_tokens" => Value::from_array(speech_input.into_dyn())?,
            "speaker_embeddings" => Value::from_array(speaker_embeddings.into_dyn())?,
            "speaker_features" => Value::from_array(speaker_features.into_dyn())?
        ])?;

        let (_, d) = wav_output[0].try_extract_tensor::<f32>()?;
        Ok(RawWaveform {
            samples: d.to_vec(),
            sample_rate: SAMPLE_RATE,
        })
    }
}

impl Pipeline {
    /// Download the ONNX models and build a ready-to-use pipeline.
    pub fn from_pretrained(config: Config) -> Result<Self> {
        Ok(OnnxBackend::from_pretrained(&config)?.into_pipeline(&config))
    }
}

/// Extract f32 tensor, handling f16 conversion if needed.
fn extract_f32_tensor(val: &Value, dtype: ModelDtype) -> Result<ArrayD<f32>> {
    if matches!(dtype, ModelDtype::Fp16) {
        if let Ok((s, d)) = val.try_extract_tensor::<f16>() {
            let f32_data: Vec<f32> = d.iter().map(|x| x.to_f32()).collect();
            return Ok(ArrayD::from_shape_vec(shape_to_vec(s), f32_data)?);
        }
    }
    let (s, d) = val.try_extract_tensor::<f32>()?;
    Ok(ArrayD::from_shape_vec(shape_to_vec(s), d.to_vec())?)
}

/// Create ORT tensor with correct dtype.
fn make_tensor(arr: &ArrayD<f32>, is_f16: bool) -> Result<Value> {
    if is_f16 {
        let arr_f16 = arr.mapv(f16::from_f32);
        Ok(Value::from_array(arr_f16)?.into_dyn())
    } else {
        Ok(Value::from_array(arr.to_owned())?.into_dyn())
    }
}

/// Convert ORT shape to Vec<usize>.
fn shape_to_vec(shape: &ort::tensor::Shape) -> Vec<usize> {
    let dims: &[i64] = shape.as_ref();
    dims.iter().map(|&x| x as usize).collect()
}
