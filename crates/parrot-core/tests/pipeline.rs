//! End-to-end pipeline behaviour against deterministic mock capabilities.

use ndarray::{Array1, Array2};
use parrot_core::capabilities::{
    AcousticFeatureExtractor, RawWaveform, SpeechTokenizer, TextTokenizer, TokenPredictor,
    Vocoder, VoiceEmbedder,
};
use parrot_core::{
    CancelFlag, Capabilities, ChunkEvent, ConditioningBundle, Decoder, Error, Pipeline,
    PipelineConfig, ReferenceRecording, Result, SamplingConfig, SpreadSpectrumWatermarker,
    StopReason, StreamEvent, TokenId, TokenSequence, VoiceRef,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const RATE: u32 = 24000;
const VOCAB: usize = 32;
const STOP: TokenId = 31;

struct MockEncoder;

impl VoiceEmbedder for MockEncoder {
    fn embed(&self, recording: &ReferenceRecording) -> Result<Array1<f32>> {
        let s = recording.samples();
        let mean = s.iter().sum::<f32>() / s.len() as f32;
        Ok(Array1::from_vec(vec![mean, s.len() as f32]))
    }
}

impl AcousticFeatureExtractor for MockEncoder {
    fn extract_acoustic_window(&self, recording: &ReferenceRecording) -> Result<Array2<f32>> {
        let rows: Vec<f32> = recording
            .samples()
            .chunks(2400)
            .map(|c| c.iter().map(|x| x * x).sum::<f32>() / c.len() as f32)
            .collect();
        Ok(Array2::from_shape_vec((rows.len(), 1), rows)?)
    }
}

impl SpeechTokenizer for MockEncoder {
    fn tokenize_speech(&self, recording: &ReferenceRecording) -> Result<Vec<TokenId>> {
        Ok(recording
            .samples()
            .chunks(480)
            .map(|c| {
                let level = c.iter().map(|x| x.abs()).sum::<f32>() / c.len() as f32;
                (level * 100.0) as TokenId % 30
            })
            .collect())
    }
}

struct MockText;

impl TextTokenizer for MockText {
    fn tokenize_text(&self, text: &str, language: &str) -> Result<Vec<TokenId>> {
        let offset = language.bytes().map(TokenId::from).sum::<TokenId>();
        Ok(text
            .bytes()
            .map(|b| (TokenId::from(b) + offset) % 30)
            .collect())
    }
}

/// Conditioned logits follow the speaker embedding, unconditioned ones the text. Both agree
/// on stopping after `stop_after` tokens.
struct MockPredictor {
    stop_after: usize,
    calls: AtomicUsize,
}

impl MockPredictor {
    fn new(stop_after: usize) -> Self {
        Self {
            stop_after,
            calls: AtomicUsize::new(0),
        }
    }
}

impl TokenPredictor for MockPredictor {
    fn predict(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        use_conditioning: bool,
    ) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut logits = vec![0.0; VOCAB];
        if sequence.len() >= self.stop_after {
            logits[STOP as usize] = 20.0;
            return Ok(logits);
        }
        let step = sequence.len();
        let favored = if use_conditioning {
            let voice = (bundle.speaker_embedding()[0].abs() * 1000.0) as usize;
            (voice + 3 * step) % 30
        } else {
            let text: usize = sequence.request_tokens().iter().map(|&t| t as usize).sum();
            (text + 7 * step) % 30
        };
        logits[favored] = 10.0;
        for (i, l) in logits.iter_mut().enumerate().take(30) {
            *l += (i % 5) as f32 * 0.1;
        }
        Ok(logits)
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn stop_token(&self) -> TokenId {
        STOP
    }
}

/// Only ever sees the unconditioned path.
struct WithoutConditioning(Arc<MockPredictor>);

impl TokenPredictor for WithoutConditioning {
    fn predict(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        _use_conditioning: bool,
    ) -> Result<Vec<f32>> {
        self.0.predict(bundle, sequence, false)
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn stop_token(&self) -> TokenId {
        STOP
    }
}

/// A quiet low tone per token, phase-continuous across tokens.
struct MockVocoder;

impl Vocoder for MockVocoder {
    fn vocode(&self, tokens: &[TokenId], _bundle: &ConditioningBundle) -> Result<RawWaveform> {
        let mut samples = Vec::with_capacity(tokens.len() * 480);
        let mut phase = 0.0f32;
        for &token in tokens {
            let freq = 100.0 + 10.0 * token as f32;
            for _ in 0..480 {
                phase += 2.0 * std::f32::consts::PI * freq / RATE as f32;
                samples.push(0.1 * phase.sin());
            }
        }
        Ok(RawWaveform {
            samples,
            sample_rate: RATE,
        })
    }
}

struct BrokenVocoder;

impl Vocoder for BrokenVocoder {
    fn vocode(&self, _tokens: &[TokenId], _bundle: &ConditioningBundle) -> Result<RawWaveform> {
        Err(Error::Model("out of device memory".to_string()))
    }
}

fn capabilities(predictor: Arc<dyn TokenPredictor>, vocoder: Arc<dyn Vocoder>) -> Capabilities {
    let encoder = Arc::new(MockEncoder);
    Capabilities {
        embedder: encoder.clone(),
        features: encoder.clone(),
        speech_tokenizer: encoder,
        text_tokenizer: Arc::new(MockText),
        predictor,
        vocoder,
        watermarker: Arc::new(SpreadSpectrumWatermarker::default()),
    }
}

fn pipeline() -> Pipeline {
    Pipeline::new(
        capabilities(Arc::new(MockPredictor::new(12)), Arc::new(MockVocoder)),
        PipelineConfig::default(),
    )
}

/// `secs` of a slowly varying signal whose level depends on `seed`.
fn recording(secs: f32, seed: f32) -> ReferenceRecording {
    let len = (secs * RATE as f32) as usize;
    let samples = (0..len)
        .map(|i| seed * 0.2 + 0.1 * (i as f32 * 0.001 * (1.0 + seed)).sin())
        .collect();
    ReferenceRecording::new(samples, RATE)
}

fn greedy() -> SamplingConfig {
    SamplingConfig {
        temperature: 0.0,
        cfg_weight: 0.5,
        max_tokens: 40,
        ..SamplingConfig::default()
    }
}

fn tokens_for(
    pipeline: &Pipeline,
    text: &str,
    voice: VoiceRef<'_>,
    sampling: &SamplingConfig,
    seed: u64,
) -> Result<(Vec<TokenId>, Vec<f32>)> {
    let mut tokens = Vec::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let audio = pipeline.synthesize(
        text,
        "en",
        voice,
        sampling,
        &mut rng,
        &CancelFlag::new(),
        &mut |event| match event {
            StreamEvent::Token(t) => tokens.push(t),
        },
    )?;
    Ok((tokens, audio.into_samples()))
}

#[test]
fn greedy_generation_is_deterministic() {
    let pipeline = pipeline();
    let reference = recording(6.0, 0.3);
    let voice = VoiceRef::Recording(&reference);

    let (a_tokens, a_audio) = tokens_for(&pipeline, "Hello there.", voice, &greedy(), 1).unwrap();
    let (b_tokens, b_audio) = tokens_for(&pipeline, "Hello there.", voice, &greedy(), 99).unwrap();
    assert_eq!(a_tokens, b_tokens);
    assert_eq!(a_audio, b_audio);
    assert_eq!(a_tokens.last(), Some(&STOP));
}

#[test]
fn seeded_sampling_is_reproducible() {
    let pipeline = pipeline();
    let reference = recording(6.0, 0.3);
    let voice = VoiceRef::Recording(&reference);
    let sampling = SamplingConfig {
        temperature: 1.5,
        min_p: 0.0,
        max_tokens: 40,
        ..SamplingConfig::default()
    };

    let a = tokens_for(&pipeline, "Hello there.", voice, &sampling, 7).unwrap();
    let b = tokens_for(&pipeline, "Hello there.", voice, &sampling, 7).unwrap();
    assert_eq!(a, b);
}

#[test]
fn every_output_is_watermarked_once() {
    let pipeline = pipeline();
    let reference = recording(6.0, 0.3);
    let detector = SpreadSpectrumWatermarker::default();
    let mut rng = StdRng::seed_from_u64(0);

    let speech = pipeline
        .generate("Hello there.", "en", Some(&reference), &greedy(), &mut rng)
        .unwrap();
    assert!(pipeline
        .watermarker()
        .detect(speech.samples(), speech.sample_rate())
        .unwrap());
    assert!((detector.mark_level(speech.samples()) - 1.0).abs() < 0.3);

    let source = recording(3.0, 0.8);
    let converted = pipeline.convert_voice(&source, Some(&reference)).unwrap();
    assert!(pipeline
        .watermarker()
        .detect(converted.samples(), converted.sample_rate())
        .unwrap());
    assert!((detector.mark_level(converted.samples()) - 1.0).abs() < 0.3);
}

#[test]
fn generation_respects_max_tokens() {
    let pipeline = Pipeline::new(
        capabilities(Arc::new(MockPredictor::new(usize::MAX)), Arc::new(MockVocoder)),
        PipelineConfig::default(),
    );
    let reference = recording(6.0, 0.3);
    for max_tokens in [1, 5, 17] {
        let sampling = SamplingConfig {
            max_tokens,
            ..greedy()
        };
        let (tokens, audio) =
            tokens_for(&pipeline, "Hi.", VoiceRef::Recording(&reference), &sampling, 0).unwrap();
        assert_eq!(tokens.len(), max_tokens);
        assert_eq!(audio.len(), max_tokens * 480);
    }
}

#[test]
fn references_equal_in_first_ten_seconds_condition_identically() {
    let pipeline = pipeline();
    let base = recording(10.0, 0.4);
    let mut long_a = base.samples().to_vec();
    long_a.extend(vec![0.9; RATE as usize * 5]);
    let mut long_b = base.samples().to_vec();
    long_b.extend(vec![-0.5; RATE as usize * 2]);

    let builder = pipeline.conditioning_builder();
    let a = builder
        .build(&ReferenceRecording::new(long_a, RATE), 0.5)
        .unwrap();
    let b = builder
        .build(&ReferenceRecording::new(long_b, RATE), 0.5)
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.speaker_embedding()[1], (10 * RATE) as f32);
}

#[test]
fn zero_guidance_matches_unconditioned_decoding() {
    let reference = recording(6.0, 0.7);
    let inner = Arc::new(MockPredictor::new(15));
    let pipeline = Pipeline::new(
        capabilities(inner.clone(), Arc::new(MockVocoder)),
        PipelineConfig::default(),
    );
    let bundle = pipeline.conditioning_builder().build(&reference, 0.5).unwrap();
    let request = [4, 8, 15, 16, 23, 42];

    let unguided = SamplingConfig {
        cfg_weight: 0.0,
        ..greedy()
    };
    let decode = |decoder: Decoder, sampling: &SamplingConfig| {
        let mut rng = StdRng::seed_from_u64(0);
        decoder
            .decode(&bundle, &request, sampling, &mut rng, &CancelFlag::new())
            .unwrap()
    };

    let guided_off = decode(Decoder::new(inner.clone()), &unguided);
    let omitted = decode(
        Decoder::new(Arc::new(WithoutConditioning(inner.clone()))),
        &greedy(),
    );
    assert_eq!(guided_off.generated(), omitted.generated());

    let conditioned = decode(
        Decoder::new(inner),
        &SamplingConfig {
            cfg_weight: 1.0,
            ..greedy()
        },
    );
    assert_ne!(conditioned.generated(), omitted.generated());
}

#[test]
fn alternating_predictor_with_greedy_decoding() {
    struct Alternating;
    impl TokenPredictor for Alternating {
        fn predict(
            &self,
            _bundle: &ConditioningBundle,
            sequence: &TokenSequence,
            _use_conditioning: bool,
        ) -> Result<Vec<f32>> {
            let mut logits = vec![0.0; VOCAB];
            let favored = if sequence.generated().last() == Some(&7) { 3 } else { 7 };
            logits[favored] = 5.0;
            Ok(logits)
        }
        fn vocab_size(&self) -> usize {
            VOCAB
        }
        fn stop_token(&self) -> TokenId {
            STOP
        }
    }

    let bundle = ConditioningBundle::new(Array1::zeros(2), vec![], Array2::zeros((1, 1)), 0.5);
    let sampling = SamplingConfig {
        temperature: 0.0,
        top_p: 1.0,
        min_p: 0.0,
        repetition_penalty: 1.0,
        cfg_weight: 1.0,
        max_tokens: 5,
        exaggeration: 0.5,
    };
    let mut rng = StdRng::seed_from_u64(0);
    let sequence = Decoder::new(Arc::new(Alternating))
        .decode(&bundle, &[], &sampling, &mut rng, &CancelFlag::new())
        .unwrap();
    assert_eq!(sequence.generated(), &[7, 3, 7, 3, 7]);
    assert_eq!(sequence.stop_reason(), Some(StopReason::MaxLength));
}

#[test]
fn missing_reference_without_default_fails() {
    let pipeline = pipeline();
    let mut rng = StdRng::seed_from_u64(0);
    let err = pipeline
        .generate("Hello.", "en", None, &greedy(), &mut rng)
        .unwrap_err();
    assert!(matches!(err, Error::MissingReference));

    let empty = ReferenceRecording::new(vec![], RATE);
    let err = pipeline
        .generate("Hello.", "en", Some(&empty), &greedy(), &mut rng)
        .unwrap_err();
    assert!(matches!(err, Error::MissingReference));
}

#[test]
fn default_voice_fills_in_for_missing_reference() {
    let pipeline = pipeline();
    let default = recording(6.0, 0.5);
    pipeline.set_default_voice(&default).unwrap();

    let (fallback, _) = tokens_for(&pipeline, "Hello.", VoiceRef::Default, &greedy(), 0).unwrap();
    let (explicit, _) =
        tokens_for(&pipeline, "Hello.", VoiceRef::Recording(&default), &greedy(), 0).unwrap();
    assert_eq!(fallback, explicit);

    let empty = ReferenceRecording::new(vec![], RATE);
    let (from_empty, _) =
        tokens_for(&pipeline, "Hello.", VoiceRef::Recording(&empty), &greedy(), 0).unwrap();
    assert_eq!(from_empty, explicit);
}

#[test]
fn cached_voices() {
    let pipeline = pipeline();
    pipeline.add_voice("narrator", &recording(6.0, 0.2), 0.5).unwrap();
    assert_eq!(pipeline.list_voices(), vec!["narrator"]);

    let cached = pipeline
        .resolve_conditioning(VoiceRef::Cached("narrator"), 0.9)
        .unwrap();
    assert_eq!(cached.exaggeration(), 0.9);
    let again = pipeline
        .resolve_conditioning(VoiceRef::Cached("narrator"), 0.5)
        .unwrap();
    assert_eq!(again.exaggeration(), 0.5);

    assert!(matches!(
        pipeline.resolve_conditioning(VoiceRef::Cached("nobody"), 0.5),
        Err(Error::VoiceNotFound(_))
    ));
    assert!(pipeline.remove_voice("narrator"));
    assert!(pipeline.list_voices().is_empty());
}

#[test]
fn unsupported_language_is_invalid_config() {
    let pipeline = pipeline();
    let reference = recording(6.0, 0.3);
    let mut rng = StdRng::seed_from_u64(0);
    let err = pipeline
        .generate("Bonjour.", "xx", Some(&reference), &greedy(), &mut rng)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));

    let ok = pipeline.generate("Bonjour.", "fr", Some(&reference), &greedy(), &mut rng);
    assert!(ok.is_ok());
}

#[test]
fn vocoder_failure_returns_no_audio() {
    let pipeline = Pipeline::new(
        capabilities(Arc::new(MockPredictor::new(5)), Arc::new(BrokenVocoder)),
        PipelineConfig::default(),
    );
    let reference = recording(6.0, 0.3);
    let mut rng = StdRng::seed_from_u64(0);
    let err = pipeline
        .generate("Hello.", "en", Some(&reference), &greedy(), &mut rng)
        .unwrap_err();
    assert!(matches!(err, Error::Render(_)));

    let err = pipeline
        .convert_voice(&recording(2.0, 0.1), Some(&reference))
        .unwrap_err();
    assert!(matches!(err, Error::Render(_)));
}

#[test]
fn immediate_stop_returns_no_audio() {
    struct StopsAtOnce;
    impl TokenPredictor for StopsAtOnce {
        fn predict(
            &self,
            _bundle: &ConditioningBundle,
            _sequence: &TokenSequence,
            _use_conditioning: bool,
        ) -> Result<Vec<f32>> {
            let mut logits = vec![0.0; VOCAB];
            logits[STOP as usize] = 10.0;
            Ok(logits)
        }
        fn vocab_size(&self) -> usize {
            VOCAB
        }
        fn stop_token(&self) -> TokenId {
            STOP
        }
    }

    let pipeline = Pipeline::new(
        capabilities(Arc::new(StopsAtOnce), Arc::new(MockVocoder)),
        PipelineConfig::default(),
    );
    let reference = recording(6.0, 0.3);
    let mut rng = StdRng::seed_from_u64(0);
    let err = pipeline
        .generate("Hello.", "en", Some(&reference), &greedy(), &mut rng)
        .unwrap_err();
    assert!(matches!(err, Error::Render(_)));
}

#[test]
fn masked_tokens_with_default_guidance() {
    struct Masking(MockPredictor);
    impl TokenPredictor for Masking {
        fn predict(
            &self,
            bundle: &ConditioningBundle,
            sequence: &TokenSequence,
            use_conditioning: bool,
        ) -> Result<Vec<f32>> {
            let mut logits = self.0.predict(bundle, sequence, use_conditioning)?;
            logits[0] = f32::NEG_INFINITY;
            Ok(logits)
        }
        fn vocab_size(&self) -> usize {
            VOCAB
        }
        fn stop_token(&self) -> TokenId {
            STOP
        }
    }

    let pipeline = Pipeline::new(
        capabilities(
            Arc::new(Masking(MockPredictor::new(12))),
            Arc::new(MockVocoder),
        ),
        PipelineConfig::default(),
    );
    let reference = recording(6.0, 0.3);
    for sampling in [greedy(), SamplingConfig::default()] {
        let (tokens, audio) =
            tokens_for(&pipeline, "Hello.", VoiceRef::Recording(&reference), &sampling, 3)
                .unwrap();
        assert!(!tokens.contains(&0));
        assert!(!audio.is_empty());
    }
}

#[test]
fn cancelled_request_stops_predicting() {
    let predictor = Arc::new(MockPredictor::new(usize::MAX));
    let pipeline = Pipeline::new(
        capabilities(predictor.clone(), Arc::new(MockVocoder)),
        PipelineConfig::default(),
    );
    let reference = recording(6.0, 0.3);
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    let mut seen = 0;
    let mut rng = StdRng::seed_from_u64(0);
    let err = pipeline
        .synthesize(
            "Hello.",
            "en",
            VoiceRef::Recording(&reference),
            &SamplingConfig {
                max_tokens: 100,
                ..greedy()
            },
            &mut rng,
            &cancel,
            &mut |_| {
                seen += 1;
                if seen == 3 {
                    flag.cancel();
                }
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    // Two predictor calls per step.
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 6);
}

#[test]
fn chunked_generation_renders_once() {
    let pipeline = pipeline();
    let reference = recording(6.0, 0.3);
    let mut events = Vec::new();
    let mut rng = StdRng::seed_from_u64(0);
    let audio = pipeline
        .synthesize_chunked(
            "First sentence here. Second one. Third and last!",
            "en",
            VoiceRef::Recording(&reference),
            &greedy(),
            20,
            &mut rng,
            &CancelFlag::new(),
            &mut |event| events.push(event),
        )
        .unwrap();

    let started = events
        .iter()
        .filter(|e| matches!(e, ChunkEvent::ChunkStarted { .. }))
        .count();
    assert_eq!(started, 3);
    // 12 speech tokens per chunk, stop token dropped.
    assert_eq!(audio.samples().len(), 3 * 12 * 480);
    let detector = SpreadSpectrumWatermarker::default();
    assert!((detector.mark_level(audio.samples()) - 1.0).abs() < 0.3);
}

#[test]
fn pipeline_is_shareable_across_threads() {
    let pipeline = Arc::new(pipeline());
    let reference = Arc::new(recording(6.0, 0.3));
    let handles: Vec<_> = (0..4)
        .map(|seed| {
            let pipeline = pipeline.clone();
            let reference = reference.clone();
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                pipeline
                    .generate("Hello there.", "en", Some(&reference), &greedy(), &mut rng)
                    .map(|w| w.into_samples())
            })
        })
        .collect();
    let outputs: Vec<Vec<f32>> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));
}
