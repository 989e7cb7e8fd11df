//! Guided autoregressive decoding of speech tokens.

use crate::capabilities::{TokenId, TokenPredictor};
use crate::conditioning::ConditioningBundle;
use crate::config::SamplingConfig;
use crate::guidance::blend;
use crate::sampling::{apply_repetition_penalty, argmax, TokenDistribution};
use crate::{Error, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Why decoding ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The predictor produced its stop token
    Eos,
    /// `max_tokens` tokens were generated
    MaxLength,
}

/// Decoder state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Start,
    Decoding { step: usize },
    Stopped(StopReason),
}

/// Events emitted while decoding.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A speech token was generated
    Token(TokenId),
}

/// Shared flag for abandoning a request between decode steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Context prefix (prompt tokens then request tokens) followed by generated tokens.
///
/// Append-only. Only generated tokens count toward `max_tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    tokens: Vec<TokenId>,
    prefix_len: usize,
    prompt_len: usize,
    stop_reason: Option<StopReason>,
}

impl TokenSequence {
    pub fn new(prompt_tokens: &[TokenId], request_tokens: &[TokenId]) -> Self {
        let mut tokens = Vec::with_capacity(prompt_tokens.len() + request_tokens.len());
        tokens.extend_from_slice(prompt_tokens);
        tokens.extend_from_slice(request_tokens);
        Self {
            prefix_len: tokens.len(),
            prompt_len: prompt_tokens.len(),
            tokens,
            stop_reason: None,
        }
    }

    /// Every token, prefix included.
    pub fn as_slice(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.tokens[..self.prompt_len]
    }

    pub fn request_tokens(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len..self.prefix_len]
    }

    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prefix_len..]
    }

    /// Generated tokens with a trailing stop token removed.
    pub fn speech_tokens(&self) -> &[TokenId] {
        let generated = self.generated();
        match self.stop_reason {
            Some(StopReason::Eos) => &generated[..generated.len().saturating_sub(1)],
            _ => generated,
        }
    }

    /// Number of generated tokens.
    pub fn len(&self) -> usize {
        self.tokens.len() - self.prefix_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn is_finished(&self) -> bool {
        self.stop_reason.is_some()
    }

    fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }
}

/// Drives a [`TokenPredictor`] token by token under guidance and sampling filters.
#[derive(Clone)]
pub struct Decoder {
    predictor: Arc<dyn TokenPredictor>,
}

impl Decoder {
    pub fn new(predictor: Arc<dyn TokenPredictor>) -> Self {
        Self { predictor }
    }

    /// Generate speech tokens until the stop token or `max_tokens`.
    pub fn decode<R: Rng + ?Sized>(
        &self,
        bundle: &ConditioningBundle,
        request_tokens: &[TokenId],
        sampling: &SamplingConfig,
        rng: &mut R,
        cancel: &CancelFlag,
    ) -> Result<TokenSequence> {
        self.decode_streaming(bundle, request_tokens, sampling, rng, cancel, &mut |_| {})
    }

    /// Like [`decode`](Self::decode), reporting each token as it is appended.
    pub fn decode_streaming<R, F>(
        &self,
        bundle: &ConditioningBundle,
        request_tokens: &[TokenId],
        sampling: &SamplingConfig,
        rng: &mut R,
        cancel: &CancelFlag,
        callback: &mut F,
    ) -> Result<TokenSequence>
    where
        R: Rng + ?Sized,
        F: FnMut(StreamEvent),
    {
        sampling.validate()?;

        let stop_token = self.predictor.stop_token();
        let mut sequence = TokenSequence::new(bundle.prompt_tokens(), request_tokens);
        let mut state = DecodeState::Start;

        loop {
            let step = match state {
                DecodeState::Start => 0,
                DecodeState::Decoding { step } => step,
                DecodeState::Stopped(reason) => {
                    sequence.stop_reason = Some(reason);
                    break;
                }
            };
            cancel.check()?;

            let next = self.step(bundle, &sequence, sampling, rng)?;
            sequence.push(next);
            callback(StreamEvent::Token(next));
            trace!(step, token = next, "decoded token");

            let step = step + 1;
            state = if next == stop_token {
                DecodeState::Stopped(StopReason::Eos)
            } else if step >= sampling.max_tokens {
                DecodeState::Stopped(StopReason::MaxLength)
            } else {
                DecodeState::Decoding { step }
            };
        }

        debug!(
            tokens = sequence.len(),
            stop = ?sequence.stop_reason(),
            "decoding finished"
        );
        Ok(sequence)
    }

    fn step<R: Rng + ?Sized>(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        sampling: &SamplingConfig,
        rng: &mut R,
    ) -> Result<TokenId> {
        let conditioned = self.predict_checked(bundle, sequence, true)?;
        let unconditioned = self.predict_checked(bundle, sequence, false)?;

        let mut logits = blend(&conditioned, &unconditioned, sampling.cfg_weight)?;
        if logits.iter().any(|l| l.is_nan()) {
            return Err(Error::Prediction(
                "guidance produced NaN logits".to_string(),
            ));
        }
        apply_repetition_penalty(&mut logits, sequence.generated(), sampling.repetition_penalty);

        if sampling.is_greedy() {
            return argmax(&logits)
                .ok_or_else(|| Error::Prediction("empty logit vector".to_string()));
        }

        TokenDistribution::from_logits(&logits, sampling.temperature)?
            .filter(sampling.top_p, sampling.min_p)?
            .sample(rng)
    }

    fn predict_checked(
        &self,
        bundle: &ConditioningBundle,
        sequence: &TokenSequence,
        use_conditioning: bool,
    ) -> Result<Vec<f32>> {
        let logits = self
            .predictor
            .predict(bundle, sequence, use_conditioning)
            .map_err(|e| match e {
                Error::Prediction(_) | Error::Cancelled => e,
                other => Error::Prediction(other.to_string()),
            })?;

        let expected = self.predictor.vocab_size();
        if logits.len() != expected {
            return Err(Error::Prediction(format!(
                "expected {} logits, got {}",
                expected,
                logits.len()
            )));
        }
        if let Some(bad) = logits.iter().find(|l| l.is_nan() || **l == f32::INFINITY) {
            return Err(Error::Prediction(format!("malformed logit {}", bad)));
        }
        Ok(logits)
    }
}
