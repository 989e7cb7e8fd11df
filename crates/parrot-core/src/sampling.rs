//! Sampling filter chain: repetition penalty, temperature, min-p and top-p.

use crate::capabilities::TokenId;
use crate::{Error, Result};
use rand::Rng;
use std::collections::HashSet;

/// Penalise every distinct id in `history`: positive logits are divided by `penalty`,
/// negative ones multiplied, so both move toward less likely.
///
/// Ids outside the vocabulary are ignored.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[TokenId], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = HashSet::with_capacity(history.len());
    for &token_id in history {
        let idx = token_id as usize;
        if idx >= logits.len() || !seen.insert(idx) {
            continue;
        }
        let score = logits[idx];
        logits[idx] = if score < 0.0 {
            score * penalty
        } else {
            score / penalty
        };
    }
}

/// Index of the largest logit; the lowest index wins ties.
pub fn argmax(logits: &[f32]) -> Option<TokenId> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        match best {
            Some((_, b)) if value <= b => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx as TokenId)
}

/// Probability distribution over the vocabulary.
///
/// Pruned tokens keep their slot with probability zero so indices stay token ids.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenDistribution {
    probs: Vec<f32>,
}

impl TokenDistribution {
    /// Softmax of `logits / temperature`. `temperature` must be positive.
    pub fn from_logits(logits: &[f32], temperature: f32) -> Result<Self> {
        if !(temperature > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "softmax temperature must be positive, got {}",
                temperature
            )));
        }
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            return Err(Error::Prediction(
                "logits contain no finite maximum".to_string(),
            ));
        }
        let exps: Vec<f32> = logits
            .iter()
            .map(|&l| ((l - max) / temperature).exp())
            .collect();
        let total: f32 = exps.iter().sum();
        Ok(Self {
            probs: exps.into_iter().map(|e| e / total).collect(),
        })
    }

    /// Wrap existing probabilities. Negative or non-finite mass is rejected.
    pub fn from_probs(probs: Vec<f32>) -> Result<Self> {
        if let Some(bad) = probs.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(Error::Prediction(format!(
                "distribution contains invalid probability {}",
                bad
            )));
        }
        Ok(Self { probs })
    }

    pub fn probs(&self) -> &[f32] {
        &self.probs
    }

    /// Number of tokens with non-zero probability.
    pub fn support_size(&self) -> usize {
        self.probs.iter().filter(|&&p| p > 0.0).count()
    }

    /// Run min-p, then top-p, then renormalise.
    pub fn filter(self, top_p: f32, min_p: f32) -> Result<Self> {
        let empty = || Error::EmptyDistribution { min_p, top_p };

        let mut probs = self.probs;
        let max = probs.iter().copied().fold(0.0f32, f32::max);
        let floor = min_p * max;
        for p in probs.iter_mut() {
            if *p < floor {
                *p = 0.0;
            }
        }
        if max <= 0.0 || probs.iter().all(|&p| p <= 0.0) {
            return Err(empty());
        }

        if top_p < 1.0 {
            let total: f32 = probs.iter().sum();
            let mut order: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] > 0.0).collect();
            order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]).then(a.cmp(&b)));

            let target = top_p * total;
            let mut cumulative = 0.0f32;
            let mut keep = order.len();
            for (rank, &idx) in order.iter().enumerate() {
                cumulative += probs[idx];
                if cumulative >= target {
                    keep = rank + 1;
                    break;
                }
            }
            for &idx in &order[keep..] {
                probs[idx] = 0.0;
            }
        }

        let total: f32 = probs.iter().sum();
        if !(total > 0.0) {
            return Err(empty());
        }
        for p in probs.iter_mut() {
            *p /= total;
        }
        Ok(Self { probs })
    }

    /// Draw one token id by inverse-CDF sampling.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<TokenId> {
        let total: f32 = self.probs.iter().sum();
        if !(total > 0.0) {
            return Err(Error::EmptyDistribution {
                min_p: 0.0,
                top_p: 1.0,
            });
        }
        let target = rng.gen::<f32>() * total;
        let mut cumulative = 0.0f32;
        let mut last = 0;
        for (idx, &p) in self.probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            cumulative += p;
            last = idx;
            if target < cumulative {
                return Ok(idx as TokenId);
            }
        }
        // Rounding left target just past the final bucket.
        Ok(last as TokenId)
    }
}
