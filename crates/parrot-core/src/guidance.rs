//! Classifier-free guidance blend.

use crate::{Error, Result};

/// Blend conditioned and unconditioned logits: `u + w * (c - u)`.
///
/// `w = 0` returns `unconditioned` and `w = 1` returns `conditioned`, both bit for bit.
/// Weights outside [0, 1] extrapolate and are not clamped. A token masked with `-inf` by
/// either pass stays masked.
pub fn blend(conditioned: &[f32], unconditioned: &[f32], cfg_weight: f32) -> Result<Vec<f32>> {
    if conditioned.len() != unconditioned.len() {
        return Err(Error::Prediction(format!(
            "conditioned and unconditioned logits differ in length ({} vs {})",
            conditioned.len(),
            unconditioned.len()
        )));
    }

    // The endpoints short-circuit: u + 1 * (c - u) is not always c in floating point.
    if cfg_weight == 0.0 {
        return Ok(unconditioned.to_vec());
    }
    if cfg_weight == 1.0 {
        return Ok(conditioned.to_vec());
    }

    Ok(conditioned
        .iter()
        .zip(unconditioned)
        .map(|(&c, &u)| blend_one(c, u, cfg_weight))
        .collect())
}

fn blend_one(c: f32, u: f32, cfg_weight: f32) -> f32 {
    if c == u {
        u
    } else if c == f32::NEG_INFINITY || u == f32::NEG_INFINITY {
        f32::NEG_INFINITY
    } else {
        u + cfg_weight * (c - u)
    }
}
