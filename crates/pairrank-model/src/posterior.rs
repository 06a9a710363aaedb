//! Frozen pairwise posterior: `sigmoid(estimate_1 - estimate_2)`.
//!
//! The affine map `[+1, -1]` with zero bias is held as plain constant tensors,
//! never as [`candle_core::Var`]s, so no optimizer can ever see it.

use candle_core::{Device, Tensor};
use pairrank_core::{RankerError, Result};

/// Clipping margin applied to probabilities before the log-loss.
pub const EPSILON: f64 = 1.0e-7;

/// Converts pairs of rank estimates into preference probabilities.
pub struct PairwisePosterior {
    weight: Tensor,
    bias: Tensor,
}

impl PairwisePosterior {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Tensor::new(&[[1.0f32], [-1.0]], device)?,
            bias: Tensor::new(&[0.0f32], device)?,
        })
    }

    /// Unclipped probability that the first item of each pair ranks higher.
    ///
    /// `estimates` is the flat `(2N,)` head output; the result is `(N,)`.
    pub fn probabilities(&self, estimates: &Tensor) -> Result<Tensor> {
        let n = estimates.elem_count();
        if n % 2 != 0 {
            return Err(RankerError::InvalidBatch(format!(
                "rank estimates must come in pairs, got {n}"
            )));
        }
        let pairs = estimates.reshape((n / 2, 2))?;
        let logits = pairs.matmul(&self.weight)?.broadcast_add(&self.bias)?;
        Ok(candle_nn::ops::sigmoid(&logits)?.flatten_all()?)
    }

    /// Probabilities clipped into `[EPSILON, 1 - EPSILON]`.
    pub fn forward(&self, estimates: &Tensor) -> Result<Tensor> {
        clip_probabilities(&self.probabilities(estimates)?)
    }

    /// The frozen constants, weight then bias.
    pub fn constants(&self) -> [&Tensor; 2] {
        [&self.weight, &self.bias]
    }
}

/// Clamp probabilities away from exact 0 and 1.
pub fn clip_probabilities(probs: &Tensor) -> Result<Tensor> {
    Ok(probs.clamp(EPSILON, 1.0 - EPSILON)?)
}
