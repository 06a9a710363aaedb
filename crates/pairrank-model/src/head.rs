//! Rank-estimate head: one scalar score per item.
//!
//! A single dense unit over the extractor's flattened output, followed by the
//! configured nonlinearity (identity by default). Weights use Glorot-uniform
//! initialization drawn from a seeded ChaCha stream, the bias starts at a
//! small positive constant.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module};
use pairrank_core::{Nonlinearity, RankerError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Initial value of the head bias.
pub const INITIAL_BIAS: f32 = 0.1;

/// Trainable head mapping features `(n, in_dim)` to estimates `(n,)`.
pub struct RankEstimateHead {
    weight: Var,
    bias: Var,
    linear: Linear,
    nonlinearity: Nonlinearity,
    in_dim: usize,
}

impl RankEstimateHead {
    /// Create a head over `in_dim` input features.
    ///
    /// Identical `seed` and `in_dim` give identical initial weights.
    pub fn new(
        in_dim: usize,
        nonlinearity: Nonlinearity,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if in_dim == 0 {
            return Err(RankerError::Config(
                "rank-estimate head needs at least one input feature".to_string(),
            ));
        }

        // Glorot uniform with fan_out = 1.
        let bound = (6.0 / (in_dim as f64 + 1.0)).sqrt() as f32;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values: Vec<f32> = (0..in_dim).map(|_| rng.gen_range(-bound..bound)).collect();

        let weight = Var::from_tensor(&Tensor::from_vec(values, (1, in_dim), device)?)?;
        let bias = Var::from_tensor(&Tensor::full(INITIAL_BIAS, 1, device)?)?;
        let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));

        Ok(Self {
            weight,
            bias,
            linear,
            nonlinearity,
            in_dim,
        })
    }

    /// Score every row of `features`.
    ///
    /// Inputs with more than two dimensions are flattened per item first.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::ShapeMismatch`] if the flattened feature width
    /// differs from the head's input width.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let features = if features.rank() > 2 {
            features.flatten_from(1)?
        } else {
            features.clone()
        };
        let dims = features.dims().to_vec();
        if dims.len() != 2 || dims[1] != self.in_dim {
            let rows = dims.first().copied().unwrap_or(0);
            return Err(RankerError::ShapeMismatch {
                what: "extractor output".to_string(),
                expected: vec![rows, self.in_dim],
                found: dims,
            });
        }

        let features = features.to_dtype(DType::F32)?;
        let scores = self.linear.forward(&features)?.flatten_all()?;
        let scores = match self.nonlinearity {
            Nonlinearity::Linear => scores,
            Nonlinearity::Sigmoid => candle_nn::ops::sigmoid(&scores)?,
            Nonlinearity::Tanh => scores.tanh()?,
            Nonlinearity::Relu => scores.relu()?,
        };
        Ok(scores)
    }

    /// Trainable parameters in declaration order: weight, then bias.
    pub fn vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    /// Sum of squared weights. The bias is not regularized.
    pub fn l2_penalty(&self) -> Result<Tensor> {
        Ok(self.weight.as_tensor().sqr()?.sum_all()?)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn nonlinearity(&self) -> Nonlinearity {
        self.nonlinearity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(in_dim: usize) -> RankEstimateHead {
        RankEstimateHead::new(in_dim, Nonlinearity::Linear, 7, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_one_scalar_per_item() {
        let h = head(5);
        let x = Tensor::ones((6, 5), DType::F32, &Device::Cpu).unwrap();
        let out = h.forward(&x).unwrap();
        assert_eq!(out.dims(), &[6]);
    }

    #[test]
    fn test_flattens_spatial_features() {
        let h = head(12);
        let x = Tensor::ones((4, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(h.forward(&x).unwrap().dims(), &[4]);
    }

    #[test]
    fn test_width_mismatch_is_shape_error() {
        let h = head(5);
        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        let err = h.forward(&x).unwrap_err();
        assert!(matches!(err, RankerError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_zero_input_dim_rejected() {
        assert!(RankEstimateHead::new(0, Nonlinearity::Linear, 1, &Device::Cpu).is_err());
    }

    #[test]
    fn test_initialization_is_seeded() {
        let a = head(8).vars()[0].as_tensor().to_vec2::<f32>().unwrap();
        let b = head(8).vars()[0].as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);

        let bound = (6.0_f32 / 9.0).sqrt();
        assert!(a[0].iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn test_bias_starts_positive() {
        let bias = head(3).vars()[1].as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(bias, vec![INITIAL_BIAS]);
    }

    #[test]
    fn test_zero_features_give_bias() {
        let h = head(3);
        let x = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<f32> = h.forward(&x).unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|v| (v - INITIAL_BIAS).abs() < 1e-6));
    }

    #[test]
    fn test_relu_clamps_negative_scores() {
        let h = RankEstimateHead::new(2, Nonlinearity::Relu, 3, &Device::Cpu).unwrap();
        let x = Tensor::new(&[[-100.0f32, -100.0], [100.0, 100.0]], &Device::Cpu).unwrap();
        let out: Vec<f32> = h.forward(&x).unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_l2_penalty_matches_weights() {
        let h = head(4);
        let w: Vec<f32> = h.vars()[0].as_tensor().flatten_all().unwrap().to_vec1().unwrap();
        let expected: f32 = w.iter().map(|v| v * v).sum();
        let l2 = h.l2_penalty().unwrap().to_scalar::<f32>().unwrap();
        assert!((l2 - expected).abs() < 1e-6);
    }
}
