//! Loss assembly: mean binary cross-entropy plus weighted L2 penalty.

use candle_core::Tensor;
use pairrank_core::{RankerError, Result};

/// Scalar loss tensors, still attached to the graph.
pub struct LossTensors {
    /// `xent + weight_decay * l2`; the tensor that gets backpropagated.
    pub total: Tensor,
    pub xent: Tensor,
    pub l2: Tensor,
}

/// Loss terms read back from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub total: f32,
    pub xent: f32,
    pub l2: f32,
}

impl LossTensors {
    pub fn values(&self) -> Result<LossValues> {
        Ok(LossValues {
            total: self.total.to_scalar::<f32>()?,
            xent: self.xent.to_scalar::<f32>()?,
            l2: self.l2.to_scalar::<f32>()?,
        })
    }
}

/// Elementwise `-(t·ln p + (1 - t)·ln(1 - p))`.
///
/// `probs` must already be clipped away from 0 and 1.
pub fn binary_cross_entropy(probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if probs.dims() != targets.dims() {
        return Err(RankerError::ShapeMismatch {
            what: "loss targets".to_string(),
            expected: probs.dims().to_vec(),
            found: targets.dims().to_vec(),
        });
    }
    let pos = targets.mul(&probs.log()?)?;
    let neg = targets
        .affine(-1.0, 1.0)?
        .mul(&probs.affine(-1.0, 1.0)?.log()?)?;
    Ok(pos.add(&neg)?.neg()?)
}

/// Combine the classification loss with the head's L2 penalty.
pub fn assemble_loss(
    probs: &Tensor,
    targets: &Tensor,
    l2: Tensor,
    weight_decay: f64,
) -> Result<LossTensors> {
    let xent = binary_cross_entropy(probs, targets)?.mean_all()?;
    let total = xent.add(&l2.affine(weight_decay, 0.0)?)?;
    Ok(LossTensors { total, xent, l2 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_bce_known_values() {
        let device = Device::Cpu;
        let p = Tensor::new(&[0.5f32, 0.9, 0.9], &device).unwrap();
        let t = Tensor::new(&[1.0f32, 1.0, 0.0], &device).unwrap();
        let out: Vec<f32> = binary_cross_entropy(&p, &t).unwrap().to_vec1().unwrap();
        assert!((out[0] - 0.5f32.ln().abs()).abs() < 1e-6);
        assert!((out[1] - 0.9f32.ln().abs()).abs() < 1e-6);
        assert!((out[2] - 0.1f32.ln().abs()).abs() < 1e-5);
    }

    #[test]
    fn test_tie_target_minimized_at_half() {
        let device = Device::Cpu;
        let t = Tensor::new(&[0.5f32], &device).unwrap();
        let at_half = binary_cross_entropy(&Tensor::new(&[0.5f32], &device).unwrap(), &t)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        let off = binary_cross_entropy(&Tensor::new(&[0.7f32], &device).unwrap(), &t)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()[0];
        assert!(at_half < off);
    }

    #[test]
    fn test_total_is_xent_plus_weighted_l2() {
        let device = Device::Cpu;
        let p = Tensor::new(&[0.3f32, 0.8], &device).unwrap();
        let t = Tensor::new(&[0.0f32, 1.0], &device).unwrap();
        let l2 = Tensor::new(2.5f32, &device).unwrap();
        let v = assemble_loss(&p, &t, l2, 0.1).unwrap().values().unwrap();
        assert!((v.total - (v.xent + 0.1 * v.l2)).abs() < 1e-6);
        assert!((v.l2 - 2.5).abs() < 1e-6);
        assert!(v.xent > 0.0);
    }

    #[test]
    fn test_target_shape_mismatch() {
        let device = Device::Cpu;
        let p = Tensor::new(&[0.3f32, 0.8], &device).unwrap();
        let t = Tensor::new(&[1.0f32], &device).unwrap();
        assert!(binary_cross_entropy(&p, &t).is_err());
    }
}
