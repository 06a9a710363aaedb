//! RMSProp for candle.
//!
//! ```text
//! acc   = rho * acc + (1 - rho) * g^2
//! param = param - lr * g / sqrt(acc + eps)
//! ```
//!
//! Accumulators are allocated once per variable at construction.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub rho: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            rho: 0.9,
            eps: 1e-6,
        }
    }
}

struct VarRmsProp {
    var: Var,
    acc: Var,
}

pub struct RmsProp {
    vars: Vec<VarRmsProp>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let acc = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarRmsProp { var, acc })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsRmsProp { lr, rho, eps } = self.params;
        for v in &self.vars {
            let Some(g) = grads.get(v.var.as_tensor()) else {
                continue;
            };
            let acc = v
                .acc
                .as_tensor()
                .affine(rho, 0.0)?
                .add(&g.sqr()?.affine(1.0 - rho, 0.0)?)?;
            let delta = g.div(&acc.affine(1.0, eps)?.sqrt()?)?.affine(lr, 0.0)?;
            v.acc.set(&acc)?;
            v.var.set(&v.var.as_tensor().sub(&delta)?)?;
        }
        Ok(())
    }
}

impl RmsProp {
    /// Number of variables carrying accumulator state.
    pub fn state_len(&self) -> usize {
        self.vars.len()
    }

    pub fn params(&self) -> &ParamsRmsProp {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_single_step_matches_formula() {
        let device = Device::Cpu;
        let x = Var::new(&[2.0f32], &device).unwrap();
        let mut opt = RmsProp::new(
            vec![x.clone()],
            ParamsRmsProp {
                lr: 0.1,
                ..Default::default()
            },
        )
        .unwrap();

        // loss = x^2, grad = 2x = 4
        let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();

        let acc = 0.1f32 * 16.0;
        let expected = 2.0 - 0.1 * 4.0 / (acc + 1e-6).sqrt();
        let got = x.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((got - expected).abs() < 1e-5, "got {got}, expected {expected}");
    }

    #[test]
    fn test_minimizes_quadratic() {
        let device = Device::Cpu;
        let x = Var::new(&[3.0f32, -2.0], &device).unwrap();
        let mut opt = RmsProp::new(
            vec![x.clone()],
            ParamsRmsProp {
                lr: 0.05,
                ..Default::default()
            },
        )
        .unwrap();
        for _ in 0..300 {
            let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let v: Vec<f32> = x.as_tensor().to_vec1().unwrap();
        assert!(v.iter().all(|x| x.abs() < 0.2), "not converged: {v:?}");
    }

    #[test]
    fn test_variables_without_gradient_untouched() {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32], &device).unwrap();
        let y = Var::new(&[5.0f32], &device).unwrap();
        let mut opt = RmsProp::new(vec![x.clone(), y.clone()], ParamsRmsProp::default()).unwrap();
        let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        assert_eq!(y.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
    }

    #[test]
    fn test_set_learning_rate() {
        let device = Device::Cpu;
        let x = Var::from_tensor(&Tensor::zeros(3, candle_core::DType::F32, &device).unwrap())
            .unwrap();
        let mut opt = RmsProp::new(vec![x], ParamsRmsProp::default()).unwrap();
        opt.set_learning_rate(0.5);
        assert!((opt.learning_rate() - 0.5).abs() < 1e-12);
        assert_eq!(opt.state_len(), 1);
    }
}
