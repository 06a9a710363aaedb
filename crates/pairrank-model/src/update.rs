//! Dual-rate update rule.
//!
//! The extractor and the rank-estimate head each get their own optimizer over
//! their own parameter set. A learning rate of exactly zero means no rule at
//! all: no optimizer is built and no optimizer state is allocated. The two
//! optional rules are merged into one [`DualRateUpdate`] that is applied to a
//! single gradient store per training step.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use pairrank_core::{OptimizerKind, RankerError, Result};
use std::collections::HashSet;

use crate::optim::{ParamsRmsProp, RmsProp};

enum RuleOptimizer {
    RmsProp(RmsProp),
    Sgd(SGD),
    AdamW(AdamW),
}

/// One optimizer over one parameter set.
pub struct UpdateRule {
    optimizer: RuleOptimizer,
    ids: HashSet<TensorId>,
}

impl UpdateRule {
    /// Build a rule over `vars`, or `None` when `learning_rate` is zero.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::Config`] for a negative or non-finite rate.
    pub fn build(kind: OptimizerKind, vars: Vec<Var>, learning_rate: f64) -> Result<Option<Self>> {
        if !learning_rate.is_finite() || learning_rate < 0.0 {
            return Err(RankerError::Config(format!(
                "learning rate must be a finite non-negative number, got {learning_rate}"
            )));
        }
        if learning_rate == 0.0 {
            return Ok(None);
        }

        let ids = vars.iter().map(|v| v.as_tensor().id()).collect();
        let optimizer = match kind {
            OptimizerKind::RmsProp => RuleOptimizer::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr: learning_rate,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => RuleOptimizer::Sgd(SGD::new(vars, learning_rate)?),
            OptimizerKind::AdamW => RuleOptimizer::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    // The loss already carries its own L2 term.
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
        };
        Ok(Some(Self { optimizer, ids }))
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        match &mut self.optimizer {
            RuleOptimizer::RmsProp(opt) => opt.step(grads)?,
            RuleOptimizer::Sgd(opt) => opt.step(grads)?,
            RuleOptimizer::AdamW(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.optimizer {
            RuleOptimizer::RmsProp(opt) => opt.learning_rate(),
            RuleOptimizer::Sgd(opt) => opt.learning_rate(),
            RuleOptimizer::AdamW(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.optimizer {
            RuleOptimizer::RmsProp(opt) => opt.set_learning_rate(lr),
            RuleOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
            RuleOptimizer::AdamW(opt) => opt.set_learning_rate(lr),
        }
    }

    /// Number of parameters this rule updates.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn updates(&self, tensor: &Tensor) -> bool {
        self.ids.contains(&tensor.id())
    }
}

/// Extractor and ranker rules merged into a single update set.
pub struct DualRateUpdate {
    extractor: Option<UpdateRule>,
    ranker: Option<UpdateRule>,
}

impl DualRateUpdate {
    /// Merge two optional rules.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::Config`] if any parameter appears in both rules.
    pub fn merge(extractor: Option<UpdateRule>, ranker: Option<UpdateRule>) -> Result<Self> {
        if let (Some(e), Some(r)) = (&extractor, &ranker) {
            let shared = e.ids.intersection(&r.ids).count();
            if shared > 0 {
                return Err(RankerError::Config(format!(
                    "extractor and ranker parameter sets overlap in {shared} parameter(s)"
                )));
            }
        }
        Ok(Self { extractor, ranker })
    }

    /// Apply every present rule to gradients from one backward pass.
    pub fn apply(&mut self, grads: &GradStore) -> Result<()> {
        if let Some(rule) = self.extractor.as_mut() {
            rule.step(grads)?;
        }
        if let Some(rule) = self.ranker.as_mut() {
            rule.step(grads)?;
        }
        Ok(())
    }

    /// True when neither rule exists.
    pub fn is_empty(&self) -> bool {
        self.extractor.is_none() && self.ranker.is_none()
    }

    pub fn extractor(&self) -> Option<&UpdateRule> {
        self.extractor.as_ref()
    }

    pub fn ranker(&self) -> Option<&UpdateRule> {
        self.ranker.as_ref()
    }

    /// Change the extractor rate. Has no effect when the rule was omitted.
    pub fn set_extractor_learning_rate(&mut self, lr: f64) -> bool {
        set_rate(self.extractor.as_mut(), lr)
    }

    /// Change the ranker rate. Has no effect when the rule was omitted.
    pub fn set_ranker_learning_rate(&mut self, lr: f64) -> bool {
        set_rate(self.ranker.as_mut(), lr)
    }

    /// Whether any rule updates `tensor`.
    pub fn updates(&self, tensor: &Tensor) -> bool {
        self.extractor.as_ref().is_some_and(|r| r.updates(tensor))
            || self.ranker.as_ref().is_some_and(|r| r.updates(tensor))
    }
}

fn set_rate(rule: Option<&mut UpdateRule>, lr: f64) -> bool {
    match rule {
        Some(rule) => {
            rule.set_learning_rate(lr);
            true
        }
        None => false,
    }
}
