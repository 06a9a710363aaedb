//! The assembled pairwise ranker.
//!
//! Owns the extractor, the trainable head, the frozen posterior, and the
//! merged update rule. One [`PairwiseRanker::train_step`] call runs forward,
//! backward, and the update as a single synchronous unit.

use candle_core::{Device, Tensor};
use pairrank_core::{FeatureExtractor, PairBatch, RankerConfig, Result};
use std::path::Path;

use crate::checkpoint;
use crate::head::RankEstimateHead;
use crate::loss::{assemble_loss, LossTensors, LossValues};
use crate::posterior::PairwisePosterior;
use crate::update::{DualRateUpdate, UpdateRule};

pub struct PairwiseRanker<E: FeatureExtractor> {
    extractor: E,
    head: RankEstimateHead,
    posterior: PairwisePosterior,
    updates: DualRateUpdate,
    weight_decay: f64,
}

impl<E: FeatureExtractor> PairwiseRanker<E> {
    /// Wire up the ranker around `extractor`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid rates, weight decay, or
    /// batch sizes, and propagates extractor binding failures.
    pub fn new(mut extractor: E, config: &RankerConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        extractor.set_input(config.train_batch_size * 2)?;

        let head = RankEstimateHead::new(
            extractor.output_dim(),
            config.ranker_nonlinearity,
            config.random_seed,
            device,
        )?;
        let posterior = PairwisePosterior::new(device)?;

        let extractor_rule = UpdateRule::build(
            config.optimizer,
            extractor.trainable_vars(),
            config.extractor_learning_rate,
        )?;
        let ranker_rule =
            UpdateRule::build(config.optimizer, head.vars(), config.ranker_learning_rate)?;
        let updates = DualRateUpdate::merge(extractor_rule, ranker_rule)?;

        tracing::debug!(
            extractor = extractor.name(),
            extractor_params = updates.extractor().map_or(0, UpdateRule::len),
            ranker_params = updates.ranker().map_or(0, UpdateRule::len),
            "Built pairwise ranker"
        );

        Ok(Self {
            extractor,
            head,
            posterior,
            updates,
            weight_decay: config.weight_decay,
        })
    }

    /// Rank estimates `(items,)` for a batch of items.
    pub fn estimate(&self, data: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.extractor.forward(data, train)?;
        self.head.forward(&features)
    }

    /// Forward pass in training mode, returning the attached loss terms.
    pub fn loss(&self, batch: &PairBatch) -> Result<LossTensors> {
        let estimates = self.estimate(batch.data(), true)?;
        let probs = self.posterior.forward(&estimates)?;
        let targets = Tensor::new(batch.targets(), probs.device())?;
        assemble_loss(&probs, &targets, self.head.l2_penalty()?, self.weight_decay)
    }

    /// Compute the loss on `batch` and apply the merged update.
    pub fn train_step(&mut self, batch: &PairBatch) -> Result<LossValues> {
        let loss = self.loss(batch)?;
        let values = loss.values()?;
        if !self.updates.is_empty() {
            let grads = loss.total.backward()?;
            self.updates.apply(&grads)?;
        }
        Ok(values)
    }

    /// Deterministic rank estimates, one per item.
    pub fn rank_estimates(&self, data: &Tensor) -> Result<Vec<f32>> {
        Ok(self.estimate(data, false)?.to_vec1::<f32>()?)
    }

    /// Save the head parameters to `path`.
    pub fn save_head(&self, path: &Path) -> Result<()> {
        checkpoint::save_params(&self.head.vars(), path)
    }

    /// Restore the head parameters from `path`.
    pub fn load_head(&self, path: &Path) -> Result<()> {
        checkpoint::load_params(&self.head.vars(), path)
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn extractor_mut(&mut self) -> &mut E {
        &mut self.extractor
    }

    pub fn head(&self) -> &RankEstimateHead {
        &self.head
    }

    pub fn posterior(&self) -> &PairwisePosterior {
        &self.posterior
    }

    pub fn updates(&self) -> &DualRateUpdate {
        &self.updates
    }

    pub fn set_extractor_learning_rate(&mut self, lr: f64) -> bool {
        self.updates.set_extractor_learning_rate(lr)
    }

    pub fn set_ranker_learning_rate(&mut self, lr: f64) -> bool {
        self.updates.set_ranker_learning_rate(lr)
    }
}
