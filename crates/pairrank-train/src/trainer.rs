//! Training and evaluation loop.
//!
//! The trainer owns the ranker, the dataset, the metrics sink, and the step
//! counter. The counter starts at zero (or at the step a resumed run was saved
//! at), advances once per train step, and is never reset. It keys every posted
//! metric and names default checkpoints.

use candle_core::Device;
use pairrank_core::{
    checkpoint_path, model_identity, pairwise_decisions, AccuracyTally, FeatureExtractor,
    MetricsSink, PairBatch, PairDataset, RankerConfig, Result,
};
use pairrank_model::PairwiseRanker;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::sink::NullSink;

pub struct Trainer<E, D>
where
    E: FeatureExtractor,
    D: PairDataset<Batch = E::Input>,
{
    ranker: PairwiseRanker<E>,
    dataset: D,
    sink: Box<dyn MetricsSink>,
    config: RankerConfig,
    identity: String,
    step: u64,
}

impl<E, D> Trainer<E, D>
where
    E: FeatureExtractor,
    D: PairDataset<Batch = E::Input>,
{
    /// Build the ranker around `extractor` and bind it to `dataset`.
    ///
    /// Metrics go nowhere until a sink is attached with
    /// [`Trainer::with_sink`] or [`Trainer::set_sink`].
    pub fn new(extractor: E, dataset: D, config: RankerConfig, device: &Device) -> Result<Self> {
        let identity = model_identity(extractor.name(), dataset.name(), &config);
        let ranker = PairwiseRanker::new(extractor, &config, device)?;
        tracing::info!(
            identity = %identity,
            device = ?device.location(),
            "Initialized trainer"
        );
        Ok(Self {
            ranker,
            dataset,
            sink: Box::new(NullSink),
            config,
            identity,
            step: 0,
        })
    }

    /// Continue counting from `step`, typically the step a loaded checkpoint
    /// was saved at, so metrics and default checkpoint names do not collide
    /// with the earlier run.
    pub fn with_step(mut self, step: u64) -> Self {
        tracing::info!(identity = %self.identity, step, "Resuming step counter");
        self.step = step;
        self
    }

    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn set_sink(&mut self, sink: Box<dyn MetricsSink>) {
        self.sink = sink;
    }

    /// One update on an already preprocessed batch. Returns the total loss.
    pub fn train_step(&mut self, batch: &PairBatch) -> Result<f32> {
        run_step(
            &mut self.ranker,
            self.sink.as_mut(),
            &mut self.step,
            self.config.debug,
            batch,
        )
    }

    /// Drain one shuffled, tail-cut pass over the training pairs.
    ///
    /// Returns the total loss of every batch, in order.
    pub fn train_one_epoch(&mut self) -> Result<Vec<f32>> {
        let started = Instant::now();
        let mut losses = Vec::new();
        let batches = self
            .dataset
            .train_generator(self.config.train_batch_size, true, true)?;
        for raw in batches {
            let batch = self.ranker.extractor().preprocess(raw?)?;
            losses.push(run_step(
                &mut self.ranker,
                self.sink.as_mut(),
                &mut self.step,
                self.config.debug,
                &batch,
            )?);
        }
        if self.config.debug {
            tracing::info!(
                batches = losses.len(),
                step = self.step,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Trained one epoch"
            );
        }
        Ok(losses)
    }

    /// Run `epochs` epochs back to back and return each epoch's mean loss.
    pub fn train_n_epochs(&mut self, epochs: usize) -> Result<Vec<f32>> {
        let mut means = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let losses = self.train_one_epoch()?;
            let mean = if losses.is_empty() {
                tracing::warn!(epoch, "Epoch produced no full batch");
                0.0
            } else {
                losses.iter().sum::<f32>() / losses.len() as f32
            };
            tracing::debug!(epoch, mean_loss = mean, "Epoch finished");
            means.push(mean);
        }
        Ok(means)
    }

    /// One deterministic pass over the test pairs.
    pub fn evaluate(&self) -> Result<AccuracyTally> {
        let started = Instant::now();
        let mut tally = AccuracyTally::new();
        for raw in self.dataset.test_generator(self.config.test_batch_size)? {
            let batch = self.ranker.extractor().preprocess(raw?)?;
            let estimates = self.ranker.rank_estimates(batch.data())?;
            let decisions = pairwise_decisions(&estimates)?;
            tally.update(&decisions, batch.targets(), batch.mask())?;
        }
        if self.config.debug {
            tracing::info!(
                %tally,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Evaluated"
            );
        }
        Ok(tally)
    }

    /// Fraction of eligible test pairs ordered correctly.
    ///
    /// # Errors
    ///
    /// Returns [`pairrank_core::RankerError::NoEligiblePairs`] when every
    /// test pair is masked out or tied.
    pub fn eval_accuracy(&self) -> Result<f64> {
        self.evaluate()?.accuracy()
    }

    /// Save the head. Without a path, writes to the identity-derived path for
    /// the current step under `model_root`.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = self.resolve_path(path);
        self.ranker.save_head(&path)?;
        tracing::info!(path = %path.display(), step = self.step, "Saved checkpoint");
        Ok(path)
    }

    /// Restore the head, with the same path default as [`Trainer::save`].
    pub fn load(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = self.resolve_path(path);
        self.ranker.load_head(&path)?;
        tracing::info!(path = %path.display(), "Loaded checkpoint");
        Ok(path)
    }

    /// Default checkpoint path for the current step.
    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_path(&self.config.model_root, &self.identity, self.step)
    }

    fn resolve_path(&self, path: Option<&Path>) -> PathBuf {
        path.map_or_else(|| self.checkpoint_path(), Path::to_path_buf)
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    pub fn ranker(&self) -> &PairwiseRanker<E> {
        &self.ranker
    }

    pub fn ranker_mut(&mut self) -> &mut PairwiseRanker<E> {
        &mut self.ranker
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }
}

fn run_step<E: FeatureExtractor>(
    ranker: &mut PairwiseRanker<E>,
    sink: &mut dyn MetricsSink,
    step: &mut u64,
    debug: bool,
    batch: &PairBatch,
) -> Result<f32> {
    let started = Instant::now();
    let values = ranker.train_step(batch)?;
    sink.post("train_loss", f64::from(values.total), *step);
    sink.post("train_xent", f64::from(values.xent), *step);
    sink.post("train_l2pen", f64::from(values.l2), *step);
    if debug {
        tracing::debug!(
            step = *step,
            pairs = batch.len(),
            loss = values.total,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Trained batch"
        );
    }
    *step += 1;
    Ok(values.total)
}
