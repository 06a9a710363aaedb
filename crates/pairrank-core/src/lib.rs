//! Core types, traits, and errors for pairrank
//!
//! This crate holds the pieces shared by the model and training crates: the
//! error type, the configuration types, the pair-batch containers, and
//! the collaborator traits (feature extractor, pair dataset, metrics sink)
//! the training loop is written against.

pub mod accuracy;

pub use accuracy::{pairwise_decision, pairwise_decisions, AccuracyTally};

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum RankerError {
    /// Invalid configuration (learning rates, weight decay, batch sizes).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tensor or parameter did not have the shape the consumer expects.
    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// What was being checked (e.g. `"params.0"`, `"extractor output"`).
        what: String,
        /// Expected dimensions.
        expected: Vec<usize>,
        /// Actual dimensions.
        found: Vec<usize>,
    },

    /// A batch violated the pair layout contract.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Accuracy was requested over a pass with no unmasked, non-tied pairs.
    #[error(
        "No eligible pairs for accuracy: saw {seen} pairs ({masked} masked out, {tied} tied)"
    )]
    NoEligiblePairs {
        /// Pairs seen in the pass.
        seen: usize,
        /// Pairs whose mask bit was false.
        masked: usize,
        /// Unmasked pairs with a tie target.
        tied: usize,
    },

    /// Checkpoint archive is missing entries or is otherwise malformed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Dataset cache is missing pieces or references items that do not exist.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Tensor backend failure.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, RankerError>`.
pub type Result<T> = std::result::Result<T, RankerError>;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Gradient-based optimizer used for both update rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// RMSProp with a running average of squared gradients.
    #[default]
    RmsProp,
    /// Plain stochastic gradient descent.
    Sgd,
    /// Adam with decoupled weight decay.
    AdamW,
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RmsProp => write!(f, "rmsprop"),
            Self::Sgd => write!(f, "sgd"),
            Self::AdamW => write!(f, "adamw"),
        }
    }
}

impl std::str::FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rmsprop" => Ok(Self::RmsProp),
            "sgd" => Ok(Self::Sgd),
            "adamw" => Ok(Self::AdamW),
            _ => Err(format!("unknown optimizer: {s}")),
        }
    }
}

/// Activation applied after the rank-estimate head's affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nonlinearity {
    /// Identity.
    #[default]
    Linear,
    Sigmoid,
    Tanh,
    Relu,
}

impl std::fmt::Display for Nonlinearity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Sigmoid => write!(f, "sigmoid"),
            Self::Tanh => write!(f, "tanh"),
            Self::Relu => write!(f, "relu"),
        }
    }
}

impl std::str::FromStr for Nonlinearity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::Relu),
            _ => Err(format!("unknown nonlinearity: {s}")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Log file. `None` writes to stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Ranker hyper-parameters and run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Pairs per training batch.
    pub train_batch_size: usize,
    /// Pairs per evaluation batch.
    pub test_batch_size: usize,
    /// Learning rate of the extractor update rule. `0.0` disables the rule.
    pub extractor_learning_rate: f64,
    /// Learning rate of the ranker update rule. `0.0` disables the rule.
    pub ranker_learning_rate: f64,
    /// Multiplier of the L2 penalty on the rank-estimate head.
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub ranker_nonlinearity: Nonlinearity,
    /// Seed for head initialization and dataset shuffling.
    pub random_seed: u64,
    /// Directory for checkpoints saved without an explicit path.
    pub model_root: PathBuf,
    /// Emit per-batch and per-epoch timing logs.
    pub debug: bool,
    pub logging: LoggingConfig,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            train_batch_size: 16,
            test_batch_size: 32,
            extractor_learning_rate: 1e-4,
            ranker_learning_rate: 1e-4,
            weight_decay: 1e-5,
            optimizer: OptimizerKind::default(),
            ranker_nonlinearity: Nonlinearity::default(),
            random_seed: 42,
            model_root: PathBuf::from("models"),
            debug: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl RankerConfig {
    /// Reject settings that would produce degenerate training.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::Config`] for negative or non-finite learning
    /// rates or weight decay, and for zero batch sizes.
    pub fn validate(&self) -> Result<()> {
        check_rate("extractor_learning_rate", self.extractor_learning_rate)?;
        check_rate("ranker_learning_rate", self.ranker_learning_rate)?;
        check_rate("weight_decay", self.weight_decay)?;
        if self.train_batch_size == 0 {
            return Err(RankerError::Config(
                "train_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.test_batch_size == 0 {
            return Err(RankerError::Config(
                "test_batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_rate(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(RankerError::Config(format!(
            "{name} must be a finite non-negative number, got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pair batches
// ---------------------------------------------------------------------------

/// Target label for "no preference".
pub const TIE_LABEL: f32 = 0.5;

/// A preprocessed batch of pairs.
///
/// Items are interleaved: row `2k` is the first item of pair `k`, row
/// `2k + 1` the second.
#[derive(Debug, Clone)]
pub struct PairBatch {
    data: Tensor,
    targets: Vec<f32>,
    mask: Vec<bool>,
}

impl PairBatch {
    /// Build a batch, checking the pair layout.
    ///
    /// # Errors
    ///
    /// Returns [`RankerError::InvalidBatch`] if the item count is odd, does
    /// not match the number of targets, the mask length differs from the
    /// target length, or a target is not one of `0`, `0.5`, `1`.
    pub fn new(data: Tensor, targets: Vec<f32>, mask: Vec<bool>) -> Result<Self> {
        let items = data.dims().first().copied().unwrap_or(0);
        if items % 2 != 0 {
            return Err(RankerError::InvalidBatch(format!(
                "item count must be even, got {items}"
            )));
        }
        if items / 2 != targets.len() {
            return Err(RankerError::InvalidBatch(format!(
                "{items} items need {} targets, got {}",
                items / 2,
                targets.len()
            )));
        }
        if mask.len() != targets.len() {
            return Err(RankerError::InvalidBatch(format!(
                "mask has {} entries for {} targets",
                mask.len(),
                targets.len()
            )));
        }
        if let Some(bad) = targets.iter().find(|t| !is_valid_target(**t)) {
            return Err(RankerError::InvalidBatch(format!(
                "target {bad} is not one of 0, 0.5, 1"
            )));
        }
        Ok(Self {
            data,
            targets,
            mask,
        })
    }

    /// Item tensor of shape `(2 * pairs, ...)`.
    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn targets(&self) -> &[f32] {
        &self.targets
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn is_valid_target(t: f32) -> bool {
    t == 0.0 || t == TIE_LABEL || t == 1.0
}

/// Raw image pairs as produced by a dataset, before preprocessing.
///
/// `first` and `second` are `(pairs, channels, height, width)` tensors of
/// pixel values in `[0, 255]`.
#[derive(Debug, Clone)]
pub struct ImagePairBatch {
    pub first: Tensor,
    pub second: Tensor,
    pub targets: Vec<f32>,
    pub mask: Vec<bool>,
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// The network that turns raw items into feature vectors.
///
/// The ranker never looks inside the extractor: it only feeds it batches,
/// reads its flattened output, and hands its variables to an optimizer.
pub trait FeatureExtractor {
    /// Raw batch type accepted by [`FeatureExtractor::preprocess`].
    type Input;

    /// Architecture name, used in the model identity string.
    fn name(&self) -> &str;

    /// Bind the extractor to a batch size (in items).
    fn set_input(&mut self, batch_size: usize) -> Result<()>;

    /// Width of the flattened feature vector produced per item.
    fn output_dim(&self) -> usize;

    /// Run the network. With `train == false` stochastic layers are disabled.
    fn forward(&self, data: &Tensor, train: bool) -> Result<Tensor>;

    /// The extractor's trainable parameter set.
    fn trainable_vars(&self) -> Vec<Var>;

    /// Turn a raw batch into model-ready data, targets, and mask.
    fn preprocess(&self, raw: Self::Input) -> Result<PairBatch>;
}

/// Source of pair batches.
///
/// Every call returns a fresh, finite, single-pass iterator.
pub trait PairDataset {
    type Batch;

    /// Dataset name, used in the model identity string.
    fn name(&self) -> &str;

    /// Training batches of `batch_size` pairs. With `cut_tail` an incomplete
    /// final batch is dropped.
    fn train_generator(
        &mut self,
        batch_size: usize,
        shuffle: bool,
        cut_tail: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<Self::Batch>> + '_>>;

    /// Evaluation batches of `batch_size` pairs, in dataset order.
    fn test_generator(
        &self,
        batch_size: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<Self::Batch>> + '_>>;
}

/// Fire-and-forget sink for scalar training metrics.
pub trait MetricsSink {
    fn post(&mut self, name: &str, value: f64, step: u64);
}

// ---------------------------------------------------------------------------
// Model identity
// ---------------------------------------------------------------------------

/// Deterministic name of a training run.
///
/// Used as the metrics channel and as the stem of checkpoint files.
pub fn model_identity(extractor: &str, dataset: &str, config: &RankerConfig) -> String {
    format!(
        "e:{}-d:{}-bs:{}-elr:{:.6}-rlr:{:.6}-opt:{}-rnl:{}-wd:{:.6}-rs:{}",
        extractor,
        dataset,
        config.train_batch_size,
        config.extractor_learning_rate,
        config.ranker_learning_rate,
        config.optimizer,
        config.ranker_nonlinearity,
        config.weight_decay,
        config.random_seed,
    )
}

/// Default checkpoint path for `identity` at training step `step`.
pub fn checkpoint_path(model_root: &Path, identity: &str, step: u64) -> PathBuf {
    model_root.join(format!("{identity}-iter:{step}.safetensors"))
}

/// Step counter encoded in a checkpoint name written by [`checkpoint_path`].
///
/// Returns `None` when the file name carries no `-iter:<step>` suffix.
pub fn checkpoint_step(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".safetensors").unwrap_or(name);
    let (_, step) = stem.rsplit_once("-iter:")?;
    step.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn items(n: usize) -> Tensor {
        Tensor::zeros((n, 3), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = RankerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.train_batch_size, 16);
        assert_eq!(cfg.test_batch_size, 32);
        assert_eq!(cfg.optimizer, OptimizerKind::RmsProp);
        assert_eq!(cfg.ranker_nonlinearity, Nonlinearity::Linear);
    }

    #[test]
    fn test_negative_learning_rate_rejected() {
        let cfg = RankerConfig {
            ranker_learning_rate: -1e-3,
            ..RankerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, RankerError::Config(_)));
        assert!(err.to_string().contains("ranker_learning_rate"));
    }

    #[test]
    fn test_nan_weight_decay_rejected() {
        let cfg = RankerConfig {
            weight_decay: f64::NAN,
            ..RankerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let cfg = RankerConfig {
            train_batch_size: 0,
            ..RankerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_learning_rates_are_valid() {
        let cfg = RankerConfig {
            extractor_learning_rate: 0.0,
            ranker_learning_rate: 0.0,
            ..RankerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_optimizer_from_str() {
        assert_eq!("RMSProp".parse::<OptimizerKind>(), Ok(OptimizerKind::RmsProp));
        assert_eq!("adamw".parse::<OptimizerKind>(), Ok(OptimizerKind::AdamW));
        assert!("lbfgs".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_pair_batch_accepts_valid_layout() {
        let batch = PairBatch::new(items(4), vec![1.0, 0.5], vec![true, false]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.targets(), &[1.0, 0.5]);
        assert_eq!(batch.mask(), &[true, false]);
    }

    #[test]
    fn test_pair_batch_rejects_odd_items() {
        let err = PairBatch::new(items(3), vec![1.0], vec![true]).unwrap_err();
        assert!(matches!(err, RankerError::InvalidBatch(_)));
    }

    #[test]
    fn test_pair_batch_rejects_target_count_mismatch() {
        assert!(PairBatch::new(items(4), vec![1.0], vec![true]).is_err());
    }

    #[test]
    fn test_pair_batch_rejects_mask_mismatch() {
        assert!(PairBatch::new(items(4), vec![1.0, 0.0], vec![true]).is_err());
    }

    #[test]
    fn test_pair_batch_rejects_out_of_range_target() {
        let err = PairBatch::new(items(2), vec![0.7], vec![true]).unwrap_err();
        assert!(err.to_string().contains("0.7"));
    }

    #[test]
    fn test_model_identity_format() {
        let cfg = RankerConfig::default();
        let id = model_identity("ConvExtractor", "synthetic", &cfg);
        assert_eq!(
            id,
            "e:ConvExtractor-d:synthetic-bs:16-elr:0.000100-rlr:0.000100-opt:rmsprop-rnl:linear-wd:0.000010-rs:42"
        );
    }

    #[test]
    fn test_checkpoint_path_appends_step() {
        let path = checkpoint_path(Path::new("/tmp/models"), "run", 7);
        assert_eq!(path, PathBuf::from("/tmp/models/run-iter:7.safetensors"));
    }

    #[test]
    fn test_checkpoint_step_reads_suffix() {
        let id = model_identity("ConvExtractor", "synthetic", &RankerConfig::default());
        let path = checkpoint_path(Path::new("models"), &id, 1234);
        assert_eq!(checkpoint_step(&path), Some(1234));
        assert_eq!(checkpoint_step(Path::new("head.safetensors")), None);
        assert_eq!(checkpoint_step(Path::new("run-iter:x.safetensors")), None);
    }

    #[test]
    fn test_no_eligible_pairs_message() {
        let err = RankerError::NoEligiblePairs {
            seen: 4,
            masked: 1,
            tied: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("4 pairs"));
        assert!(msg.contains("3 tied"));
    }
}
