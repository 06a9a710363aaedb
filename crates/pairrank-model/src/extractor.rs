//! Small convolutional feature extractor.
//!
//! # Architecture
//!
//! ```text
//! Input (C×H×W) → Conv3x3(channels) → ReLU → Conv3x3(channels) → ReLU
//!               → global average pool → [Dropout] → Linear(feature_dim) → ReLU
//! ```
//!
//! Preprocessing scales pixels from `[0, 255]` to `[0, 1]`, subtracts a
//! per-channel mean, and interleaves the two items of every pair.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Linear, Module, VarBuilder, VarMap};
use pairrank_core::{FeatureExtractor, ImagePairBatch, PairBatch, RankerError, Result};
use std::path::Path;

/// Extractor hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvExtractorConfig {
    pub in_channels: usize,
    /// Filters in both convolution layers.
    pub channels: usize,
    /// Width of the output feature vector.
    pub feature_dim: usize,
    /// Dropout before the final linear layer; active only in training.
    pub dropout: f32,
    /// Per-channel mean subtracted after scaling to `[0, 1]`.
    pub channel_mean: Vec<f32>,
}

impl Default for ConvExtractorConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            channels: 16,
            feature_dim: 32,
            dropout: 0.0,
            channel_mean: vec![0.5; 3],
        }
    }
}

pub struct ConvExtractor {
    conv1: Conv2d,
    conv2: Conv2d,
    fc: Linear,
    dropout: Dropout,
    varmap: VarMap,
    mean: Tensor,
    config: ConvExtractorConfig,
    batch_size: usize,
}

impl ConvExtractor {
    /// Create an extractor with randomly initialized weights.
    pub fn new(config: ConvExtractorConfig, device: &Device) -> Result<Self> {
        if config.channel_mean.len() != config.in_channels {
            return Err(RankerError::Config(format!(
                "channel_mean has {} entries for {} input channels",
                config.channel_mean.len(),
                config.in_channels
            )));
        }
        if !(0.0..1.0).contains(&config.dropout) {
            return Err(RankerError::Config(format!(
                "dropout must be in [0, 1), got {}",
                config.dropout
            )));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(
            config.in_channels,
            config.channels,
            3,
            conv_cfg,
            vb.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(config.channels, config.channels, 3, conv_cfg, vb.pp("conv2"))?;
        let fc = candle_nn::linear(config.channels, config.feature_dim, vb.pp("fc"))?;

        let mean = Tensor::from_vec(
            config.channel_mean.clone(),
            (1, config.in_channels, 1, 1),
            device,
        )?;

        Ok(Self {
            conv1,
            conv2,
            fc,
            dropout: Dropout::new(config.dropout),
            varmap,
            mean,
            config,
            batch_size: 0,
        })
    }

    /// Save extractor weights (separate from head checkpoints).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.varmap.save(path)?;
        Ok(())
    }

    /// Restore extractor weights written by [`ConvExtractor::save`].
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    /// Items per forward pass the extractor was bound to.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn config(&self) -> &ConvExtractorConfig {
        &self.config
    }
}

impl FeatureExtractor for ConvExtractor {
    type Input = ImagePairBatch;

    fn name(&self) -> &str {
        "ConvExtractor"
    }

    fn set_input(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 || batch_size % 2 != 0 {
            return Err(RankerError::Config(format!(
                "extractor batch size must be a positive even item count, got {batch_size}"
            )));
        }
        self.batch_size = batch_size;
        Ok(())
    }

    fn output_dim(&self) -> usize {
        self.config.feature_dim
    }

    fn forward(&self, data: &Tensor, train: bool) -> Result<Tensor> {
        let dims = data.dims();
        if dims.len() != 4 || dims[1] != self.config.in_channels {
            return Err(RankerError::ShapeMismatch {
                what: "extractor input".to_string(),
                expected: vec![dims.first().copied().unwrap_or(0), self.config.in_channels],
                found: dims.to_vec(),
            });
        }
        let h = self.conv1.forward(data)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let pooled = h.mean(3)?.mean(2)?;
        let pooled = self.dropout.forward(&pooled, train)?;
        Ok(self.fc.forward(&pooled)?.relu()?)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn preprocess(&self, raw: ImagePairBatch) -> Result<PairBatch> {
        if raw.first.dims() != raw.second.dims() {
            return Err(RankerError::ShapeMismatch {
                what: "second item of pair".to_string(),
                expected: raw.first.dims().to_vec(),
                found: raw.second.dims().to_vec(),
            });
        }
        let (pairs, c, h, w) = raw.first.dims4()?;
        // (pairs, 2, C, H, W) → (2·pairs, C, H, W) keeps item 1 at even rows.
        let items = Tensor::stack(&[&raw.first, &raw.second], 1)?.reshape((pairs * 2, c, h, w))?;
        let data = items
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .broadcast_sub(&self.mean)?;
        PairBatch::new(data, raw.targets, raw.mask)
    }
}
