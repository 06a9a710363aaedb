//! In-memory pair dataset.
//!
//! Items are one `(M, C, H, W)` tensor of pixel values in `[0, 255]`; pairs
//! reference items by row index. A dataset can be loaded from a cache
//! directory holding `items.safetensors` and a `pairs.json` manifest, or
//! generated synthetically with brightness as the ranked attribute.

use candle_core::{Device, Tensor};
use pairrank_core::{ImagePairBatch, PairDataset, RankerError, Result, TIE_LABEL};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const ITEMS_FILE: &str = "items.safetensors";
const ITEMS_TENSOR: &str = "items";
const MANIFEST_FILE: &str = "pairs.json";

/// One labelled pair of item indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairEntry {
    pub first: usize,
    pub second: usize,
    /// 1 when `first` ranks higher, 0 when `second` does, 0.5 for a tie.
    pub label: f32,
    #[serde(default = "default_mask")]
    pub mask: bool,
}

fn default_mask() -> bool {
    true
}

/// Manifest stored alongside `items.safetensors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairManifest {
    pub name: String,
    pub train: Vec<PairEntry>,
    pub test: Vec<PairEntry>,
}

/// Shape of a synthetic dataset.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSpec {
    pub items: usize,
    pub train_pairs: usize,
    pub test_pairs: usize,
    pub channels: usize,
    /// Side length of the square images.
    pub size: usize,
    /// Fraction of pairs that compare an item with itself.
    pub tie_fraction: f64,
    /// Fraction of pairs whose mask bit is false.
    pub masked_fraction: f64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            items: 64,
            train_pairs: 256,
            test_pairs: 64,
            channels: 3,
            size: 8,
            tie_fraction: 0.1,
            masked_fraction: 0.05,
        }
    }
}

pub struct InMemoryPairDataset {
    name: String,
    items: Tensor,
    train: Vec<PairEntry>,
    test: Vec<PairEntry>,
    seed: u64,
    epoch: u64,
}

impl InMemoryPairDataset {
    /// Build a dataset, checking that every pair references an existing item.
    pub fn new(
        name: impl Into<String>,
        items: Tensor,
        train: Vec<PairEntry>,
        test: Vec<PairEntry>,
        seed: u64,
    ) -> Result<Self> {
        let (count, _, _, _) = items.dims4()?;
        for (split, pairs) in [("train", &train), ("test", &test)] {
            for (i, pair) in pairs.iter().enumerate() {
                if pair.first >= count || pair.second >= count {
                    return Err(RankerError::Dataset(format!(
                        "{split} pair {i} references item ({}, {}) but only {count} items exist",
                        pair.first, pair.second
                    )));
                }
                if !(pair.label == 0.0 || pair.label == TIE_LABEL || pair.label == 1.0) {
                    return Err(RankerError::Dataset(format!(
                        "{split} pair {i} has label {} outside {{0, 0.5, 1}}",
                        pair.label
                    )));
                }
            }
        }
        Ok(Self {
            name: name.into(),
            items,
            train,
            test,
            seed,
            epoch: 0,
        })
    }

    /// Load a dataset cache written by [`InMemoryPairDataset::save`].
    pub fn load(dir: &Path, seed: u64, device: &Device) -> Result<Self> {
        let manifest_str = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        let manifest: PairManifest = serde_json::from_str(&manifest_str)?;
        let items = load_items(&dir.join(ITEMS_FILE), device)?;
        tracing::info!(
            dir = %dir.display(),
            items = items.dim(0)?,
            train_pairs = manifest.train.len(),
            test_pairs = manifest.test.len(),
            "Loaded pair dataset"
        );
        Self::new(manifest.name, items, manifest.train, manifest.test, seed)
    }

    /// Write the items and manifest into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        save_items(&dir.join(ITEMS_FILE), &self.items)?;
        let manifest = PairManifest {
            name: self.name.clone(),
            train: self.train.clone(),
            test: self.test.clone(),
        };
        std::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(())
    }

    /// Random flat-ish images whose mean brightness decides every label.
    pub fn synthetic(spec: SyntheticSpec, seed: u64, device: &Device) -> Result<Self> {
        if spec.items < 2 {
            return Err(RankerError::Dataset(
                "synthetic dataset needs at least 2 items".to_string(),
            ));
        }
        for (what, p) in [
            ("tie_fraction", spec.tie_fraction),
            ("masked_fraction", spec.masked_fraction),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(RankerError::Dataset(format!(
                    "{what} must be in [0, 1], got {p}"
                )));
            }
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let brightness: Vec<f32> = (0..spec.items)
            .map(|_| rng.gen_range(16.0f32..240.0))
            .collect();

        let pixels_per_item = spec.channels * spec.size * spec.size;
        let mut pixels = Vec::with_capacity(spec.items * pixels_per_item);
        for &b in &brightness {
            for _ in 0..pixels_per_item {
                let noise: f32 = rng.gen_range(-12.0..12.0);
                pixels.push((b + noise).clamp(0.0, 255.0));
            }
        }
        let items = Tensor::from_vec(
            pixels,
            (spec.items, spec.channels, spec.size, spec.size),
            device,
        )?;

        let mut sample = |n: usize| -> Vec<PairEntry> {
            (0..n)
                .map(|_| {
                    let first = rng.gen_range(0..spec.items);
                    let mask = !rng.gen_bool(spec.masked_fraction);
                    if rng.gen_bool(spec.tie_fraction) {
                        return PairEntry {
                            first,
                            second: first,
                            label: TIE_LABEL,
                            mask,
                        };
                    }
                    let mut second = rng.gen_range(0..spec.items);
                    while second == first {
                        second = rng.gen_range(0..spec.items);
                    }
                    let label = match brightness[first].partial_cmp(&brightness[second]) {
                        Some(std::cmp::Ordering::Greater) => 1.0,
                        Some(std::cmp::Ordering::Less) => 0.0,
                        _ => TIE_LABEL,
                    };
                    PairEntry {
                        first,
                        second,
                        label,
                        mask,
                    }
                })
                .collect()
        };
        let train = sample(spec.train_pairs);
        let test = sample(spec.test_pairs);

        Self::new("synthetic", items, train, test, seed)
    }

    pub fn train_pairs(&self) -> &[PairEntry] {
        &self.train
    }

    pub fn test_pairs(&self) -> &[PairEntry] {
        &self.test
    }

    pub fn items(&self) -> &Tensor {
        &self.items
    }

    /// Number of training passes requested so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn batch(&self, pairs: &[PairEntry]) -> Result<ImagePairBatch> {
        let device = self.items.device();
        let firsts = item_indices(pairs.iter().map(|p| p.first))?;
        let seconds = item_indices(pairs.iter().map(|p| p.second))?;
        let first = self
            .items
            .index_select(&Tensor::new(firsts.as_slice(), device)?, 0)?;
        let second = self
            .items
            .index_select(&Tensor::new(seconds.as_slice(), device)?, 0)?;
        Ok(ImagePairBatch {
            first,
            second,
            targets: pairs.iter().map(|p| p.label).collect(),
            mask: pairs.iter().map(|p| p.mask).collect(),
        })
    }
}

/// `index_select` takes `u32` indices.
fn item_indices(indices: impl Iterator<Item = usize>) -> Result<Vec<u32>> {
    indices
        .map(|i| {
            u32::try_from(i).map_err(|_| {
                RankerError::Dataset(format!("item index {i} does not fit in a u32 tensor index"))
            })
        })
        .collect()
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(RankerError::Config(
            "batch size must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

impl PairDataset for InMemoryPairDataset {
    type Batch = ImagePairBatch;

    fn name(&self) -> &str {
        &self.name
    }

    fn train_generator(
        &mut self,
        batch_size: usize,
        shuffle: bool,
        cut_tail: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<ImagePairBatch>> + '_>> {
        check_batch_size(batch_size)?;
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        if shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }
        self.epoch += 1;

        let batches = if cut_tail {
            order.len() / batch_size
        } else {
            order.len().div_ceil(batch_size)
        };
        let this: &Self = self;
        Ok(Box::new((0..batches).map(move |b| {
            let end = ((b + 1) * batch_size).min(order.len());
            let pairs: Vec<PairEntry> = order[b * batch_size..end]
                .iter()
                .map(|&i| this.train[i])
                .collect();
            this.batch(&pairs)
        })))
    }

    fn test_generator(
        &self,
        batch_size: usize,
    ) -> Result<Box<dyn Iterator<Item = Result<ImagePairBatch>> + '_>> {
        check_batch_size(batch_size)?;
        Ok(Box::new(
            self.test.chunks(batch_size).map(move |pairs| self.batch(pairs)),
        ))
    }
}

fn load_items(path: &Path, device: &Device) -> Result<Tensor> {
    let data = std::fs::read(path)?;
    let tensors = safetensors::SafeTensors::deserialize(&data)
        .map_err(|e| RankerError::Dataset(format!("Failed to parse {}: {e}", path.display())))?;
    let view = tensors.tensor(ITEMS_TENSOR).map_err(|e| {
        RankerError::Dataset(format!(
            "Tensor '{ITEMS_TENSOR}' not found in {}: {e}",
            path.display()
        ))
    })?;
    if view.dtype() != safetensors::Dtype::F32 || view.shape().len() != 4 {
        return Err(RankerError::Dataset(format!(
            "{} must hold a rank-4 f32 tensor, found {:?} {:?}",
            path.display(),
            view.dtype(),
            view.shape()
        )));
    }

    let shape: Vec<usize> = view.shape().to_vec();
    let values: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::from_vec(values, shape.as_slice(), device)?)
}

fn save_items(path: &Path, items: &Tensor) -> Result<()> {
    let shape = items.dims().to_vec();
    let values: Vec<f32> = items.flatten_all()?.to_vec1()?;
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let view = safetensors::tensor::TensorView::new(safetensors::Dtype::F32, shape, &bytes)
        .map_err(|e| RankerError::Dataset(format!("TensorView create failed: {e}")))?;
    let mut tensors = HashMap::new();
    tensors.insert(ITEMS_TENSOR.to_string(), view);
    let serialized = safetensors::tensor::serialize(&tensors, &None)
        .map_err(|e| RankerError::Dataset(format!("serialize: {e}")))?;
    std::fs::write(path, serialized)?;
    Ok(())
}
