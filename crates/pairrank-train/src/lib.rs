//! Training loop, dataset, metrics sinks, and configuration for pairrank.
//!
//! [`Trainer`] drives a [`pairrank_model::PairwiseRanker`] over a
//! [`pairrank_core::PairDataset`]: shuffled, tail-cut training epochs that
//! post `train_loss`, `train_xent`, and `train_l2pen` per step, deterministic
//! evaluation passes with tie-aware accuracy, and head checkpoints named after
//! the model identity and step counter.

pub mod config;
pub mod dataset;
pub mod logging;
pub mod sink;
pub mod trainer;

pub use config::{load_config, resolve_config, ConfigSource};
pub use dataset::{InMemoryPairDataset, PairEntry, PairManifest, SyntheticSpec};
pub use sink::{JsonlSink, MemorySink, MetricPoint, NullSink, TracingSink};
pub use trainer::Trainer;
