//! Pairwise rank model on candle.
//!
//! A shared feature extractor scores both items of a pair through a trainable
//! [`RankEstimateHead`]. The two rank estimates are turned into a preference
//! probability by the frozen [`PairwisePosterior`], and the whole stack is
//! trained with binary cross-entropy plus an L2 penalty on the head.
//!
//! # Architecture
//!
//! ```text
//! items (2N) → extractor → head → estimates (2N) → reshape (N, 2)
//!            → [+1, -1] · e + 0 → sigmoid → clip(ε, 1-ε) → BCE
//! ```
//!
//! Extractor and head parameters live in disjoint update rules with their own
//! learning rates; see [`update::DualRateUpdate`].

pub mod checkpoint;
pub mod extractor;
pub mod head;
pub mod loss;
pub mod optim;
pub mod posterior;
pub mod ranker;
pub mod update;

pub use extractor::{ConvExtractor, ConvExtractorConfig};
pub use head::RankEstimateHead;
pub use loss::{LossTensors, LossValues};
pub use optim::{ParamsRmsProp, RmsProp};
pub use posterior::{PairwisePosterior, EPSILON};
pub use ranker::PairwiseRanker;
pub use update::{DualRateUpdate, UpdateRule};
