//! Operators for roiflow graphs.
//!
//! - [`OpArrayPiper`]: pass-through.
//! - [`OpValueCache`], [`OpBlockedArrayCache`]: caching whole values and
//!   array blocks.
//! - [`OpLabelArray`]: block-sparse label storage written through a slot.
//! - [`OpHighlightLabel`]: binary mask of one label.
//! - [`OpCarving`], [`OpSplitBodyCarving`]: seeded two-class segmentation.
//! - [`OpPixelClassification`]: per-lane labels, a shared classifier and
//!   per-lane predictions.

mod blocked_cache;
mod carving;
mod classifier;
mod config;
mod highlight;
mod labels;
mod pixel_classification;
mod piper;
mod split_body;
mod value_cache;

pub use blocked_cache::OpBlockedArrayCache;
pub use carving::{OpCarving, BACKGROUND, OBJECT};
pub use classifier::{NearestMeanClassifier, OpTrainClassifier};
pub use config::{CacheConfig, DEFAULT_BLOCK_EXTENT};
pub use highlight::OpHighlightLabel;
pub use labels::{LabelBlockStore, OpLabelArray, LABEL_BLOCK_EXTENT};
pub use pixel_classification::OpPixelClassification;
pub use piper::OpArrayPiper;
pub use split_body::{OpSplitBodyCarving, BLOCK_SIZE};
pub use value_cache::OpValueCache;
