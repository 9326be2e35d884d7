//! Dataset module: id lists, augmentation, the semi-supervised splits and
//! their batchers.
//!
//! ## Structure
//!
//! - `ids`: id-list parsing, oversampling and partition rewriting
//! - `augmentation`: joint image/mask geometry, strong views, CutMix boxes
//! - `semi`: the `train_l` / `train_u` / `val` dataset
//! - `batcher`: Burn batchers producing normalised tensors
//! - `loader`: per-epoch shuffling and sharding across workers

pub mod augmentation;
pub mod batcher;
pub mod ids;
pub mod loader;
pub mod semi;

pub use batcher::{LabeledBatch, LabeledBatcher, UnlabeledBatch, UnlabeledBatcher, ValBatch, ValBatcher};
pub use ids::{read_id_list, rewrite_id_file, rewrite_id_line, SampleId};
pub use loader::EpochSampler;
pub use semi::{LabeledItem, SemiDataset, Split, UnlabeledItem, ValItem};
