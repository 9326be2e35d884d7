//! # SegMix Semi-Supervised Segmentation
//!
//! A Rust library for semi-supervised semantic segmentation using the Burn framework.
//! A small labeled set and a much larger unlabeled set are combined through an
//! EMA teacher, confidence-gated pseudo-labels and CutMix across two unlabeled
//! streams.
//!
//! ## Features
//!
//! - **EMA teacher** producing per-pixel pseudo-labels and confidences
//! - **CutMix** of strong views and targets with independent boxes per stream
//! - **Feature perturbation** consistency on the weak view
//! - **Data parallel** training over a barrier / all-reduce process group
//!
//! ## Modules
//!
//! - `config`: run configuration (YAML or TOML)
//! - `dataset`: id lists, augmentation, splits, batchers and samplers
//! - `model`: segmentation network built with Burn
//! - `training`: teacher, losses, scheduling, evaluation and the training loop
//! - `distributed`: process groups and gradient averaging
//! - `utils`: logging, metrics, event stream and error handling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use segmix_ssl::config::SemiConfig;
//! use segmix_ssl::training::{build_student, TrainingContext, TrainingData};
//!
//! let cfg = SemiConfig::load("configs/pascal.yaml".as_ref())?;
//! let data = TrainingData::load(&cfg, "splits/labeled.txt".as_ref(), "splits/unlabeled.txt".as_ref())?;
//! let student = build_student(&cfg, &device)?;
//! let mut ctx = TrainingContext::new(cfg, student, Box::new(SingleProcess), "exp".as_ref(), device)?;
//! ctx.fit(&data)?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::SemiConfig;
pub use dataset::{SemiDataset, Split};
pub use distributed::{LocalGroup, ProcessGroup, SingleProcess};
pub use model::{Segmenter, SegmenterConfig};
pub use training::{EmaTeacher, TrainingContext, TrainingData};
pub use utils::error::{Result, SegMixError};

/// Label value excluded from every loss and metric
pub const IGNORE_INDEX: i64 = 255;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
