//! Training module for semi-supervised segmentation
//!
//! This module provides:
//! - The EMA teacher and its confidence-gated pseudo-labels
//! - CutMix composition of strong views and targets
//! - Supervised and pseudo-label losses
//! - Poly learning rate scheduling
//! - Mean-IoU evaluation and best-checkpoint retention
//! - The training loop driving all of the above
//!
//! ## Semi-Supervised Learning Approach
//!
//! Every step combines one labeled batch with two unlabeled batches:
//! 1. The teacher labels the weak views of both unlabeled batches
//! 2. Boxes of the second batch are pasted into the strong views of the first
//! 3. The student learns from ground truth, from the composited pseudo-labels
//!    and from the plain pseudo-labels under feature perturbation
//! 4. The teacher follows the student by exponential moving average

pub mod checkpoint;
pub mod cutmix;
pub mod ema;
pub mod evaluator;
pub mod loss;
pub mod pseudo_label;
pub mod scheduler;
pub mod step;
pub mod trainer;

// Re-export main types for convenience
pub use checkpoint::CheckpointKeeper;
pub use ema::EmaTeacher;
pub use evaluator::{evaluate, EvalMode, EvalResult};
pub use loss::Criterion;
pub use pseudo_label::{generate_pseudo_labels, PseudoLabels};
pub use scheduler::PolyLr;
pub use step::{StepConfig, StepLosses};
pub use trainer::{build_student, TrainingContext, TrainingData};
