//! Segmentation model definitions

pub mod segmenter;

pub use segmenter::{Backbone, FeaturePerturbation, SegHead, Segmenter, SegmenterConfig};
