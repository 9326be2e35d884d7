//! Segmentation network
//!
//! A compact encoder/decoder built with Burn. The encoder ("backbone") is
//! kept separate from the decoder head so that the two can be optimised as
//! distinct parameter groups.
//!
//! Architecture:
//! - stem: conv-bn-relu, full resolution
//! - stage 1: 2x2 max-pool, conv-bn-relu
//! - stage 2: dilated conv-bn-relu (dilation 2)
//! - head: conv-bn-relu, 1x1 classifier, nearest upsample to input size

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        interpolate::{Interpolate2dConfig, InterpolateMode},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Distribution, Tensor},
};

use crate::utils::error::{self, SegMixError};

/// Backbone presets selectable from the run configuration
pub const BACKBONES: [(&str, usize); 3] = [
    ("convnet_tiny", 8),
    ("convnet_small", 16),
    ("convnet_base", 32),
];

/// Configuration for the Segmenter model
#[derive(Config, Debug)]
pub struct SegmenterConfig {
    /// Number of segmentation classes
    #[config(default = "21")]
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Width of the stem; later stages use 2x and 4x
    #[config(default = "16")]
    pub base_filters: usize,
}

impl SegmenterConfig {
    /// Resolve a backbone preset name
    pub fn from_backbone(backbone: &str, num_classes: usize) -> error::Result<Self> {
        let width = BACKBONES
            .iter()
            .find(|(name, _)| *name == backbone)
            .map(|(_, width)| *width)
            .ok_or_else(|| {
                let known: Vec<&str> = BACKBONES.iter().map(|(name, _)| *name).collect();
                SegMixError::Config(format!(
                    "Unknown backbone '{}' (expected one of: {})",
                    backbone,
                    known.join(", ")
                ))
            })?;

        Ok(Self::new()
            .with_num_classes(num_classes)
            .with_base_filters(width))
    }

    /// Build a freshly initialised model
    pub fn init<B: Backend>(&self, device: &B::Device) -> Segmenter<B> {
        Segmenter::new(self, device)
    }
}

/// Strength of the feature perturbation applied between backbone and head
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaturePerturbation {
    /// Probability of zeroing a whole feature channel
    pub channel_drop: f64,
    /// Half-width of the multiplicative uniform noise `1 + U(-n, n)`
    pub noise: f64,
}

impl FeaturePerturbation {
    pub fn new(channel_drop: f64, noise: f64) -> Self {
        Self {
            channel_drop,
            noise,
        }
    }
}

impl From<[f64; 2]> for FeaturePerturbation {
    fn from(fp: [f64; 2]) -> Self {
        Self::new(fp[0], fp[1])
    }
}

/// Conv (no bias) -> BatchNorm -> ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    /// 3x3 block keeping the spatial size for any dilation
    pub fn new(in_channels: usize, out_channels: usize, dilation: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_dilation([dilation, dilation])
            .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Feature encoder (stride 2 output)
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub stem: ConvBlock<B>,
    pub pool: MaxPool2d,
    pub stage1: ConvBlock<B>,
    pub stage2: ConvBlock<B>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(config: &SegmenterConfig, device: &B::Device) -> Self {
        let base = config.base_filters;
        Self {
            stem: ConvBlock::new(config.in_channels, base, 1, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            stage1: ConvBlock::new(base, base * 2, 1, device),
            stage2: ConvBlock::new(base * 2, base * 4, 2, device),
        }
    }

    /// Number of channels of the produced features
    pub fn out_channels(config: &SegmenterConfig) -> usize {
        config.base_filters * 4
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(x);
        let x = self.pool.forward(x);
        let x = self.stage1.forward(x);
        self.stage2.forward(x)
    }
}

/// Decoder head producing per-pixel class logits at feature resolution
#[derive(Module, Debug)]
pub struct SegHead<B: Backend> {
    pub fuse: ConvBlock<B>,
    pub classifier: Conv2d<B>,
}

impl<B: Backend> SegHead<B> {
    pub fn new(in_channels: usize, num_classes: usize, device: &B::Device) -> Self {
        let hidden = (in_channels / 2).max(num_classes);
        Self {
            fuse: ConvBlock::new(in_channels, hidden, 1, device),
            classifier: Conv2dConfig::new([hidden, num_classes], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.fuse.forward(features);
        self.classifier.forward(x)
    }
}

/// Semantic segmentation network.
///
/// The same type serves as student (autodiff backend) and as EMA teacher
/// (inner backend, always in evaluation mode).
#[derive(Module, Debug)]
pub struct Segmenter<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: SegHead<B>,
    num_classes: usize,
}

impl<B: Backend> Segmenter<B> {
    pub fn new(config: &SegmenterConfig, device: &B::Device) -> Self {
        Self {
            backbone: Backbone::new(config, device),
            head: SegHead::new(Backbone::<B>::out_channels(config), config.num_classes, device),
            num_classes: config.num_classes,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Normalised images `[batch, 3, height, width]`
    ///
    /// # Returns
    /// * Logits `[batch, num_classes, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let features = self.backbone.forward(x);
        let logits = self.head.forward(features);
        upsample(logits, height, width)
    }

    /// Forward pass with channel dropout and multiplicative noise applied
    /// to the backbone features of every sample in the batch.
    pub fn forward_perturbed(&self, x: Tensor<B, 4>, fp: FeaturePerturbation) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let features = perturb_features(self.backbone.forward(x), fp);
        let logits = self.head.forward(features);
        upsample(logits, height, width)
    }

    /// Softmax class probabilities
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }

    /// Get the number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

fn upsample<B: Backend>(logits: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = logits.dims();
    if h == height && w == width {
        return logits;
    }
    Interpolate2dConfig::new()
        .with_output_size(Some([height, width]))
        .with_mode(InterpolateMode::Nearest)
        .init()
        .forward(logits)
}

fn perturb_features<B: Backend>(features: Tensor<B, 4>, fp: FeaturePerturbation) -> Tensor<B, 4> {
    let device = features.device();
    let [batch, channels, height, width] = features.dims();
    let mut out = features;

    if fp.channel_drop > 0.0 {
        let keep = 1.0 - fp.channel_drop;
        let mask = Tensor::<B, 4>::random(
            [batch, channels, 1, 1],
            Distribution::Bernoulli(keep),
            &device,
        );
        out = (out * mask).div_scalar(keep);
    }

    if fp.noise > 0.0 {
        let noise = Tensor::<B, 4>::random(
            [batch, channels, height, width],
            Distribution::Uniform(-fp.noise, fp.noise),
            &device,
        );
        out = out * noise.add_scalar(1.0);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_output_matches_input_resolution() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(5).with_base_filters(4);
        let model: Segmenter<TestBackend> = config.init(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 8, 8], &device);
        assert_eq!(model.forward(input).dims(), [2, 5, 8, 8]);

        // Odd sizes lose a row to pooling and get it back on upsample
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 9, 7], &device);
        assert_eq!(model.forward(input).dims(), [1, 5, 9, 7]);
    }

    #[test]
    fn test_perturbed_forward_shape() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(2).with_base_filters(4);
        let model: Segmenter<TestBackend> = config.init(&device);

        let input = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);
        let out = model.forward_perturbed(input, FeaturePerturbation::new(0.5, 0.2));
        assert_eq!(out.dims(), [2, 2, 4, 4]);
    }

    #[test]
    fn test_zero_perturbation_matches_plain_forward() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(3).with_base_filters(4);
        let model: Segmenter<TestBackend> = config.init(&device);

        let input = Tensor::<TestBackend, 4>::random([1, 3, 6, 6], Distribution::Default, &device);
        let plain = model.forward(input.clone());
        let perturbed = model.forward_perturbed(input, FeaturePerturbation::new(0.0, 0.0));

        let diff: f32 = (plain - perturbed).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_backbone_presets() {
        let cfg = SegmenterConfig::from_backbone("convnet_base", 19).unwrap();
        assert_eq!(cfg.base_filters, 32);
        assert_eq!(cfg.num_classes, 19);

        let err = SegmenterConfig::from_backbone("resnet101", 21).unwrap_err();
        assert!(matches!(err, SegMixError::Config(_)));
    }
}
