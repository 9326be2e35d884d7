//! Confidence-gated pseudo-labels from the EMA teacher
//!
//! The teacher runs on the inner backend, so no gradient can reach it. The
//! primary weak batch and the mix weak batch are concatenated and pushed
//! through the teacher once, then split again.

use burn::tensor::{activation::softmax, backend::Backend, ElementConversion, Int, Tensor};

use crate::model::Segmenter;

/// Per-pixel teacher prediction
#[derive(Clone, Debug)]
pub struct PseudoLabels<B: Backend> {
    /// Arg-max class `[batch, height, width]`
    pub classes: Tensor<B, 3, Int>,
    /// Max softmax probability `[batch, height, width]`
    pub confidence: Tensor<B, 3>,
}

impl<B: Backend> PseudoLabels<B> {
    /// Derive class and confidence from logits `[batch, classes, h, w]`
    pub fn from_logits(logits: Tensor<B, 4>) -> Self {
        let probs = softmax(logits, 1);
        let confidence = probs.clone().max_dim(1).squeeze::<3>(1);
        let classes = probs.argmax(1).squeeze::<3>(1);
        Self {
            classes,
            confidence,
        }
    }

    /// Fraction of pixels whose confidence reaches `threshold`, counted over
    /// the pixels where `ignore_mask` is not the ignore index.
    pub fn mask_ratio(&self, threshold: f64, ignore_mask: Tensor<B, 3, Int>, ignore_index: i64) -> f64 {
        let valid = ignore_mask.not_equal_elem(ignore_index);
        let confident = self.confidence.clone().greater_equal_elem(threshold);
        let kept = confident.int().mul(valid.clone().int());

        let kept: f64 = kept.sum().into_scalar().elem::<f64>();
        let total: f64 = valid.int().sum().into_scalar().elem::<f64>();
        if total > 0.0 {
            kept / total
        } else {
            0.0
        }
    }
}

/// Run the teacher on the weak primary and weak mix batches.
///
/// Returns `(primary, mix)` pseudo-labels.
pub fn generate_pseudo_labels<B: Backend>(
    teacher: &Segmenter<B>,
    weak: Tensor<B, 4>,
    weak_mix: Tensor<B, 4>,
) -> (PseudoLabels<B>, PseudoLabels<B>) {
    let batch = weak.dims()[0];
    let batch_mix = weak_mix.dims()[0];

    let logits = teacher.forward(Tensor::cat(vec![weak, weak_mix], 0));
    let [_, classes, height, width] = logits.dims();

    let primary = logits.clone().slice([0..batch, 0..classes, 0..height, 0..width]);
    let mix = logits.slice([batch..batch + batch_mix, 0..classes, 0..height, 0..width]);

    (PseudoLabels::from_logits(primary), PseudoLabels::from_logits(mix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegmenterConfig;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_from_logits_picks_max() {
        let device = Default::default();
        // 1 image, 2 classes, 1x2 pixels: class 1 wins left, class 0 right
        let logits = Tensor::<TestBackend, 4>::from_floats(
            TensorData::new(vec![0.0f32, 2.0, 1.0, 0.0], [1, 2, 1, 2]),
            &device,
        );
        let labels = PseudoLabels::from_logits(logits);

        let classes: Vec<i64> = labels.classes.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(classes, vec![1, 0]);

        let conf: Vec<f32> = labels.confidence.into_data().to_vec().unwrap();
        let expected = 1.0 / (1.0 + (-1.0f32).exp());
        assert!((conf[0] - expected).abs() < 1e-5);
        assert!((conf[1] - 1.0 / (1.0 + (-2.0f32).exp())).abs() < 1e-5);
    }

    #[test]
    fn test_split_matches_separate_passes() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(3).with_base_filters(2);
        let teacher: Segmenter<TestBackend> = config.init(&device);

        let weak = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &device);
        let weak_mix = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &device);

        let (primary, mix) = generate_pseudo_labels(&teacher, weak.clone(), weak_mix.clone());
        assert_eq!(primary.classes.dims(), [2, 4, 4]);
        assert_eq!(mix.confidence.dims(), [2, 4, 4]);

        // evaluation-mode batch norm makes each sample independent of the batch
        let alone = PseudoLabels::from_logits(teacher.forward(weak_mix));
        let diff: f32 = (alone.confidence - mix.confidence).abs().max().into_scalar();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_mask_ratio_excludes_ignored() {
        let device = Default::default();
        let labels = PseudoLabels::<TestBackend> {
            classes: Tensor::zeros([1, 1, 4], &device),
            confidence: Tensor::from_floats(
                TensorData::new(vec![0.9f32, 0.2, 0.99, 0.3], [1, 1, 4]),
                &device,
            ),
        };
        let ignore = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 0, 255, 255], [1, 1, 4]),
            &device,
        );
        assert!((labels.mask_ratio(0.5, ignore, 255) - 0.5).abs() < 1e-9);
    }
}
