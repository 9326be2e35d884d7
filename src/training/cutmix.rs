//! CutMix composition of strong views and pseudo-labels
//!
//! Wherever the box is 1 the pixel (and its pseudo-label, confidence and
//! ignore flag) comes from the mix sample, elsewhere from the primary one.

use burn::tensor::{backend::Backend, Int, Tensor};

use super::pseudo_label::PseudoLabels;

/// Blend two image batches under a `[batch, h, w]` box
pub fn cutmix_images<B: Backend>(
    images: Tensor<B, 4>,
    mix_images: Tensor<B, 4>,
    cutmix_box: Tensor<B, 3, Int>,
) -> Tensor<B, 4> {
    let [_, channels, _, _] = images.dims();
    let mask = cutmix_box
        .equal_elem(1)
        .unsqueeze_dim::<4>(1)
        .repeat_dim(1, channels);
    images.mask_where(mask, mix_images)
}

/// Blend a per-pixel integer map (pseudo-label classes, ignore mask)
pub fn cutmix_map<B: Backend>(
    map: Tensor<B, 3, Int>,
    mix_map: Tensor<B, 3, Int>,
    cutmix_box: Tensor<B, 3, Int>,
) -> Tensor<B, 3, Int> {
    map.mask_where(cutmix_box.equal_elem(1), mix_map)
}

/// Blend a per-pixel float map (confidence)
pub fn cutmix_confidence<B: Backend>(
    conf: Tensor<B, 3>,
    mix_conf: Tensor<B, 3>,
    cutmix_box: Tensor<B, 3, Int>,
) -> Tensor<B, 3> {
    conf.mask_where(cutmix_box.equal_elem(1), mix_conf)
}

/// Composite pseudo-labels, confidence and ignore mask of the primary and
/// mix samples under one box
pub fn cutmix_targets<B: Backend>(
    labels: &PseudoLabels<B>,
    ignore_mask: Tensor<B, 3, Int>,
    mix_labels: &PseudoLabels<B>,
    mix_ignore_mask: Tensor<B, 3, Int>,
    cutmix_box: Tensor<B, 3, Int>,
) -> (PseudoLabels<B>, Tensor<B, 3, Int>) {
    let mixed = PseudoLabels {
        classes: cutmix_map(labels.classes.clone(), mix_labels.classes.clone(), cutmix_box.clone()),
        confidence: cutmix_confidence(
            labels.confidence.clone(),
            mix_labels.confidence.clone(),
            cutmix_box.clone(),
        ),
    };
    let ignore = cutmix_map(ignore_mask, mix_ignore_mask, cutmix_box);
    (mixed, ignore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_empty_box_is_identity() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);
        let b = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        let cutmix_box = Tensor::<TestBackend, 3, Int>::zeros([2, 4, 4], &device);

        let mixed = cutmix_images(a, b, cutmix_box);
        let total: f32 = mixed.sum().into_scalar();
        assert_eq!(total, 96.0);
    }

    #[test]
    fn test_full_box_replaces_everything() {
        let device = Default::default();
        let classes = Tensor::<TestBackend, 3, Int>::zeros([1, 2, 2], &device);
        let mix_classes = Tensor::<TestBackend, 3, Int>::ones([1, 2, 2], &device);
        let cutmix_box = Tensor::<TestBackend, 3, Int>::ones([1, 2, 2], &device);

        let mixed: Vec<i64> = cutmix_map(classes, mix_classes, cutmix_box)
            .into_data()
            .convert::<i64>()
            .to_vec()
            .unwrap();
        assert_eq!(mixed, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_partial_box_mixes_all_channels() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::zeros([1, 2, 1, 2], &device);
        let b = Tensor::<TestBackend, 4>::ones([1, 2, 1, 2], &device);
        let cutmix_box = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![0i64, 1], [1, 1, 2]),
            &device,
        );
        let mixed: Vec<f32> = cutmix_images(a, b, cutmix_box.clone())
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(mixed, vec![0.0, 1.0, 0.0, 1.0]);

        let conf = Tensor::<TestBackend, 3>::full([1, 1, 2], 0.3, &device);
        let mix_conf = Tensor::<TestBackend, 3>::full([1, 1, 2], 0.8, &device);
        let mixed: Vec<f32> = cutmix_confidence(conf, mix_conf, cutmix_box)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(mixed, vec![0.3, 0.8]);
    }

    #[test]
    fn test_targets_follow_the_box() {
        let device = Default::default();
        let labels = PseudoLabels::<TestBackend> {
            classes: Tensor::zeros([1, 1, 2], &device),
            confidence: Tensor::full([1, 1, 2], 0.4, &device),
        };
        let mix = PseudoLabels::<TestBackend> {
            classes: Tensor::full([1, 1, 2], 3, &device),
            confidence: Tensor::full([1, 1, 2], 0.9, &device),
        };
        let ignore = Tensor::<TestBackend, 3, Int>::zeros([1, 1, 2], &device);
        let mix_ignore = Tensor::<TestBackend, 3, Int>::full([1, 1, 2], 255, &device);
        let cutmix_box = Tensor::<TestBackend, 3, Int>::from_data(
            TensorData::new(vec![1i64, 0], [1, 1, 2]),
            &device,
        );

        let (mixed, ignore) = cutmix_targets(&labels, ignore, &mix, mix_ignore, cutmix_box);
        let classes: Vec<i64> = mixed.classes.into_data().convert::<i64>().to_vec().unwrap();
        let ignore: Vec<i64> = ignore.into_data().convert::<i64>().to_vec().unwrap();
        let conf: Vec<f32> = mixed.confidence.into_data().to_vec().unwrap();
        assert_eq!(classes, vec![3, 0]);
        assert_eq!(ignore, vec![255, 0]);
        assert_eq!(conf, vec![0.9, 0.4]);
    }
}
