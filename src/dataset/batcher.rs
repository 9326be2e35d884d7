//! Burn batchers for the three splits
//!
//! Images are normalised with the ImageNet statistics on the target device.

use std::marker::PhantomData;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::dataset::semi::{LabeledItem, UnlabeledItem, ValItem};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Build a normalised `[batch, 3, height, width]` tensor from CHW slices
pub fn image_tensor<B: Backend>(
    data: Vec<f32>,
    batch_size: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(data, [batch_size, 3, height, width]),
        device,
    );

    // (x - mean) / std
    let mean = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_MEAN.to_vec(), [1, 3, 1, 1]), device);
    let std = Tensor::<B, 4>::from_floats(TensorData::new(IMAGENET_STD.to_vec(), [1, 3, 1, 1]), device);

    (images - mean) / std
}

/// Build a `[batch, height, width]` integer map
pub fn map_tensor<B: Backend>(
    data: Vec<i64>,
    batch_size: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 3, Int> {
    Tensor::<B, 3, Int>::from_data(TensorData::new(data, [batch_size, height, width]), device)
}

/// Labeled batch `(img_x, mask_x)`
#[derive(Clone, Debug)]
pub struct LabeledBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub masks: Tensor<B, 3, Int>,
}

/// Unlabeled batch `(weak, strong1, strong2, ignore_mask, cutmix_box1, cutmix_box2)`
#[derive(Clone, Debug)]
pub struct UnlabeledBatch<B: Backend> {
    pub weak: Tensor<B, 4>,
    pub strong1: Tensor<B, 4>,
    pub strong2: Tensor<B, 4>,
    pub ignore_mask: Tensor<B, 3, Int>,
    pub cutmix_box1: Tensor<B, 3, Int>,
    pub cutmix_box2: Tensor<B, 3, Int>,
}

/// Single validation image at original resolution
#[derive(Clone, Debug)]
pub struct ValBatch<B: Backend> {
    pub image: Tensor<B, 4>,
    pub mask: Tensor<B, 3, Int>,
}

#[derive(Clone, Debug, Default)]
pub struct LabeledBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> LabeledBatcher<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, LabeledItem, LabeledBatch<B>> for LabeledBatcher<B> {
    fn batch(&self, items: Vec<LabeledItem>, device: &B::Device) -> LabeledBatch<B> {
        let batch_size = items.len();
        let size = items.first().map(|item| item.size).unwrap_or(0);

        let images: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let masks: Vec<i64> = items.iter().flat_map(|item| item.mask.iter().copied()).collect();

        LabeledBatch {
            images: image_tensor(images, batch_size, size, size, device),
            masks: map_tensor(masks, batch_size, size, size, device),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UnlabeledBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> UnlabeledBatcher<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, UnlabeledItem, UnlabeledBatch<B>> for UnlabeledBatcher<B> {
    fn batch(&self, items: Vec<UnlabeledItem>, device: &B::Device) -> UnlabeledBatch<B> {
        let n = items.len();
        let s = items.first().map(|item| item.size).unwrap_or(0);

        let floats = |f: fn(&UnlabeledItem) -> &Vec<f32>| -> Vec<f32> {
            items.iter().flat_map(|item| f(item).iter().copied()).collect()
        };
        let ints = |f: fn(&UnlabeledItem) -> &Vec<i64>| -> Vec<i64> {
            items.iter().flat_map(|item| f(item).iter().copied()).collect()
        };

        UnlabeledBatch {
            weak: image_tensor(floats(|i| &i.weak), n, s, s, device),
            strong1: image_tensor(floats(|i| &i.strong1), n, s, s, device),
            strong2: image_tensor(floats(|i| &i.strong2), n, s, s, device),
            ignore_mask: map_tensor(ints(|i| &i.ignore_mask), n, s, s, device),
            cutmix_box1: map_tensor(ints(|i| &i.cutmix_box1), n, s, s, device),
            cutmix_box2: map_tensor(ints(|i| &i.cutmix_box2), n, s, s, device),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ValBatcher<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> ValBatcher<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, ValItem, ValBatch<B>> for ValBatcher<B> {
    /// Validation images differ in size, so only the first item is used
    fn batch(&self, items: Vec<ValItem>, device: &B::Device) -> ValBatch<B> {
        let item = items.into_iter().next().unwrap_or(ValItem {
            image: Vec::new(),
            mask: Vec::new(),
            height: 0,
            width: 0,
            name: String::new(),
        });

        ValBatch {
            image: image_tensor(item.image, 1, item.height, item.width, device),
            mask: map_tensor(item.mask, 1, item.height, item.width, device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::ElementConversion;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_labeled_batch_shapes_and_normalisation() {
        let device = Default::default();
        let item = LabeledItem {
            image: vec![0.485; 3 * 4],
            mask: vec![1, 0, 255, 1],
            size: 2,
        };
        let batch: LabeledBatch<TestBackend> =
            LabeledBatcher::new().batch(vec![item.clone(), item], &device);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.masks.dims(), [2, 2, 2]);

        // first channel equals the mean and normalises to zero
        let red: Vec<f32> = batch
            .images
            .slice([0..1, 0..1, 0..2, 0..2])
            .into_data()
            .to_vec()
            .unwrap();
        assert!(red.iter().all(|v| v.abs() < 1e-6));

        let masks: Vec<i64> = batch.masks.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(&masks[..4], &[1, 0, 255, 1]);
    }

    #[test]
    fn test_unlabeled_batch_shapes() {
        let device = Default::default();
        let item = UnlabeledItem {
            weak: vec![0.5; 3 * 9],
            strong1: vec![0.1; 3 * 9],
            strong2: vec![0.9; 3 * 9],
            ignore_mask: vec![0; 9],
            cutmix_box1: vec![1; 9],
            cutmix_box2: vec![0; 9],
            size: 3,
        };
        let batch: UnlabeledBatch<TestBackend> = UnlabeledBatcher::new().batch(vec![item], &device);

        assert_eq!(batch.strong2.dims(), [1, 3, 3, 3]);
        assert_eq!(batch.cutmix_box1.dims(), [1, 3, 3]);
        let total: i64 = batch.cutmix_box1.sum().into_scalar().elem();
        assert_eq!(total, 9);
    }
}
