//! Student forward passes and loss assembly for one training step
//!
//! ```text
//! loss = (loss_x + (loss_u_s1 + loss_u_s2 + loss_u_w_fp) / 3) / 2
//! ```

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Int, Tensor,
};

use super::cutmix::{cutmix_images, cutmix_targets};
use super::loss::{masked_pseudo_label_loss, Criterion};
use super::pseudo_label::{generate_pseudo_labels, PseudoLabels};
use crate::dataset::{LabeledBatch, UnlabeledBatch};
use crate::model::{FeaturePerturbation, Segmenter};

/// Fixed per-run settings of the step
#[derive(Debug, Clone, Copy)]
pub struct StepConfig {
    pub conf_thresh: f64,
    pub fp: FeaturePerturbation,
    pub ignore_index: i64,
}

/// Scalar values of one step, read back from the device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    pub total: f64,
    pub loss_x: f64,
    pub loss_u_s1: f64,
    pub loss_u_s2: f64,
    pub loss_u_w_fp: f64,
    pub mask_ratio: f64,
}

impl StepLosses {
    pub fn is_finite(&self) -> bool {
        [self.total, self.loss_x, self.loss_u_s1, self.loss_u_s2, self.loss_u_w_fp]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Differentiable total loss plus its logged parts
pub struct StepOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub losses: StepLosses,
}

/// Combine the four terms with the fixed weights
pub fn combine_losses<B: Backend>(
    loss_x: Tensor<B, 1>,
    loss_u_s1: Tensor<B, 1>,
    loss_u_s2: Tensor<B, 1>,
    loss_u_w_fp: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let third = 1.0 / 3.0;
    (loss_x
        + loss_u_s1.mul_scalar(third)
        + loss_u_s2.mul_scalar(third)
        + loss_u_w_fp.mul_scalar(third))
    .div_scalar(2.0)
}

fn split_batch<B: Backend>(t: Tensor<B, 4>, first: usize) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [n, c, h, w] = t.dims();
    let head = t.clone().slice([0..first, 0..c, 0..h, 0..w]);
    let tail = t.slice([first..n, 0..c, 0..h, 0..w]);
    (head, tail)
}

fn lift_labels<B: AutodiffBackend>(labels: PseudoLabels<B::InnerBackend>) -> PseudoLabels<B> {
    PseudoLabels {
        classes: Tensor::from_inner(labels.classes),
        confidence: Tensor::from_inner(labels.confidence),
    }
}

fn scalar<B: Backend>(t: &Tensor<B, 1>) -> f64 {
    t.clone().into_scalar().elem::<f64>()
}

/// Run the teacher, composite the CutMix views and targets, run both student
/// passes and assemble every loss term.
///
/// `unlabeled` is the primary unlabeled batch and `mix` the independently
/// drawn batch whose content is pasted inside the CutMix boxes.
pub fn compute_step_losses<B: AutodiffBackend>(
    student: &Segmenter<B>,
    teacher: &Segmenter<B::InnerBackend>,
    criterion: &Criterion,
    labeled: LabeledBatch<B>,
    unlabeled: UnlabeledBatch<B>,
    mix: UnlabeledBatch<B>,
    config: &StepConfig,
) -> StepOutput<B> {
    let num_lb = labeled.images.dims()[0];
    let num_ulb = unlabeled.weak.dims()[0];

    // Teacher predictions, no gradient
    let (labels_u, labels_mix) =
        generate_pseudo_labels(teacher, unlabeled.weak.clone().inner(), mix.weak.clone().inner());
    let ignore_inner = unlabeled.ignore_mask.clone().inner();
    let mix_ignore_inner = mix.ignore_mask.clone().inner();

    let mask_ratio = labels_u.mask_ratio(config.conf_thresh, ignore_inner.clone(), config.ignore_index);

    let (targets1, ignore1) = cutmix_targets(
        &labels_u,
        ignore_inner.clone(),
        &labels_mix,
        mix_ignore_inner.clone(),
        unlabeled.cutmix_box1.clone().inner(),
    );
    let (targets2, ignore2) = cutmix_targets(
        &labels_u,
        ignore_inner.clone(),
        &labels_mix,
        mix_ignore_inner,
        unlabeled.cutmix_box2.clone().inner(),
    );
    let targets1 = lift_labels::<B>(targets1);
    let targets2 = lift_labels::<B>(targets2);
    let targets_w = lift_labels::<B>(labels_u);
    let ignore1: Tensor<B, 3, Int> = Tensor::from_inner(ignore1);
    let ignore2: Tensor<B, 3, Int> = Tensor::from_inner(ignore2);

    let img_u_s1 = cutmix_images(unlabeled.strong1, mix.strong1, unlabeled.cutmix_box1);
    let img_u_s2 = cutmix_images(unlabeled.strong2, mix.strong2, unlabeled.cutmix_box2);

    // Pass 1: labeled + strong stream 1
    let preds = student.forward(Tensor::cat(vec![labeled.images, img_u_s1], 0));
    let (pred_x, pred_u_s1) = split_batch(preds, num_lb);

    // Pass 2: weak (feature perturbed) + strong stream 2
    let preds_fp = student.forward_perturbed(Tensor::cat(vec![unlabeled.weak, img_u_s2], 0), config.fp);
    let (pred_u_w_fp, pred_u_s2) = split_batch(preds_fp, num_ulb);

    let loss_x = criterion.loss(pred_x, labeled.masks);
    let loss_u_s1 = masked_pseudo_label_loss(
        pred_u_s1,
        targets1.classes,
        targets1.confidence,
        ignore1,
        config.ignore_index,
        config.conf_thresh,
    );
    let loss_u_s2 = masked_pseudo_label_loss(
        pred_u_s2,
        targets2.classes,
        targets2.confidence,
        ignore2,
        config.ignore_index,
        config.conf_thresh,
    );
    let loss_u_w_fp = masked_pseudo_label_loss(
        pred_u_w_fp,
        targets_w.classes,
        targets_w.confidence,
        unlabeled.ignore_mask,
        config.ignore_index,
        config.conf_thresh,
    );

    let losses = StepLosses {
        total: 0.0,
        loss_x: scalar(&loss_x),
        loss_u_s1: scalar(&loss_u_s1),
        loss_u_s2: scalar(&loss_u_s2),
        loss_u_w_fp: scalar(&loss_u_w_fp),
        mask_ratio,
    };
    let loss = combine_losses(loss_x, loss_u_s1, loss_u_s2, loss_u_w_fp);

    StepOutput {
        losses: StepLosses {
            total: scalar(&loss),
            ..losses
        },
        loss,
    }
}
