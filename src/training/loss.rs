//! Supervised and pseudo-label losses
//!
//! All losses operate on logits `[batch, classes, height, width]` and integer
//! targets `[batch, height, width]`, reduced to a single-element tensor so
//! they stay on the autodiff graph.

use burn::tensor::{
    activation::{log_softmax, softmax},
    backend::Backend, ElementConversion, Int, Tensor,
};

use crate::config::CriterionConfig;
use crate::utils::error::{Result, SegMixError};

/// Per-pixel negative log-likelihood of `targets`; pixels equal to
/// `ignore_index` get zero loss.
pub fn pixel_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    ignore_index: i64,
) -> Tensor<B, 3> {
    let ignored = targets.clone().equal_elem(ignore_index);
    let safe_targets = targets.mask_fill(ignored.clone(), 0);

    let nll = log_softmax(logits, 1)
        .gather(1, safe_targets.unsqueeze_dim::<4>(1))
        .squeeze::<3>(1)
        .neg();
    nll.mask_fill(ignored, 0.0)
}

fn count<B: Backend>(mask: Tensor<B, 3, Int>) -> f64 {
    mask.sum().into_scalar().elem::<f64>()
}

/// Loss for the labeled batch
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// Mean cross-entropy over non-ignored pixels
    CrossEntropy { ignore_index: i64 },
    /// Cross-entropy restricted to hard pixels: those whose target-class
    /// probability is at most `max(thresh, p_k)`, where `p_k` is the
    /// probability of the `min_kept`-th hardest valid pixel. Falls back to
    /// plain cross-entropy when fewer than `min_kept` pixels are valid.
    OhemCrossEntropy {
        ignore_index: i64,
        thresh: f64,
        min_kept: usize,
    },
}

impl Criterion {
    /// Build from the `criterion` config section (`CELoss` or `OHEM`)
    pub fn from_config(config: &CriterionConfig) -> Result<Self> {
        let kwargs = &config.kwargs;
        match config.name.as_str() {
            "CELoss" => Ok(Self::CrossEntropy {
                ignore_index: kwargs.ignore_index,
            }),
            "OHEM" => Ok(Self::OhemCrossEntropy {
                ignore_index: kwargs.ignore_index,
                thresh: kwargs.thresh,
                min_kept: kwargs.min_kept,
            }),
            other => Err(SegMixError::NotImplemented(format!(
                "{other} criterion is not implemented"
            ))),
        }
    }

    /// Scalar loss `[1]`
    pub fn loss<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        match self {
            Self::CrossEntropy { ignore_index } => {
                let kept = targets.clone().not_equal_elem(*ignore_index);
                mean_over(pixel_cross_entropy(logits, targets, *ignore_index), kept.int())
            }
            Self::OhemCrossEntropy {
                ignore_index,
                thresh,
                min_kept,
            } => {
                let targets = ohem_targets(logits.clone(), targets, *ignore_index, *thresh, *min_kept);
                let kept = targets.clone().not_equal_elem(*ignore_index);
                mean_over(pixel_cross_entropy(logits, targets, *ignore_index), kept.int())
            }
        }
    }
}

fn mean_over<B: Backend>(loss: Tensor<B, 3>, kept: Tensor<B, 3, Int>) -> Tensor<B, 1> {
    let denominator = count(kept).max(1.0);
    loss.sum().div_scalar(denominator)
}

/// Replace easy pixels by `ignore_index`
fn ohem_targets<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    ignore_index: i64,
    thresh: f64,
    min_kept: usize,
) -> Tensor<B, 3, Int> {
    let valid = targets.clone().not_equal_elem(ignore_index);
    let num_valid = count(valid.clone().int()) as usize;
    if num_valid == 0 || min_kept > num_valid {
        return targets;
    }

    // Probability of the target class, 1 on ignored pixels
    let ignored = valid.clone().bool_not();
    let safe_targets = targets.clone().mask_fill(ignored.clone(), 0);
    let target_prob = softmax(logits.detach(), 1)
        .gather(1, safe_targets.unsqueeze_dim::<4>(1))
        .squeeze::<3>(1)
        .mask_fill(ignored, 1.0);

    let mut threshold = thresh;
    if min_kept > 0 {
        let mut probs: Vec<f64> = target_prob
            .clone()
            .into_data()
            .iter::<f64>()
            .collect();
        probs.sort_by(|a, b| a.total_cmp(b));
        let kth = probs[min_kept.min(probs.len()) - 1];
        if kth > thresh {
            threshold = kth;
        }
    }

    let hard = target_prob.lower_equal_elem(threshold).int() * valid.int();
    targets.mask_fill(hard.equal_elem(0), ignore_index)
}

/// Confidence-weighted cross-entropy against pseudo-labels.
///
/// Each pixel contributes `CE * confidence` when its confidence reaches
/// `conf_thresh` and its ignore flag is not `ignore_index`. The sum is
/// divided by the number of pixels whose ignore flag is not `ignore_index`
/// (clamped to 1, so a fully ignored batch yields exactly 0).
pub fn masked_pseudo_label_loss<B: Backend>(
    logits: Tensor<B, 4>,
    classes: Tensor<B, 3, Int>,
    confidence: Tensor<B, 3>,
    ignore_mask: Tensor<B, 3, Int>,
    ignore_index: i64,
    conf_thresh: f64,
) -> Tensor<B, 1> {
    let nll = log_softmax(logits, 1)
        .gather(1, classes.unsqueeze_dim::<4>(1))
        .squeeze::<3>(1)
        .neg();

    let valid = ignore_mask.not_equal_elem(ignore_index).int();
    let gate = confidence.clone().greater_equal_elem(conf_thresh).int() * valid.clone();

    let weighted = nll * confidence * gate.float();
    weighted.sum().div_scalar(count(valid).max(1.0))
}
