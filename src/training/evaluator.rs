//! Mean-IoU evaluation on the validation split
//!
//! Every worker evaluates its shard of the validation ids; intersection and
//! union counts are summed across workers before the IoU is computed, so all
//! ranks return the same result.

use std::fmt;
use std::str::FromStr;

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{backend::Backend, Int, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use crate::config::SemiConfig;
use crate::dataset::loader::{EpochSampler, STREAM_VAL};
use crate::dataset::{SemiDataset, ValBatch, ValBatcher};
use crate::distributed::ProcessGroup;
use crate::model::Segmenter;
use crate::utils::error::{Result, SegMixError};
use crate::utils::metrics::IouAccumulator;
use crate::IGNORE_INDEX;

/// How validation images are fed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Whole image at its original resolution
    Original,
    /// Central `crop_size` window of image and mask
    CenterCrop,
    /// `crop_size` windows with stride `2/3 * crop_size`, softmax scores summed
    SlidingWindow,
}

impl EvalMode {
    /// Mode used after `epoch`: cityscapes switches to sliding windows for the
    /// last 20 epochs, every other dataset is evaluated on original images.
    pub fn for_epoch(dataset: &str, epoch: usize, epochs: usize) -> Self {
        if dataset == "cityscapes" {
            if epoch + 20 < epochs {
                Self::CenterCrop
            } else {
                Self::SlidingWindow
            }
        } else {
            Self::Original
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::CenterCrop => "center_crop",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalMode {
    type Err = SegMixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "original" => Ok(Self::Original),
            "center_crop" => Ok(Self::CenterCrop),
            "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(SegMixError::InvalidInput(format!("unknown eval mode '{other}'"))),
        }
    }
}

/// Aggregated validation result
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// Mean IoU in percent
    pub mean_iou: f64,
    /// IoU per class in percent
    pub per_class_iou: Vec<f64>,
}

/// Arg-max prediction and the matching target for one validation batch
pub fn predict<B: Backend>(
    model: &Segmenter<B>,
    batch: ValBatch<B>,
    mode: EvalMode,
    crop_size: usize,
) -> (Tensor<B, 3, Int>, Tensor<B, 3, Int>) {
    match mode {
        EvalMode::Original => {
            let pred = model.forward(batch.image).argmax(1).squeeze::<3>(1);
            (pred, batch.mask)
        }
        EvalMode::CenterCrop => {
            let [n, c, h, w] = batch.image.dims();
            let (top, rows) = centered(h, crop_size);
            let (left, cols) = centered(w, crop_size);

            let image = batch
                .image
                .slice([0..n, 0..c, top..top + rows, left..left + cols]);
            let mask = batch.mask.slice([0..n, top..top + rows, left..left + cols]);
            let pred = model.forward(image).argmax(1).squeeze::<3>(1);
            (pred, mask)
        }
        EvalMode::SlidingWindow => {
            let pred = sliding_window_scores(model, batch.image, crop_size)
                .argmax(1)
                .squeeze::<3>(1);
            (pred, batch.mask)
        }
    }
}

/// Start and length of a centered window, clamped to the image
fn centered(len: usize, window: usize) -> (usize, usize) {
    let size = window.min(len);
    ((len - size) / 2, size)
}

/// Start offsets of `window`-sized windows along an axis of length `len`.
///
/// Starts step by `stride`; the last window is shifted back to end at the
/// edge so every window keeps the full size when the axis allows it.
fn window_starts(len: usize, window: usize, stride: usize) -> Vec<usize> {
    let last = len.saturating_sub(window);
    let mut starts = Vec::new();
    let mut pos = 0;
    loop {
        let start = pos.min(last);
        starts.push(start);
        if start + window >= len {
            break;
        }
        pos += stride;
    }
    starts
}

/// Summed softmax scores of overlapping `grid`-sized windows
pub fn sliding_window_scores<B: Backend>(
    model: &Segmenter<B>,
    image: Tensor<B, 4>,
    grid: usize,
) -> Tensor<B, 4> {
    let [n, c, h, w] = image.dims();
    let num_classes = model.num_classes();
    let stride = (grid * 2 / 3).max(1);
    let mut scores = Tensor::<B, 4>::zeros([n, num_classes, h, w], &image.device());

    let cols = window_starts(w, grid, stride);
    for row in window_starts(h, grid, stride) {
        let row_end = (row + grid).min(h);
        for &col in &cols {
            let col_end = (col + grid).min(w);
            let window = image
                .clone()
                .slice([0..n, 0..c, row..row_end, col..col_end]);
            let probs = model.forward_softmax(window);

            let region = [0..n, 0..num_classes, row..row_end, col..col_end];
            let current = scores.clone().slice(region.clone());
            scores = scores.slice_assign(region, current + probs);
        }
    }
    scores
}

fn to_i64<B: Backend>(t: Tensor<B, 3, Int>) -> Result<Vec<i64>> {
    t.into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| SegMixError::Training(format!("Failed to read prediction: {e:?}")))
}

/// Evaluate `model` on this worker's shard of `val_set` and all-reduce the
/// counts over `group`.
pub fn evaluate<B: Backend>(
    model: &Segmenter<B>,
    val_set: &SemiDataset,
    mode: EvalMode,
    cfg: &SemiConfig,
    group: &dyn ProcessGroup,
    device: &B::Device,
) -> Result<EvalResult> {
    let sampler = EpochSampler::new(
        val_set.len(),
        group.rank(),
        group.world_size(),
        cfg.seed,
        STREAM_VAL,
    )
    .sequential();
    let indices = sampler.indices(0);

    let progress = if group.is_main() {
        let pb = ProgressBar::new(indices.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} eval [{bar:30.cyan/blue}] {pos}/{len} ({per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let batcher = ValBatcher::<B>::new();
    let mut meter = IouAccumulator::new(cfg.nclass, IGNORE_INDEX);

    for index in indices {
        let item = val_set.get_val(index)?;
        let batch = batcher.batch(vec![item], device);
        let (pred, target) = predict(model, batch, mode, cfg.crop_size);
        meter.add(&to_i64(pred)?, &to_i64(target)?);
        progress.inc(1);
    }
    progress.finish_and_clear();

    let mut flat = meter.to_flat();
    group.all_reduce_sum(&mut flat)?;
    let meter = IouAccumulator::from_flat(&flat, IGNORE_INDEX);

    let result = EvalResult {
        mean_iou: meter.mean_iou(),
        per_class_iou: meter.per_class_iou(),
    };
    debug!("Evaluation ({mode}) on rank {}: mIoU {:.2}", group.rank(), result.mean_iou);
    Ok(result)
}
