//! Metrics for segmentation training and evaluation
//!
//! - Running averages of the per-step loss terms
//! - Per-class intersection / union accumulation and mean IoU

use serde::{Deserialize, Serialize};

/// Running average for tracking a scalar during an epoch
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    /// Create a new running average
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Get the current average
    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    /// Get the count
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Epoch-scoped accumulators for the training loop.
///
/// Created at the start of every epoch, fed once per step, read for logging
/// and dropped when the epoch ends.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    pub total_loss: RunningAverage,
    pub loss_x: RunningAverage,
    /// Mean of the two strong-stream losses
    pub loss_s: RunningAverage,
    pub loss_w_fp: RunningAverage,
    pub mask_ratio: RunningAverage,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one training step
    pub fn record(
        &mut self,
        total: f64,
        loss_x: f64,
        loss_u_s1: f64,
        loss_u_s2: f64,
        loss_w_fp: f64,
        mask_ratio: f64,
    ) {
        self.total_loss.add(total);
        self.loss_x.add(loss_x);
        self.loss_s.add((loss_u_s1 + loss_u_s2) / 2.0);
        self.loss_w_fp.add(loss_w_fp);
        self.mask_ratio.add(mask_ratio);
    }

    pub fn steps(&self) -> usize {
        self.total_loss.count()
    }
}

/// Per-class intersection and union counts.
///
/// Pixels whose target equals the ignore index are skipped entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IouAccumulator {
    pub intersection: Vec<f64>,
    pub union: Vec<f64>,
    ignore_index: i64,
}

impl IouAccumulator {
    pub fn new(num_classes: usize, ignore_index: i64) -> Self {
        Self {
            intersection: vec![0.0; num_classes],
            union: vec![0.0; num_classes],
            ignore_index,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.intersection.len()
    }

    /// Add one prediction / target pair of equal length
    pub fn add(&mut self, predictions: &[i64], targets: &[i64]) {
        let num_classes = self.num_classes() as i64;
        let mut inter = vec![0.0; self.num_classes()];
        let mut pred_area = vec![0.0; self.num_classes()];
        let mut target_area = vec![0.0; self.num_classes()];

        for (&pred, &target) in predictions.iter().zip(targets.iter()) {
            if target == self.ignore_index || target < 0 || target >= num_classes {
                continue;
            }
            target_area[target as usize] += 1.0;
            if pred >= 0 && pred < num_classes {
                pred_area[pred as usize] += 1.0;
                if pred == target {
                    inter[target as usize] += 1.0;
                }
            }
        }

        for c in 0..self.num_classes() {
            self.intersection[c] += inter[c];
            self.union[c] += pred_area[c] + target_area[c] - inter[c];
        }
    }

    /// Flatten into `[intersection.., union..]` for an all-reduce
    pub fn to_flat(&self) -> Vec<f64> {
        self.intersection
            .iter()
            .chain(self.union.iter())
            .copied()
            .collect()
    }

    /// Rebuild from the all-reduced flat buffer
    pub fn from_flat(flat: &[f64], ignore_index: i64) -> Self {
        let num_classes = flat.len() / 2;
        Self {
            intersection: flat[..num_classes].to_vec(),
            union: flat[num_classes..].to_vec(),
            ignore_index,
        }
    }

    /// IoU per class in percent
    pub fn per_class_iou(&self) -> Vec<f64> {
        self.intersection
            .iter()
            .zip(self.union.iter())
            .map(|(&i, &u)| 100.0 * i / (u + 1e-10))
            .collect()
    }

    /// Mean IoU in percent
    pub fn mean_iou(&self) -> f64 {
        let ious = self.per_class_iou();
        if ious.is_empty() {
            return 0.0;
        }
        ious.iter().sum::<f64>() / ious.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut avg = RunningAverage::new();
        assert_eq!(avg.average(), 0.0);
        avg.add(1.0);
        avg.add(3.0);
        assert!((avg.average() - 2.0).abs() < 1e-12);
        assert_eq!(avg.count(), 2);
    }

    #[test]
    fn test_epoch_accumulator_averages_strong_losses() {
        let mut acc = EpochAccumulator::new();
        acc.record(1.0, 0.5, 0.2, 0.4, 0.1, 0.9);
        acc.record(3.0, 1.5, 0.4, 0.6, 0.3, 0.7);
        assert_eq!(acc.steps(), 2);
        assert!((acc.total_loss.average() - 2.0).abs() < 1e-12);
        assert!((acc.loss_s.average() - 0.4).abs() < 1e-12);
        assert!((acc.mask_ratio.average() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_iou_perfect_prediction() {
        let mut iou = IouAccumulator::new(2, 255);
        iou.add(&[0, 0, 1, 1], &[0, 0, 1, 1]);
        assert!((iou.mean_iou() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_skips_ignored_pixels() {
        let mut iou = IouAccumulator::new(2, 255);
        // The wrong prediction sits on an ignored pixel
        iou.add(&[0, 1, 1, 0], &[0, 1, 1, 255]);
        assert!((iou.mean_iou() - 100.0).abs() < 1e-6);
        assert_eq!(iou.union, vec![1.0, 2.0]);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let mut iou = IouAccumulator::new(2, 255);
        // class 0: pred {0,1}, target {0} -> I=1 U=2
        // class 1: pred {2,3}, target {1,2,3} -> I=2 U=3
        iou.add(&[0, 0, 1, 1], &[0, 1, 1, 1]);
        let per_class = iou.per_class_iou();
        assert!((per_class[0] - 50.0).abs() < 1e-6);
        assert!((per_class[1] - 200.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_round_trip_keeps_counts() {
        let mut iou = IouAccumulator::new(3, 255);
        iou.add(&[0, 1, 2], &[0, 1, 1]);
        let rebuilt = IouAccumulator::from_flat(&iou.to_flat(), 255);
        assert_eq!(rebuilt, iou);
    }

    #[test]
    fn test_flat_counts_stay_exact_beyond_f32() {
        // 2^24 + 1 pixels is not representable as f32
        let mut iou = IouAccumulator::new(1, 255);
        iou.intersection[0] = 16_777_217.0;
        iou.union[0] = 16_777_219.0;
        let rebuilt = IouAccumulator::from_flat(&iou.to_flat(), 255);
        assert_eq!(rebuilt.intersection[0], 16_777_217.0);
        assert_eq!(rebuilt.union[0], 16_777_219.0);
    }
}
