//! Learning Rate Scheduler Module
//!
//! Polynomial decay over the total number of optimizer steps of a run.

use serde::{Deserialize, Serialize};

/// Default exponent of the polynomial decay
pub const POLY_POWER: f64 = 0.9;

/// Polynomial learning rate decay
///
/// `lr(iters) = base_lr * (1 - iters / total_iters) ^ power`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolyLr {
    pub base_lr: f64,
    pub total_iters: usize,
    pub power: f64,
}

impl PolyLr {
    /// Create a scheduler with the default power of 0.9
    pub fn new(base_lr: f64, total_iters: usize) -> Self {
        Self {
            base_lr,
            total_iters,
            power: POLY_POWER,
        }
    }

    /// Learning rate after `iters` completed steps (clamped at the end of training)
    pub fn lr(&self, iters: usize) -> f64 {
        if self.total_iters == 0 {
            return self.base_lr;
        }
        let progress = (iters as f64 / self.total_iters as f64).min(1.0);
        self.base_lr * (1.0 - progress).powf(self.power)
    }

    /// Learning rate at step `step` of epoch `epoch`
    pub fn lr_at_step(&self, epoch: usize, step: usize, steps_per_epoch: usize) -> f64 {
        self.lr(epoch * steps_per_epoch + step)
    }

    /// Human-readable description
    pub fn description(&self) -> String {
        format!(
            "Poly (base={}, power={}, iters={})",
            self.base_lr, self.power, self.total_iters
        )
    }
}

/// Learning rates of the two parameter groups: `(backbone, head)`
pub fn group_lrs(lr: f64, lr_multi: f64) -> (f64, f64) {
    (lr, lr * lr_multi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poly_endpoints() {
        let scheduler = PolyLr::new(0.01, 1000);
        assert_eq!(scheduler.lr(0), 0.01);
        assert_eq!(scheduler.lr(1000), 0.0);
        assert_eq!(scheduler.lr(5000), 0.0);
    }

    #[test]
    fn test_poly_monotone_decreasing() {
        let scheduler = PolyLr::new(0.005, 240);
        let mut previous = f64::INFINITY;
        for iters in 0..=240 {
            let lr = scheduler.lr(iters);
            assert!(lr < previous);
            previous = lr;
        }
    }

    #[test]
    fn test_poly_formula() {
        let scheduler = PolyLr::new(0.001, 80 * 50);
        let lr = scheduler.lr_at_step(10, 7, 50);
        let expected = 0.001 * (1.0 - 507.0 / 4000.0f64).powf(0.9);
        assert!((lr - expected).abs() < 1e-15);
    }

    #[test]
    fn test_group_lrs() {
        let (backbone, head) = group_lrs(0.002, 10.0);
        assert_eq!(backbone, 0.002);
        assert!((head - 0.02).abs() < 1e-15);
    }
}
