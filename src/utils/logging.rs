//! Logging Module
//!
//! Structured logging built on the `tracing` crate. Only the coordinating
//! worker (rank 0) logs training progress; the other workers are limited to
//! warnings and errors so that data-parallel runs produce a single log stream.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Create a verbose logging config for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Create a quiet logging config (warnings only)
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Warn,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }

    /// Pick the config for a training run.
    ///
    /// In-process workers share one subscriber, so thread ids are switched on
    /// when there is more than one. Per-rank gating is left to [`TrainingLogger`].
    pub fn for_workers(world_size: usize, verbose: bool) -> Self {
        let mut config = if verbose { Self::verbose() } else { Self::default() };
        if world_size > 1 {
            config.include_thread_ids = true;
        }
        config
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
        }
    }
}

/// Initialize logging with the given configuration
///
/// # Returns
/// * `Result<(), String>` - Ok if logging was initialized, Err with message otherwise
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Per-epoch progress logger for the training loop.
///
/// Silent on every rank except 0.
pub struct TrainingLogger {
    rank: usize,
    total_epochs: usize,
    steps_per_epoch: usize,
    epoch: usize,
    epoch_start: std::time::Instant,
    training_start: std::time::Instant,
}

impl TrainingLogger {
    /// Create a new training logger
    pub fn new(rank: usize, total_epochs: usize, steps_per_epoch: usize) -> Self {
        Self {
            rank,
            total_epochs,
            steps_per_epoch,
            epoch: 0,
            epoch_start: std::time::Instant::now(),
            training_start: std::time::Instant::now(),
        }
    }

    /// Steps between two progress lines: eight lines per epoch.
    pub fn log_interval(&self) -> usize {
        (self.steps_per_epoch / 8).max(1)
    }

    /// Whether step `step` of the epoch should produce a progress line
    pub fn should_log_step(&self, step: usize) -> bool {
        self.rank == 0 && step % self.log_interval() == 0
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize, lr: f64, previous_best: f64) {
        self.epoch = epoch;
        self.epoch_start = std::time::Instant::now();

        if self.rank == 0 {
            tracing::info!(
                "===========> Epoch: {}/{}, LR: {:.5}, Previous best: {:.2}",
                epoch,
                self.total_epochs,
                lr,
                previous_best
            );
        }
    }

    /// Log running means in the middle of an epoch
    pub fn log_step(
        &self,
        step: usize,
        total: f64,
        loss_x: f64,
        loss_s: f64,
        loss_w_fp: f64,
        mask_ratio: f64,
    ) {
        if !self.should_log_step(step) {
            return;
        }
        tracing::info!(
            "Iters: {}/{}, Total loss: {:.3}, Loss x: {:.3}, Loss s: {:.3}, Loss w_fp: {:.3}, Mask ratio: {:.3}",
            step,
            self.steps_per_epoch,
            total,
            loss_x,
            loss_s,
            loss_w_fp,
            mask_ratio
        );
    }

    /// Log the evaluation result at the end of an epoch
    pub fn end_epoch(&self, eval_mode: &str, mean_iou: f64, per_class_iou: &[f64]) {
        if self.rank != 0 {
            return;
        }

        for (class_idx, iou) in per_class_iou.iter().enumerate() {
            tracing::debug!(
                "***** Evaluation ***** >>>> Class [{}] IoU: {:.2}",
                class_idx,
                iou
            );
        }

        let epoch_time = self.epoch_start.elapsed();
        let total_time = self.training_start.elapsed();
        let epochs_remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg_epoch_time = total_time.as_secs_f64() / (self.epoch + 1) as f64;

        tracing::info!(
            "***** Evaluation {} ***** >>>> MeanIoU: {:.2} | epoch {} in {} | ETA: {}",
            eval_mode,
            mean_iou,
            self.epoch,
            super::format_duration(epoch_time.as_secs_f64()),
            super::format_duration(epochs_remaining as f64 * avg_epoch_time)
        );
    }

    /// Log a new best checkpoint
    pub fn log_new_best(&self, previous: f64, current: f64) {
        if self.rank == 0 {
            tracing::info!("New best mIoU: {:.2} -> {:.2}", previous, current);
        }
    }

    /// Log training completion
    pub fn log_complete(&self, best_miou: f64) {
        if self.rank == 0 {
            tracing::info!(
                "Training complete! {} epochs in {} | Best mIoU: {:.2}",
                self.total_epochs,
                super::format_duration(self.training_start.elapsed().as_secs_f64()),
                best_miou
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_log_config() {
        assert_eq!(LogConfig::for_workers(1, false).level, LogLevel::Info);
        assert_eq!(LogConfig::for_workers(1, true).level, LogLevel::Debug);
        assert!(!LogConfig::for_workers(1, true).include_thread_ids);
        assert!(LogConfig::for_workers(4, false).include_thread_ids);
    }

    #[test]
    fn test_log_interval() {
        let logger = TrainingLogger::new(0, 80, 100);
        assert_eq!(logger.log_interval(), 12);
        assert!(logger.should_log_step(0));
        assert!(logger.should_log_step(24));
        assert!(!logger.should_log_step(25));

        // Fewer than eight steps still logs every step
        let short = TrainingLogger::new(0, 1, 3);
        assert_eq!(short.log_interval(), 1);

        let other_rank = TrainingLogger::new(1, 80, 100);
        assert!(!other_rank.should_log_step(0));
    }
}
