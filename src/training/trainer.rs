//! Semi-supervised training loop
//!
//! [`TrainingContext`] owns everything that changes during a run: the
//! student and its optimizer, the EMA teacher, the learning rate, the best
//! checkpoint and the metric event stream. One step:
//!
//! 1. teacher pseudo-labels for the weak primary and mix batches
//! 2. CutMix composites of both strong streams and their targets
//! 3. two student passes and the combined loss
//! 4. EMA update of the teacher from the current student
//! 5. barrier, backward, gradient all-reduce
//! 6. optimizer step for the backbone (`lr`) and the head (`lr * lr_multi`),
//!    then batch-norm running statistics averaged across workers
//! 7. accumulators and the next poly learning rate

use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::checkpoint::{load_checkpoint, CheckpointKeeper};
use super::ema::EmaTeacher;
use super::evaluator::{evaluate, EvalMode, EvalResult};
use super::loss::Criterion;
use super::scheduler::{group_lrs, PolyLr};
use super::step::{compute_step_losses, StepConfig, StepLosses};
use crate::config::SemiConfig;
use crate::dataset::loader::{EpochSampler, STREAM_LABELED, STREAM_UNLABELED, STREAM_UNLABELED_MIX};
use crate::dataset::{
    LabeledBatch, LabeledBatcher, SemiDataset, UnlabeledBatch, UnlabeledBatcher,
};
use crate::distributed::{all_reduce_gradients, all_reduce_running_stats, ProcessGroup};
use crate::model::{Segmenter, SegmenterConfig};
use crate::utils::error::{Result, SegMixError};
use crate::utils::events::EventWriter;
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::EpochAccumulator;
use crate::IGNORE_INDEX;

type StudentOptimizer<B> =
    OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, Segmenter<B>, B>;

/// SGD with momentum and weight decay, shared by both parameter groups
fn build_optimizer<B: AutodiffBackend>(cfg: &SemiConfig) -> StudentOptimizer<B> {
    SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(cfg.momentum)
                .with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay as f32)))
        .init()
}

/// Fresh student for `cfg`, optionally initialised from `weights_path`
pub fn build_student<B: Backend>(cfg: &SemiConfig, device: &B::Device) -> Result<Segmenter<B>> {
    let model = SegmenterConfig::from_backbone(&cfg.backbone, cfg.nclass)?.init(device);
    match &cfg.weights_path {
        Some(path) => {
            info!("Initialising student from {}", path.display());
            load_checkpoint(model, path, device)
        }
        None => Ok(model),
    }
}

/// The three datasets of a run
pub struct TrainingData {
    pub labeled: SemiDataset,
    pub unlabeled: SemiDataset,
    pub val: SemiDataset,
}

impl TrainingData {
    /// Open the splits; the labeled list is oversampled to the size of the
    /// unlabeled list.
    pub fn load(cfg: &SemiConfig, labeled_id_path: &Path, unlabeled_id_path: &Path) -> Result<Self> {
        let unlabeled = SemiDataset::new(
            &cfg.dataset,
            &cfg.data_root,
            "train_u",
            cfg.crop_size,
            unlabeled_id_path,
            None,
        )?;
        let labeled = SemiDataset::new(
            &cfg.dataset,
            &cfg.data_root,
            "train_l",
            cfg.crop_size,
            labeled_id_path,
            Some(unlabeled.len()),
        )?
        .with_num_classes(cfg.nclass);
        let val = SemiDataset::new(
            &cfg.dataset,
            &cfg.data_root,
            "val",
            cfg.crop_size,
            &cfg.val_id_path(),
            None,
        )?
        .with_num_classes(cfg.nclass);

        Ok(Self {
            labeled,
            unlabeled,
            val,
        })
    }
}

/// Load the items of one batch in parallel, each with its own augmentation RNG
fn load_items<T, F>(
    indices: &[usize],
    sampler: &EpochSampler,
    epoch: usize,
    first_position: usize,
    load: F,
) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, &mut ChaCha8Rng) -> Result<T> + Sync,
{
    indices
        .par_iter()
        .enumerate()
        .map(|(offset, &index)| {
            let mut rng = sampler.sample_rng(epoch, first_position + offset);
            load(index, &mut rng)
        })
        .collect()
}

/// Mutable state of a training run on one worker
pub struct TrainingContext<B: AutodiffBackend> {
    cfg: SemiConfig,
    student: Segmenter<B>,
    optimizer: StudentOptimizer<B>,
    teacher: EmaTeacher<B>,
    criterion: Criterion,
    step_config: StepConfig,
    lr: f64,
    checkpoints: CheckpointKeeper,
    events: Option<EventWriter>,
    group: Box<dyn ProcessGroup>,
    device: B::Device,
}

impl<B: AutodiffBackend> TrainingContext<B> {
    /// Set up a worker. Every worker must be given the same initial student.
    ///
    /// Rank 0 creates `save_path` and the event stream below it.
    pub fn new(
        cfg: SemiConfig,
        student: Segmenter<B>,
        group: Box<dyn ProcessGroup>,
        save_path: &Path,
        device: B::Device,
    ) -> Result<Self> {
        let criterion = Criterion::from_config(&cfg.criterion)?;

        let events = if group.is_main() {
            std::fs::create_dir_all(save_path)?;
            let writer = EventWriter::create(save_path)?;
            info!("Event stream: {}", writer.dir().display());
            Some(writer)
        } else {
            None
        };

        let step_config = StepConfig {
            conf_thresh: cfg.conf_thresh,
            fp: cfg.fp.into(),
            ignore_index: IGNORE_INDEX,
        };

        Ok(Self {
            optimizer: build_optimizer::<B>(&cfg),
            teacher: EmaTeacher::new(&student, cfg.ema_alpha),
            checkpoints: CheckpointKeeper::new(save_path, cfg.backbone.clone()),
            lr: cfg.lr,
            criterion,
            step_config,
            student,
            events,
            group,
            device,
            cfg,
        })
    }

    pub fn student(&self) -> &Segmenter<B> {
        &self.student
    }

    pub fn teacher(&self) -> &EmaTeacher<B> {
        &self.teacher
    }

    /// Learning rate of the backbone group for the next step
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn best_miou(&self) -> f64 {
        self.checkpoints.best_miou()
    }

    pub fn checkpoint_path(&self) -> Option<&Path> {
        self.checkpoints.path()
    }

    pub fn event_dir(&self) -> Option<&Path> {
        self.events.as_ref().map(|e| e.dir())
    }

    /// One optimisation step on already batched inputs
    pub fn train_step(
        &mut self,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        mix: UnlabeledBatch<B>,
    ) -> Result<StepLosses> {
        let output = compute_step_losses(
            &self.student,
            self.teacher.model(),
            &self.criterion,
            labeled,
            unlabeled,
            mix,
            &self.step_config,
        );
        if !output.losses.is_finite() {
            warn!("Non-finite loss at rank {}: {:?}", self.group.rank(), output.losses);
        }

        // Teacher follows the student as it was before this step's update
        self.teacher.update(&self.student);

        self.group.barrier()?;

        let mut grads = output.loss.backward();
        let backbone_grads = GradientsParams::from_module(&mut grads, &self.student.backbone);
        let head_grads = GradientsParams::from_grads(grads, &self.student);

        let backbone_grads =
            all_reduce_gradients::<B, _>(backbone_grads, &self.student, self.group.as_ref())?;
        let head_grads = all_reduce_gradients::<B, _>(head_grads, &self.student, self.group.as_ref())?;

        let (lr_backbone, lr_head) = group_lrs(self.lr, self.cfg.lr_multi);
        let student = self
            .optimizer
            .step(lr_backbone, self.student.clone(), backbone_grads);
        let student = self.optimizer.step(lr_head, student, head_grads);
        self.student = all_reduce_running_stats::<B, _>(student, self.group.as_ref())?;

        Ok(output.losses)
    }

    fn add_scalar(&mut self, tag: &str, value: f64, epoch: usize) -> Result<()> {
        match self.events.as_mut() {
            Some(writer) => writer.add_scalar(tag, value, epoch),
            None => Ok(()),
        }
    }

    /// Evaluate the current student on the validation split
    pub fn evaluate(&self, val: &SemiDataset, mode: EvalMode) -> Result<EvalResult> {
        let model = self.student.valid();
        evaluate::<B::InnerBackend>(&model, val, mode, &self.cfg, self.group.as_ref(), &self.device)
    }

    /// Run every epoch and return the best validation mIoU
    pub fn fit(&mut self, data: &TrainingData) -> Result<f64> {
        let rank = self.group.rank();
        let world_size = self.group.world_size();
        let batch_size = self.cfg.batch_size;
        let seed = self.cfg.seed;

        let sampler_l = EpochSampler::new(data.labeled.len(), rank, world_size, seed, STREAM_LABELED);
        let sampler_u = EpochSampler::new(data.unlabeled.len(), rank, world_size, seed, STREAM_UNLABELED);
        let sampler_mix =
            EpochSampler::new(data.unlabeled.len(), rank, world_size, seed, STREAM_UNLABELED_MIX);

        let steps = sampler_u
            .num_batches(batch_size)
            .min(sampler_l.num_batches(batch_size));
        if steps == 0 {
            return Err(SegMixError::Training(format!(
                "no full batch of size {} per worker ({} unlabeled, {} labeled samples)",
                batch_size,
                data.unlabeled.len(),
                data.labeled.len()
            )));
        }

        let scheduler = PolyLr::new(self.cfg.lr, steps * self.cfg.epochs);
        if self.group.is_main() {
            info!(
                "Steps per epoch: {} | total iterations: {} | {}",
                steps,
                scheduler.total_iters,
                scheduler.description()
            );
        }

        let labeled_batcher = LabeledBatcher::<B>::new();
        let unlabeled_batcher = UnlabeledBatcher::<B>::new();
        let mut logger = TrainingLogger::new(rank, self.cfg.epochs, steps);

        for epoch in 0..self.cfg.epochs {
            logger.start_epoch(epoch, self.lr, self.checkpoints.best_miou());
            let mut acc = EpochAccumulator::new();

            let batches_l = sampler_l.batches(epoch, batch_size);
            let batches_u = sampler_u.batches(epoch, batch_size);
            let batches_mix = sampler_mix.batches(epoch, batch_size);

            for (i, ((idx_l, idx_u), idx_mix)) in batches_l
                .iter()
                .zip(batches_u.iter())
                .zip(batches_mix.iter())
                .take(steps)
                .enumerate()
            {
                let position = i * batch_size;
                let labeled = load_items(idx_l, &sampler_l, epoch, position, |index, rng| {
                    data.labeled.get_labeled(index, rng)
                })?;
                let unlabeled = load_items(idx_u, &sampler_u, epoch, position, |index, rng| {
                    data.unlabeled.get_unlabeled(index, rng)
                })?;
                let mix = load_items(idx_mix, &sampler_mix, epoch, position, |index, rng| {
                    data.unlabeled.get_unlabeled(index, rng)
                })?;

                let losses = self.train_step(
                    labeled_batcher.batch(labeled, &self.device),
                    unlabeled_batcher.batch(unlabeled, &self.device),
                    unlabeled_batcher.batch(mix, &self.device),
                )?;
                acc.record(
                    losses.total,
                    losses.loss_x,
                    losses.loss_u_s1,
                    losses.loss_u_s2,
                    losses.loss_u_w_fp,
                    losses.mask_ratio,
                );

                self.lr = scheduler.lr_at_step(epoch, i, steps);

                logger.log_step(
                    i,
                    acc.total_loss.average(),
                    acc.loss_x.average(),
                    acc.loss_s.average(),
                    acc.loss_w_fp.average(),
                    acc.mask_ratio.average(),
                );
            }

            self.add_scalar("lr", self.lr, epoch)?;
            self.add_scalar("Total loss", acc.total_loss.average(), epoch)?;
            self.add_scalar("Loss s", acc.loss_s.average(), epoch)?;
            self.add_scalar("Loss w_fp", acc.loss_w_fp.average(), epoch)?;
            self.add_scalar("Mask", acc.mask_ratio.average(), epoch)?;

            let mode = EvalMode::for_epoch(&self.cfg.dataset, epoch, self.cfg.epochs);
            let result = self.evaluate(&data.val, mode)?;
            self.add_scalar("mIOU", result.mean_iou, epoch)?;
            logger.end_epoch(mode.as_str(), result.mean_iou, &result.per_class_iou);

            let previous = self.checkpoints.best_miou();
            let is_main = self.group.is_main();
            if self
                .checkpoints
                .update(&self.student, result.mean_iou, is_main)?
            {
                logger.log_new_best(previous, result.mean_iou);
            }
            debug!("Epoch {} finished after {} steps", epoch, acc.steps());
        }

        logger.log_complete(self.checkpoints.best_miou());
        Ok(self.checkpoints.best_miou())
    }
}
