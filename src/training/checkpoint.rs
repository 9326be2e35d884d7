//! Best-checkpoint retention
//!
//! Only the checkpoint with the highest validation mIoU is kept on disk, as
//! `<save_path>/<backbone>_<miou:.2>.pth`. Records are burn named-msgpack
//! bytes at full precision.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use tracing::{debug, info};

use crate::model::Segmenter;
use crate::utils::error::{Result, SegMixError};

/// Serialize a model to record bytes
pub fn model_to_bytes<B: Backend>(model: &Segmenter<B>) -> Result<Vec<u8>> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(|e| SegMixError::Checkpoint(format!("Failed to serialize model: {e:?}")))
}

/// Load record bytes into `model`
pub fn model_from_bytes<B: Backend>(
    model: Segmenter<B>,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<Segmenter<B>> {
    let record = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
        .load(bytes, device)
        .map_err(|e| SegMixError::Checkpoint(format!("Failed to decode model record: {e:?}")))?;
    Ok(model.load_record(record))
}

/// Load a checkpoint file written by [`CheckpointKeeper`]
pub fn load_checkpoint<B: Backend>(
    model: Segmenter<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Segmenter<B>> {
    if !path.exists() {
        return Err(SegMixError::PathNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    model_from_bytes(model, bytes, device)
}

/// Tracks the best mIoU seen so far and the file holding it
#[derive(Debug, Clone)]
pub struct CheckpointKeeper {
    save_path: PathBuf,
    backbone: String,
    best_miou: f64,
    path: Option<PathBuf>,
}

impl CheckpointKeeper {
    pub fn new(save_path: impl Into<PathBuf>, backbone: impl Into<String>) -> Self {
        Self {
            save_path: save_path.into(),
            backbone: backbone.into(),
            best_miou: 0.0,
            path: None,
        }
    }

    /// File name for a given score, e.g. `convnet_small_45.00.pth`
    pub fn file_name(backbone: &str, miou: f64) -> String {
        format!("{backbone}_{miou:.2}.pth")
    }

    pub fn best_miou(&self) -> f64 {
        self.best_miou
    }

    /// Path of the checkpoint currently on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a new validation score. When it beats the best so far, the
    /// best is raised on every rank, and rank 0 (`write == true`) replaces
    /// the previous checkpoint file. Returns whether the score was a new best.
    pub fn update<B: Backend>(&mut self, model: &Segmenter<B>, miou: f64, write: bool) -> Result<bool> {
        if miou <= self.best_miou {
            return Ok(false);
        }
        let previous = self.best_miou;
        self.best_miou = miou;

        if !write {
            return Ok(true);
        }

        if let Some(old) = self.path.take() {
            if old.exists() {
                fs::remove_file(&old).map_err(|e| {
                    SegMixError::Checkpoint(format!("Failed to remove {}: {e}", old.display()))
                })?;
                debug!("Removed checkpoint {} ({previous:.2})", old.display());
            }
        }

        fs::create_dir_all(&self.save_path)?;
        let path = self
            .save_path
            .join(Self::file_name(&self.backbone, miou));
        let bytes = model_to_bytes(model)?;
        fs::write(&path, bytes).map_err(|e| {
            SegMixError::Checkpoint(format!("Failed to write {}: {e}", path.display()))
        })?;

        info!("Saved checkpoint {}", path.display());
        self.path = Some(path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SegmenterConfig;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_model() -> Segmenter<TestBackend> {
        SegmenterConfig::new()
            .with_num_classes(2)
            .with_base_filters(2)
            .init(&Default::default())
    }

    fn pth_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".pth"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_keeps_only_the_best() {
        let dir = tempfile::tempdir().unwrap();
        let model = tiny_model();
        let mut keeper = CheckpointKeeper::new(dir.path(), "convnet_tiny");

        assert!(keeper.update(&model, 40.0, true).unwrap());
        assert_eq!(pth_files(dir.path()), vec!["convnet_tiny_40.00.pth"]);

        assert!(keeper.update(&model, 45.0, true).unwrap());
        assert_eq!(pth_files(dir.path()), vec!["convnet_tiny_45.00.pth"]);

        assert!(!keeper.update(&model, 42.0, true).unwrap());
        assert_eq!(pth_files(dir.path()), vec!["convnet_tiny_45.00.pth"]);
        assert_eq!(keeper.best_miou(), 45.0);
    }

    #[test]
    fn test_non_main_rank_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut keeper = CheckpointKeeper::new(dir.path(), "convnet_tiny");

        assert!(keeper.update(&tiny_model(), 12.5, false).unwrap());
        assert_eq!(keeper.best_miou(), 12.5);
        assert!(keeper.path().is_none());
        assert!(pth_files(dir.path()).is_empty());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let model = tiny_model();
        let mut keeper = CheckpointKeeper::new(dir.path(), "convnet_tiny");
        keeper.update(&model, 50.0, true).unwrap();

        let restored = load_checkpoint(tiny_model(), keeper.path().unwrap(), &device).unwrap();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device);
        let a = model.forward(input.clone());
        let b = restored.forward(input);
        let diff: f32 = (a - b).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_missing_checkpoint() {
        let err = load_checkpoint(tiny_model(), Path::new("/nonexistent/x.pth"), &Default::default())
            .unwrap_err();
        assert!(matches!(err, SegMixError::PathNotFound(_)));
    }
}
