//! Run Configuration
//!
//! One structured document describes a training run. YAML is the primary
//! format; files ending in `.toml` are parsed as TOML. Keys that are not
//! present fall back to the defaults below.
//!
//! ```yaml
//! dataset: pascal
//! data_root: data/VOC2012
//! nclass: 21
//! crop_size: 321
//! epochs: 80
//! batch_size: 2
//! lr: 0.001
//! lr_multi: 10.0
//! backbone: convnet_small
//! conf_thresh: 0.95
//! criterion:
//!   name: CELoss
//!   kwargs:
//!     ignore_index: 255
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::utils::error::{Result, SegMixError};
use crate::IGNORE_INDEX;

/// Loss used for the labeled batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    /// `CELoss` or `OHEM`
    pub name: String,
    #[serde(default)]
    pub kwargs: CriterionKwargs,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            name: "CELoss".to_string(),
            kwargs: CriterionKwargs::default(),
        }
    }
}

/// Criterion keyword arguments. Unused keys are ignored by the chosen criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionKwargs {
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    /// OHEM probability threshold
    #[serde(default = "default_ohem_thresh")]
    pub thresh: f64,
    /// OHEM minimum number of kept pixels
    #[serde(default = "default_min_kept")]
    pub min_kept: usize,
}

impl Default for CriterionKwargs {
    fn default() -> Self {
        Self {
            ignore_index: default_ignore_index(),
            thresh: default_ohem_thresh(),
            min_kept: default_min_kept(),
        }
    }
}

fn default_ignore_index() -> i64 {
    IGNORE_INDEX
}

fn default_ohem_thresh() -> f64 {
    0.7
}

fn default_min_kept() -> usize {
    100_000
}

/// Complete configuration of a semi-supervised training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemiConfig {
    /// Dataset name (`pascal`, `cityscapes`, `coco`, ...)
    pub dataset: String,
    /// Root directory every id-list path is relative to
    pub data_root: PathBuf,
    /// Number of segmentation classes
    #[serde(default = "default_nclass")]
    pub nclass: usize,
    /// Square training crop size in pixels
    pub crop_size: usize,
    pub epochs: usize,
    /// Per-worker batch size, shared by the labeled and unlabeled streams
    pub batch_size: usize,
    /// Base learning rate of the backbone parameter group
    pub lr: f64,
    /// Multiplier applied to the learning rate of non-backbone parameters
    pub lr_multi: f64,
    /// Backbone preset: `convnet_tiny`, `convnet_small` or `convnet_base`
    pub backbone: String,
    /// Minimum teacher confidence for a pseudo-label to contribute
    pub conf_thresh: f64,
    #[serde(default)]
    pub criterion: CriterionConfig,

    /// Asymptotic EMA decay of the teacher
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Feature perturbation strengths: `[channel drop rate, feature noise]`
    #[serde(default = "default_fp")]
    pub fp: [f64; 2],
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Validation id list; defaults to `splits/<dataset>/val.txt`
    #[serde(default)]
    pub val_id_path: Option<PathBuf>,
    /// Optional student initialisation (burn named-msgpack record)
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
}

fn default_nclass() -> usize {
    21
}

fn default_ema_alpha() -> f64 {
    0.99
}

fn default_fp() -> [f64; 2] {
    [0.5, 0.2]
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_seed() -> u64 {
    42
}

impl SemiConfig {
    /// Load a configuration file, choosing the parser from the extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            SegMixError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config: Self = if is_toml {
            parse_toml(&content, path)?
        } else {
            parse_yaml(&content, path)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = parse_yaml(content, Path::new("<string>"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the numeric ranges of the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SegMixError::Config(msg.to_string()));

        if self.nclass < 2 {
            return fail("nclass must be at least 2");
        }
        if self.crop_size == 0 {
            return fail("crop_size must be greater than 0");
        }
        if self.epochs == 0 {
            return fail("epochs must be greater than 0");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be greater than 0");
        }
        if self.lr <= 0.0 {
            return fail("lr must be positive");
        }
        if self.lr_multi <= 0.0 {
            return fail("lr_multi must be positive");
        }
        if !(0.0..=1.0).contains(&self.conf_thresh) {
            return fail("conf_thresh must be in range [0.0, 1.0]");
        }
        if !(0.0..1.0).contains(&self.ema_alpha) {
            return fail("ema_alpha must be in range [0.0, 1.0)");
        }
        if !(0.0..1.0).contains(&self.fp[0]) || self.fp[1] < 0.0 {
            return fail("fp must be [drop rate in [0, 1), noise >= 0]");
        }
        Ok(())
    }

    /// Validation id list, resolved against the default layout when unset
    pub fn val_id_path(&self) -> PathBuf {
        self.val_id_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("splits/{}/val.txt", self.dataset)))
    }

    /// Pretty YAML dump for the startup log
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SegMixError::Serialization(format!("Failed to encode config: {e}")))
    }
}

fn parse_yaml<T: DeserializeOwned>(content: &str, path: &Path) -> Result<T> {
    serde_yaml::from_str(content)
        .map_err(|e| SegMixError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

fn parse_toml<T: DeserializeOwned>(content: &str, path: &Path) -> Result<T> {
    toml::from_str(content)
        .map_err(|e| SegMixError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PASCAL: &str = r#"
dataset: pascal
data_root: data/VOC2012
nclass: 21
crop_size: 321
epochs: 80
batch_size: 2
lr: 0.001
lr_multi: 10.0
backbone: convnet_small
conf_thresh: 0.95
criterion:
  name: OHEM
  kwargs:
    ignore_index: 255
    thresh: 0.7
    min_kept: 200000
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let cfg = SemiConfig::from_yaml_str(PASCAL).unwrap();
        assert_eq!(cfg.dataset, "pascal");
        assert_eq!(cfg.criterion.name, "OHEM");
        assert_eq!(cfg.criterion.kwargs.min_kept, 200_000);
        assert!((cfg.ema_alpha - 0.99).abs() < 1e-12);
        assert_eq!(cfg.fp, [0.5, 0.2]);
        assert_eq!(cfg.val_id_path(), PathBuf::from("splits/pascal/val.txt"));
        assert!(cfg.weights_path.is_none());
    }

    #[test]
    fn test_criterion_defaults_to_cross_entropy() {
        let yaml = PASCAL.split("criterion:").next().unwrap();
        let cfg = SemiConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.criterion.name, "CELoss");
        assert_eq!(cfg.criterion.kwargs.ignore_index, 255);
    }

    #[test]
    fn test_load_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
dataset = "cityscapes"
data_root = "data/cityscapes"
nclass = 19
crop_size = 801
epochs = 240
batch_size = 2
lr = 0.005
lr_multi = 1.0
backbone = "convnet_base"
conf_thresh = 0.0

[criterion]
name = "CELoss"
"#
        )
        .unwrap();

        let cfg = SemiConfig::load(&path).unwrap();
        assert_eq!(cfg.nclass, 19);
        assert_eq!(cfg.epochs, 240);
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let yaml = PASCAL.replace("conf_thresh: 0.95", "conf_thresh: 1.5");
        let err = SemiConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, SegMixError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SemiConfig::load(Path::new("/nonexistent/run.yaml")).unwrap_err();
        assert!(format!("{}", err).contains("Failed to read config"));
    }
}
