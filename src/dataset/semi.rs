//! Semi-supervised segmentation dataset
//!
//! One dataset type serves the three splits of a run:
//! - `train_l`: labeled crops `(image, mask)`, oversampled to the size of the
//!   unlabeled set
//! - `train_u`: `(weak, strong1, strong2, ignore_mask, cutmix_box1, cutmix_box2)`
//! - `val`: full-resolution `(image, mask)`
//!
//! Images are decoded lazily on every access, so the random augmentation
//! differs between epochs.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{GrayImage, ImageReader, RgbImage};
use rand_chacha::ChaCha8Rng;

use crate::dataset::augmentation::{Augmenter, AugmentationConfig};
use crate::dataset::ids::{oversample, read_id_list, SampleId};
use crate::utils::error::{Result, SegMixError};

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    TrainLabeled,
    TrainUnlabeled,
    Val,
}

impl FromStr for Split {
    type Err = SegMixError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train_l" => Ok(Split::TrainLabeled),
            "train_u" => Ok(Split::TrainUnlabeled),
            "val" => Ok(Split::Val),
            other => Err(SegMixError::Dataset(format!("unknown split '{}'", other))),
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::TrainLabeled => write!(f, "train_l"),
            Split::TrainUnlabeled => write!(f, "train_u"),
            Split::Val => write!(f, "val"),
        }
    }
}

/// A labeled training crop
#[derive(Clone, Debug)]
pub struct LabeledItem {
    /// CHW data in [0, 1], `3 * size * size`
    pub image: Vec<f32>,
    /// Class index per pixel, 255 for ignored
    pub mask: Vec<i64>,
    pub size: usize,
}

/// An unlabeled training crop with its two strong views and CutMix boxes
#[derive(Clone, Debug)]
pub struct UnlabeledItem {
    pub weak: Vec<f32>,
    pub strong1: Vec<f32>,
    pub strong2: Vec<f32>,
    /// 255 on padded pixels, 0 elsewhere
    pub ignore_mask: Vec<i64>,
    pub cutmix_box1: Vec<i64>,
    pub cutmix_box2: Vec<i64>,
    pub size: usize,
}

/// A validation sample at its original resolution
#[derive(Clone, Debug)]
pub struct ValItem {
    pub image: Vec<f32>,
    pub mask: Vec<i64>,
    pub height: usize,
    pub width: usize,
    pub name: String,
}

/// Id-list driven dataset for one split
#[derive(Debug, Clone)]
pub struct SemiDataset {
    name: String,
    root: PathBuf,
    split: Split,
    ids: Vec<SampleId>,
    augmenter: Augmenter,
    num_classes: Option<usize>,
}

impl SemiDataset {
    /// Open a split.
    ///
    /// # Arguments
    /// * `name` - dataset name, e.g. `pascal`
    /// * `root` - directory the id-list paths are relative to
    /// * `split` - `train_l`, `train_u` or `val`
    /// * `crop_size` - training crop size (ignored for `val`)
    /// * `id_path` - id list file
    /// * `nsample` - oversample the list to this many entries
    pub fn new(
        name: &str,
        root: &Path,
        split: &str,
        crop_size: usize,
        id_path: &Path,
        nsample: Option<usize>,
    ) -> Result<Self> {
        let split: Split = split.parse()?;
        let mut ids = read_id_list(id_path)?;

        if matches!(split, Split::TrainLabeled | Split::Val) {
            if let Some(missing) = ids.iter().find(|id| id.mask.is_none()) {
                return Err(SegMixError::Dataset(format!(
                    "{} sample '{}' has no mask path",
                    split, missing.image
                )));
            }
        }

        if let Some(nsample) = nsample {
            ids = oversample(&ids, nsample);
        }

        let config = match split {
            Split::Val => AugmentationConfig::none(),
            _ => AugmentationConfig::default(),
        };

        Ok(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            split,
            ids,
            augmenter: Augmenter::new(config, crop_size as u32),
            num_classes: None,
        })
    }

    /// Reject mask values outside `0..num_classes` (255 stays allowed)
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[SampleId] {
        &self.ids
    }

    fn sample(&self, index: usize) -> Result<&SampleId> {
        self.ids.get(index).ok_or_else(|| {
            SegMixError::Dataset(format!(
                "index {} out of range for {} ({} samples)",
                index,
                self.split,
                self.ids.len()
            ))
        })
    }

    fn load_rgb(&self, rel: &str) -> Result<RgbImage> {
        let path = self.root.join(rel);
        let img = ImageReader::open(&path)
            .map_err(|e| SegMixError::ImageLoad(path.clone(), e.to_string()))?
            .decode()
            .map_err(|e| SegMixError::ImageLoad(path.clone(), e.to_string()))?;
        Ok(img.to_rgb8())
    }

    /// Load a class-index mask. 8-bit palette and grayscale PNGs are read as
    /// raw indices; anything else goes through the generic decoder.
    fn load_mask(&self, rel: &str) -> Result<GrayImage> {
        let path = self.root.join(rel);
        let is_png = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));

        let raw = if is_png { read_png_indices(&path)? } else { None };
        let mask = match raw {
            Some(mask) => mask,
            None => ImageReader::open(&path)
                .map_err(|e| SegMixError::ImageLoad(path.clone(), e.to_string()))?
                .decode()
                .map_err(|e| SegMixError::ImageLoad(path.clone(), e.to_string()))?
                .to_luma8(),
        };

        self.check_mask(&mask, rel)?;
        Ok(mask)
    }

    fn check_mask(&self, mask: &GrayImage, rel: &str) -> Result<()> {
        let Some(num_classes) = self.num_classes else {
            return Ok(());
        };
        match mask
            .pixels()
            .map(|p| p.0[0])
            .find(|&v| v != IGNORE_VALUE && v as usize >= num_classes)
        {
            Some(bad) => Err(SegMixError::Dataset(format!(
                "mask '{}' has value {} but there are only {} classes",
                rel, bad, num_classes
            ))),
            None => Ok(()),
        }
    }

    fn mask_path<'a>(&self, id: &'a SampleId) -> Result<&'a str> {
        id.mask
            .as_deref()
            .ok_or_else(|| SegMixError::Dataset(format!("sample '{}' has no mask", id.image)))
    }

    /// Load and augment a labeled crop
    pub fn get_labeled(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<LabeledItem> {
        let id = self.sample(index)?;
        let img = self.load_rgb(&id.image)?;
        let mask = self.load_mask(self.mask_path(id)?)?;

        let (img, mask) = self.augmenter.geometric(img, mask, rng);
        Ok(LabeledItem {
            image: Augmenter::to_tensor_data(&img),
            mask: Augmenter::mask_to_vec(&mask),
            size: self.augmenter.crop_size() as usize,
        })
    }

    /// Load an unlabeled crop and build its weak/strong views
    pub fn get_unlabeled(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<UnlabeledItem> {
        let id = self.sample(index)?;
        let img = self.load_rgb(&id.image)?;

        // An all-zero mask becomes the ignore mask once padding marks 255
        let blank = GrayImage::new(img.width(), img.height());
        let (weak, ignore) = self.augmenter.geometric(img, blank, rng);

        let strong1 = self.augmenter.strong(&weak, rng);
        let cutmix_box1 = self.augmenter.cutmix_box(rng);
        let strong2 = self.augmenter.strong(&weak, rng);
        let cutmix_box2 = self.augmenter.cutmix_box(rng);

        Ok(UnlabeledItem {
            weak: Augmenter::to_tensor_data(&weak),
            strong1: Augmenter::to_tensor_data(&strong1),
            strong2: Augmenter::to_tensor_data(&strong2),
            ignore_mask: Augmenter::mask_to_vec(&ignore),
            cutmix_box1,
            cutmix_box2,
            size: self.augmenter.crop_size() as usize,
        })
    }

    /// Load a validation sample without augmentation
    pub fn get_val(&self, index: usize) -> Result<ValItem> {
        let id = self.sample(index)?;
        let img = self.load_rgb(&id.image)?;
        let mask = self.load_mask(self.mask_path(id)?)?;

        if img.dimensions() != mask.dimensions() {
            return Err(SegMixError::Dataset(format!(
                "image and mask size differ for '{}': {:?} vs {:?}",
                id.image,
                img.dimensions(),
                mask.dimensions()
            )));
        }

        Ok(ValItem {
            image: Augmenter::to_tensor_data(&img),
            mask: Augmenter::mask_to_vec(&mask),
            height: img.height() as usize,
            width: img.width() as usize,
            name: id.name().to_string(),
        })
    }
}

/// Mask value excluded from training and evaluation
const IGNORE_VALUE: u8 = 255;

/// Decode an 8-bit indexed or grayscale PNG without palette expansion.
///
/// Returns `None` for other colour types and bit depths.
fn read_png_indices(path: &Path) -> Result<Option<GrayImage>> {
    let load_err =
        |e: &dyn std::fmt::Display| SegMixError::ImageLoad(path.to_path_buf(), e.to_string());

    let file = File::open(path).map_err(|e| load_err(&e))?;
    let mut decoder = png::Decoder::new(BufReader::new(file));
    decoder.set_transformations(png::Transformations::IDENTITY);
    let mut reader = decoder.read_info().map_err(|e| load_err(&e))?;

    let mut buf = vec![0u8; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf).map_err(|e| load_err(&e))?;

    let single_channel = matches!(
        frame.color_type,
        png::ColorType::Indexed | png::ColorType::Grayscale
    );
    if !single_channel || frame.bit_depth != png::BitDepth::Eight {
        return Ok(None);
    }

    buf.truncate(frame.buffer_size());
    let mask = GrayImage::from_raw(frame.width, frame.height, buf).ok_or_else(|| {
        SegMixError::ImageLoad(path.to_path_buf(), "truncated mask data".to_string())
    })?;
    Ok(Some(mask))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};
    use rand::SeedableRng;
    use std::fs;

    /// Write a tiny two-class dataset and its id lists under `root`
    pub(crate) fn write_toy_dataset(root: &Path, count: usize, size: u32) {
        fs::create_dir_all(root.join("JPEGImages")).unwrap();
        fs::create_dir_all(root.join("SegmentationClass")).unwrap();

        let mut labeled = String::new();
        for i in 0..count {
            let img: RgbImage = ImageBuffer::from_fn(size, size, |x, y| {
                Rgb([(x * 20) as u8, (y * 20) as u8, (i * 30) as u8])
            });
            let mask: GrayImage =
                ImageBuffer::from_fn(size, size, |x, _| Luma([if x < size / 2 { 0 } else { 1 }]));
            img.save(root.join(format!("JPEGImages/{}.png", i))).unwrap();
            mask.save(root.join(format!("SegmentationClass/{}.png", i))).unwrap();
            labeled.push_str(&format!("JPEGImages/{i}.png SegmentationClass/{i}.png\n"));
        }
        fs::write(root.join("labeled.txt"), &labeled).unwrap();
        fs::write(root.join("val.txt"), &labeled).unwrap();

        let unlabeled: String = (0..count)
            .map(|i| format!("JPEGImages/{}.png\n", i))
            .collect();
        fs::write(root.join("unlabeled.txt"), unlabeled).unwrap();
    }

    #[test]
    fn test_labeled_split_oversamples() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 2, 8);

        let ds = SemiDataset::new(
            "pascal",
            dir.path(),
            "train_l",
            8,
            &dir.path().join("labeled.txt"),
            Some(5),
        )
        .unwrap();
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.ids()[4].image, "JPEGImages/0.png");

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let item = ds.get_labeled(3, &mut rng).unwrap();
        assert_eq!(item.image.len(), 3 * 8 * 8);
        assert_eq!(item.mask.len(), 8 * 8);
    }

    #[test]
    fn test_unlabeled_item_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 2, 8);

        let ds = SemiDataset::new(
            "pascal",
            dir.path(),
            "train_u",
            6,
            &dir.path().join("unlabeled.txt"),
            None,
        )
        .unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let item = ds.get_unlabeled(0, &mut rng).unwrap();
        assert_eq!(item.weak.len(), 3 * 36);
        assert_eq!(item.strong2.len(), 3 * 36);
        assert_eq!(item.cutmix_box1.len(), 36);
        assert!(item.ignore_mask.iter().all(|&v| v == 0 || v == 255));
    }

    #[test]
    fn test_val_item_keeps_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 1, 10);

        let ds = SemiDataset::new("pascal", dir.path(), "val", 4, &dir.path().join("val.txt"), None)
            .unwrap();
        let item = ds.get_val(0).unwrap();
        assert_eq!((item.height, item.width), (10, 10));
        assert_eq!(item.mask[9], 1);
        assert_eq!(item.name, "0");
        assert!(ds.get_val(1).is_err());
    }

    #[test]
    fn test_labeled_split_requires_masks() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 1, 4);

        let err = SemiDataset::new(
            "pascal",
            dir.path(),
            "train_l",
            4,
            &dir.path().join("unlabeled.txt"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SegMixError::Dataset(_)));
        assert!("train_x".parse::<Split>().is_err());
    }

    /// Palette PNG whose entries 0, 1 and 255 are the VOC colours
    fn write_palette_mask(path: &Path, indices: &[u8], width: u32, height: u32) {
        let mut palette = vec![0u8; 256 * 3];
        palette[3..6].copy_from_slice(&[128, 0, 0]);
        palette[255 * 3..].copy_from_slice(&[224, 224, 192]);

        let file = fs::File::create(path).unwrap();
        let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(palette);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(indices).unwrap();
    }

    #[test]
    fn test_palette_mask_keeps_class_indices() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 1, 2);
        write_palette_mask(
            &dir.path().join("SegmentationClass/0.png"),
            &[0, 1, 255, 1],
            2,
            2,
        );

        let ds = SemiDataset::new("pascal", dir.path(), "val", 2, &dir.path().join("val.txt"), None)
            .unwrap()
            .with_num_classes(21);
        let item = ds.get_val(0).unwrap();
        assert_eq!(item.mask, vec![0, 1, 255, 1]);
    }

    #[test]
    fn test_mask_value_beyond_classes_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_toy_dataset(dir.path(), 1, 2);
        write_palette_mask(&dir.path().join("SegmentationClass/0.png"), &[0, 1, 5, 255], 2, 2);

        let ds = SemiDataset::new("pascal", dir.path(), "val", 2, &dir.path().join("val.txt"), None)
            .unwrap()
            .with_num_classes(2);
        assert!(matches!(ds.get_val(0), Err(SegMixError::Dataset(_))));

        // without a class count the raw index is passed through
        let ds = SemiDataset::new("pascal", dir.path(), "val", 2, &dir.path().join("val.txt"), None)
            .unwrap();
        assert_eq!(ds.get_val(0).unwrap().mask, vec![0, 1, 5, 255]);
    }
}
