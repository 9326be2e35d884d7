//! Data Augmentation Module for Semi-Supervised Segmentation
//!
//! Geometric transforms are applied jointly to an image and its mask so the
//! two stay aligned; photometric transforms only touch the image.
//!
//! # Augmentation Strategy
//!
//! - **Labeled / weak view**: random rescale, pad-and-crop, horizontal flip
//! - **Strong views**: weak view + color jitter, random grayscale, gaussian blur
//! - **CutMix boxes**: one random rectangle per strong view
//! - **Validation**: no augmentation

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::IGNORE_INDEX;

/// Configuration for data augmentation
#[derive(Clone, Debug)]
pub struct AugmentationConfig {
    /// Long side is rescaled to `base * U[min, max]`
    pub scale_range: (f32, f32),
    /// Probability of applying horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Probability of applying color jitter
    pub color_jitter_prob: f32,
    /// Brightness factor range (1.0 ± brightness_delta)
    pub brightness_delta: f32,
    /// Contrast factor range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    /// Saturation factor range (1.0 ± saturation_delta)
    pub saturation_delta: f32,
    /// Hue rotation range as a fraction of the color wheel
    pub hue_delta: f32,
    /// Probability of converting to grayscale
    pub grayscale_prob: f32,
    /// Probability of applying blur
    pub blur_prob: f32,
    /// Gaussian blur sigma range
    pub blur_sigma: (f32, f32),
    /// Probability that a CutMix box is non-empty
    pub cutmix_prob: f32,
    /// Box area as a fraction of the crop
    pub cutmix_area: (f32, f32),
    /// Box aspect ratio range
    pub cutmix_ratio: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            scale_range: (0.5, 2.0),
            horizontal_flip_prob: 0.5,
            color_jitter_prob: 0.8,
            brightness_delta: 0.5,
            contrast_delta: 0.5,
            saturation_delta: 0.5,
            hue_delta: 0.25,
            grayscale_prob: 0.2,
            blur_prob: 0.5,
            blur_sigma: (0.1, 2.0),
            cutmix_prob: 0.5,
            cutmix_area: (0.02, 0.4),
            cutmix_ratio: (0.3, 1.0 / 0.3),
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations (for validation)
    pub fn none() -> Self {
        Self {
            scale_range: (1.0, 1.0),
            horizontal_flip_prob: 0.0,
            color_jitter_prob: 0.0,
            brightness_delta: 0.0,
            contrast_delta: 0.0,
            saturation_delta: 0.0,
            hue_delta: 0.0,
            grayscale_prob: 0.0,
            blur_prob: 0.0,
            blur_sigma: (0.1, 0.1),
            cutmix_prob: 0.0,
            cutmix_area: (0.0, 0.0),
            cutmix_ratio: (1.0, 1.0),
        }
    }
}

/// Image/mask augmenter producing fixed-size crops
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    crop_size: u32,
}

impl Augmenter {
    /// Create a new augmenter with the given configuration
    pub fn new(config: AugmentationConfig, crop_size: u32) -> Self {
        Self { config, crop_size }
    }

    pub fn crop_size(&self) -> u32 {
        self.crop_size
    }

    /// Rescale, crop and flip an image together with its mask.
    ///
    /// Padding uses 0 for the image and the ignore index for the mask, so
    /// padded pixels never count as labeled.
    pub fn geometric(
        &self,
        img: RgbImage,
        mask: GrayImage,
        rng: &mut ChaCha8Rng,
    ) -> (RgbImage, GrayImage) {
        let (img, mask) = self.random_rescale(img, mask, rng);
        let (img, mask) = self.random_crop(img, mask, rng);

        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            (imageops::flip_horizontal(&img), imageops::flip_horizontal(&mask))
        } else {
            (img, mask)
        }
    }

    /// Photometric strong augmentation of an already cropped image
    pub fn strong(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let mut result = img.clone();

        if rng.gen::<f32>() < self.config.color_jitter_prob {
            result = self.color_jitter(&result, rng);
        }

        if rng.gen::<f32>() < self.config.grayscale_prob {
            result = grayscale(&result);
        }

        if rng.gen::<f32>() < self.config.blur_prob {
            let (lo, hi) = self.config.blur_sigma;
            let sigma = if hi > lo { rng.gen_range(lo..hi) } else { lo };
            result = imageops::blur(&result, sigma);
        }

        result
    }

    /// Sample a CutMix box over the crop, row-major `crop_size * crop_size`
    /// values in {0, 1}. Empty with probability `1 - cutmix_prob`.
    pub fn cutmix_box(&self, rng: &mut ChaCha8Rng) -> Vec<i64> {
        let size = self.crop_size as usize;
        let mut mask = vec![0i64; size * size];
        if size == 0 || rng.gen::<f32>() >= self.config.cutmix_prob {
            return mask;
        }

        let (area_lo, area_hi) = self.config.cutmix_area;
        let (ratio_lo, ratio_hi) = self.config.cutmix_ratio;
        let area = sample_range(rng, area_lo, area_hi) * (size * size) as f32;

        let (x, y, w, h) = loop {
            let ratio = sample_range(rng, ratio_lo, ratio_hi);
            let w = (area / ratio).sqrt() as usize;
            let h = (area * ratio).sqrt() as usize;
            let x = rng.gen_range(0..size);
            let y = rng.gen_range(0..size);
            if x + w <= size && y + h <= size {
                break (x, y, w, h);
            }
        };

        for row in y..y + h {
            for col in x..x + w {
                mask[row * size + col] = 1;
            }
        }
        mask
    }

    fn random_rescale(
        &self,
        img: RgbImage,
        mask: GrayImage,
        rng: &mut ChaCha8Rng,
    ) -> (RgbImage, GrayImage) {
        let (lo, hi) = self.config.scale_range;
        if (hi - lo).abs() < f32::EPSILON && (lo - 1.0).abs() < f32::EPSILON {
            return (img, mask);
        }

        let (width, height) = img.dimensions();
        let base = width.max(height) as f32;
        let long_side = rng
            .gen_range((base * lo) as u32..=(base * hi) as u32)
            .max(1);

        let (new_w, new_h) = if height > width {
            let w = (long_side as f32 * width as f32 / height as f32 + 0.5) as u32;
            (w.max(1), long_side)
        } else {
            let h = (long_side as f32 * height as f32 / width as f32 + 0.5) as u32;
            (long_side, h.max(1))
        };

        (
            imageops::resize(&img, new_w, new_h, FilterType::Triangle),
            imageops::resize(&mask, new_w, new_h, FilterType::Nearest),
        )
    }

    fn random_crop(
        &self,
        img: RgbImage,
        mask: GrayImage,
        rng: &mut ChaCha8Rng,
    ) -> (RgbImage, GrayImage) {
        let size = self.crop_size;
        let (width, height) = img.dimensions();
        let pad_w = width.max(size);
        let pad_h = height.max(size);

        let mut padded_img: RgbImage = ImageBuffer::from_pixel(pad_w, pad_h, Rgb([0, 0, 0]));
        let mut padded_mask: GrayImage =
            ImageBuffer::from_pixel(pad_w, pad_h, Luma([IGNORE_INDEX as u8]));
        imageops::replace(&mut padded_img, &img, 0, 0);
        imageops::replace(&mut padded_mask, &mask, 0, 0);

        let x = rng.gen_range(0..=pad_w - size);
        let y = rng.gen_range(0..=pad_h - size);

        (
            imageops::crop_imm(&padded_img, x, y, size, size).to_image(),
            imageops::crop_imm(&padded_mask, x, y, size, size).to_image(),
        )
    }

    fn color_jitter(&self, img: &RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let brightness = 1.0 + symmetric(rng, self.config.brightness_delta);
        let contrast = 1.0 + symmetric(rng, self.config.contrast_delta);
        let saturation = 1.0 + symmetric(rng, self.config.saturation_delta);
        let hue = symmetric(rng, self.config.hue_delta);

        let result = adjust_brightness(img, brightness);
        let result = adjust_contrast(&result, contrast);
        let result = adjust_saturation(&result, saturation);
        if hue.abs() > f32::EPSILON {
            imageops::huerotate(&result, (hue * 360.0) as i32)
        } else {
            result
        }
    }

    /// Convert image to CHW float data in [0, 1]
    pub fn to_tensor_data(img: &RgbImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let idx = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + idx] = pixel[c] as f32 / 255.0;
            }
        }

        data
    }

    /// Convert a mask to row-major class indices
    pub fn mask_to_vec(mask: &GrayImage) -> Vec<i64> {
        mask.pixels().map(|p| p[0] as i64).collect()
    }
}

fn sample_range(rng: &mut ChaCha8Rng, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

fn symmetric(rng: &mut ChaCha8Rng, delta: f32) -> f32 {
    if delta > 0.0 {
        rng.gen_range(-delta..=delta)
    } else {
        0.0
    }
}

fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn map_pixels<F: Fn(f32, usize) -> f32>(img: &RgbImage, f: F) -> RgbImage {
    let mut output = img.clone();
    for pixel in output.pixels_mut() {
        for c in 0..3 {
            pixel[c] = f(pixel[c] as f32, c).clamp(0.0, 255.0) as u8;
        }
    }
    output
}

/// Scale all channels by `factor`
fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    map_pixels(img, |v, _| v * factor)
}

/// Scale pixel values around the mean luminance
fn adjust_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let count = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(luminance).sum::<f32>() / count;
    map_pixels(img, |v, _| mean + factor * (v - mean))
}

/// Interpolate between the grayscale image and the original
fn adjust_saturation(img: &RgbImage, factor: f32) -> RgbImage {
    let mut output = img.clone();
    for pixel in output.pixels_mut() {
        let gray = luminance(pixel);
        for c in 0..3 {
            pixel[c] = (gray + factor * (pixel[c] as f32 - gray)).clamp(0.0, 255.0) as u8;
        }
    }
    output
}

fn grayscale(img: &RgbImage) -> RgbImage {
    adjust_saturation(img, 0.0)
}
