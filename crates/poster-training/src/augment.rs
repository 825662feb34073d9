//! Image transform pipeline: resize, random augmentations, normalisation.
//!
//! Random transforms draw from an `StdRng` seeded from the pipeline seed,
//! the sample index and the epoch, so a given `(index, epoch)` always yields
//! the same image while different epochs see different augmentations.

use crate::error::TrainingResult;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use poster_abstraction::ImageTensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Resize { width: u32, height: u32 },
    HorizontalFlip { p: f64 },
    VerticalFlip { p: f64 },
    /// Shifts in 8-bit HSV units (hue on the 0..180 scale).
    HueSaturationValue { hue_shift: f32, sat_shift: f32, val_shift: f32, p: f64 },
    RandomBrightnessContrast { brightness: f32, contrast: f32, p: f64 },
    /// Random affine: translation as a fraction of size, relative scale change, rotation in degrees.
    ShiftScaleRotate { shift: f32, scale: f32, rotate: f32, p: f64 },
    /// Odd kernel size drawn from `kernel`, sigma derived from it.
    GaussianBlur { kernel: (u32, u32), p: f64 },
    /// Scale to `[0, 1]`, subtract `mean`, divide by `std`, per channel.
    Normalize { mean: [f32; 3], std: [f32; 3] },
}

/// Ordered list of transforms applied to an RGB image, ending in a CHW tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
    seed: u64,
}

/// The standard poster pipeline.
///
/// Without `postprocessing` the tensor keeps raw `0..=255` pixel values.
#[must_use]
pub fn get_transforms(
    width: u32,
    height: u32,
    preprocessing: bool,
    augmentations: bool,
    postprocessing: bool,
) -> TransformPipeline {
    let mut transforms = Vec::new();
    if preprocessing {
        transforms.push(Transform::Resize { width, height });
    }
    if augmentations {
        transforms.extend([
            Transform::HorizontalFlip { p: 0.5 },
            Transform::VerticalFlip { p: 0.5 },
            Transform::HueSaturationValue { hue_shift: 20.0, sat_shift: 30.0, val_shift: 20.0, p: 0.5 },
            Transform::RandomBrightnessContrast { brightness: 0.2, contrast: 0.2, p: 0.5 },
            Transform::ShiftScaleRotate { shift: 0.0625, scale: 0.1, rotate: 45.0, p: 0.5 },
            Transform::GaussianBlur { kernel: (3, 7), p: 0.5 },
        ]);
    }
    if postprocessing {
        transforms.push(Transform::Normalize { mean: IMAGENET_MEAN, std: IMAGENET_STD });
    }
    TransformPipeline { transforms, seed: 0 }
}

impl TransformPipeline {
    #[must_use]
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms, seed: 0 }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn describe(&self) -> String {
        self.transforms
            .iter()
            .map(|t| match t {
                Transform::Resize { width, height } => format!("resize={width}x{height}"),
                Transform::HorizontalFlip { p } => format!("hflip_p={p:.2}"),
                Transform::VerticalFlip { p } => format!("vflip_p={p:.2}"),
                Transform::HueSaturationValue { p, .. } => format!("hsv_p={p:.2}"),
                Transform::RandomBrightnessContrast { p, .. } => format!("brightness_contrast_p={p:.2}"),
                Transform::ShiftScaleRotate { p, .. } => format!("shift_scale_rotate_p={p:.2}"),
                Transform::GaussianBlur { p, .. } => format!("blur_p={p:.2}"),
                Transform::Normalize { .. } => "normalize".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn load_and_apply(&self, path: &Path, index: usize, epoch: usize) -> TrainingResult<ImageTensor> {
        let img = image::open(path)?.to_rgb8();
        Ok(self.apply(img, index, epoch))
    }

    #[must_use]
    pub fn apply(&self, mut img: RgbImage, index: usize, epoch: usize) -> ImageTensor {
        let mut rng = StdRng::seed_from_u64(mix_seed(self.seed, index as u64, epoch as u64));
        let mut normalize = None;

        for transform in &self.transforms {
            match *transform {
                Transform::Resize { width, height } => {
                    if img.dimensions() != (width, height) {
                        img = image::imageops::resize(&img, width, height, FilterType::Triangle);
                    }
                }
                Transform::HorizontalFlip { p } => {
                    if fires(&mut rng, p) {
                        image::imageops::flip_horizontal_in_place(&mut img);
                    }
                }
                Transform::VerticalFlip { p } => {
                    if fires(&mut rng, p) {
                        image::imageops::flip_vertical_in_place(&mut img);
                    }
                }
                Transform::HueSaturationValue { hue_shift, sat_shift, val_shift, p } => {
                    if fires(&mut rng, p) {
                        let dh = symmetric(&mut rng, hue_shift);
                        let ds = symmetric(&mut rng, sat_shift);
                        let dv = symmetric(&mut rng, val_shift);
                        shift_hsv(&mut img, dh, ds, dv);
                    }
                }
                Transform::RandomBrightnessContrast { brightness, contrast, p } => {
                    if fires(&mut rng, p) {
                        let beta = symmetric(&mut rng, brightness) * 255.0;
                        let alpha = 1.0 + symmetric(&mut rng, contrast);
                        for pixel in img.pixels_mut() {
                            for c in &mut pixel.0 {
                                *c = (f32::from(*c) * alpha + beta).round().clamp(0.0, 255.0) as u8;
                            }
                        }
                    }
                }
                Transform::ShiftScaleRotate { shift, scale, rotate, p } => {
                    if fires(&mut rng, p) {
                        let dx = symmetric(&mut rng, shift);
                        let dy = symmetric(&mut rng, shift);
                        let s = 1.0 + symmetric(&mut rng, scale);
                        let angle = symmetric(&mut rng, rotate).to_radians();
                        img = affine(&img, dx, dy, s, angle);
                    }
                }
                Transform::GaussianBlur { kernel: (lo, hi), p } => {
                    if fires(&mut rng, p) {
                        let half = rng.gen_range(lo.max(3) / 2..=hi.max(lo).max(3) / 2);
                        let ksize = 2 * half + 1;
                        let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
                        img = image::imageops::blur(&img, sigma);
                    }
                }
                Transform::Normalize { mean, std } => normalize = Some((mean, std)),
            }
        }

        to_tensor(&img, normalize)
    }
}

/// Derive a per-sample seed.
fn mix_seed(seed: u64, index: u64, epoch: u64) -> u64 {
    let mut z = seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ epoch.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn fires(rng: &mut StdRng, p: f64) -> bool {
    rng.gen_bool(p.clamp(0.0, 1.0))
}

fn symmetric(rng: &mut StdRng, limit: f32) -> f32 {
    if limit > 0.0 { rng.gen_range(-limit..=limit) } else { 0.0 }
}

fn to_tensor(img: &RgbImage, normalize: Option<([f32; 3], [f32; 3])>) -> ImageTensor {
    let (width, height) = img.dimensions();
    let (width, height) = (width as usize, height as usize);
    let plane = width * height;
    let mut data = vec![0.0_f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            let raw = f32::from(pixel[c]);
            data[c * plane + i] = match normalize {
                Some((mean, std)) => (raw / 255.0 - mean[c]) / std[c],
                None => raw,
            };
        }
    }
    ImageTensor { channels: 3, height, width, data }
}

fn shift_hsv(img: &mut RgbImage, hue_shift: f32, sat_shift: f32, val_shift: f32) {
    for pixel in img.pixels_mut() {
        let [r, g, b] = pixel.0.map(|v| f32::from(v) / 255.0);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let mut hue = if delta <= f32::EPSILON {
            0.0
        } else if (max - r).abs() <= f32::EPSILON {
            60.0 * ((g - b) / delta).rem_euclid(6.0)
        } else if (max - g).abs() <= f32::EPSILON {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };
        let sat = if max <= f32::EPSILON { 0.0 } else { delta / max };

        // hue shift is in half-degrees
        hue = (hue + hue_shift * 2.0).rem_euclid(360.0);
        let sat = (sat + sat_shift / 255.0).clamp(0.0, 1.0);
        let val = (max + val_shift / 255.0).clamp(0.0, 1.0);

        let chroma = val * sat;
        let x = chroma * (1.0 - ((hue / 60.0).rem_euclid(2.0) - 1.0).abs());
        let m = val - chroma;
        let (r1, g1, b1) = match (hue / 60.0) as u32 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };
        *pixel = Rgb([r1, g1, b1].map(|v| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8));
    }
}

/// Reflect-101 border: `-1 -> 1`, `n -> n - 2`.
fn reflect(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    if m < n { m } else { period - m }
}

/// Rotate by `angle` and scale by `scale` about the centre, then translate by
/// `(dx, dy)` fractions of the image size. Bilinear sampling.
fn affine(img: &RgbImage, dx: f32, dy: f32, scale: f32, angle: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let (w, h) = (width as f32, height as f32);
    let (cx, cy) = ((w - 1.0) / 2.0, (h - 1.0) / 2.0);
    let (sin, cos) = angle.sin_cos();
    let (tx, ty) = (dx * w, dy * h);

    let sample = |x: i64, y: i64, c: usize| -> f32 {
        let xi = reflect(x, i64::from(width));
        let yi = reflect(y, i64::from(height));
        f32::from(img.get_pixel(xi as u32, yi as u32)[c])
    };

    RgbImage::from_fn(width, height, |x, y| {
        // inverse map output -> source
        let ox = (x as f32 - cx - tx) / scale;
        let oy = (y as f32 - cy - ty) / scale;
        let sx = cos * ox + sin * oy + cx;
        let sy = -sin * ox + cos * oy + cy;

        let (x0, y0) = (sx.floor(), sy.floor());
        let (fx, fy) = (sx - x0, sy - y0);
        let (x0, y0) = (x0 as i64, y0 as i64);
        let mut out = [0_u8; 3];
        for (c, slot) in out.iter_mut().enumerate() {
            let top = sample(x0, y0, c) * (1.0 - fx) + sample(x0 + 1, y0, c) * fx;
            let bottom = sample(x0, y0 + 1, c) * (1.0 - fx) + sample(x0 + 1, y0 + 1, c) * fx;
            *slot = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}
