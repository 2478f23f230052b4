//! Grayscale preprocessing steps used by the detection ladder.

use groundmap_core::GrayImage;
use serde::{Deserialize, Serialize};

/// One preprocessing step applied before pattern detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preprocess {
    #[default]
    None,
    /// Global histogram equalization.
    Equalize,
    /// Min/max contrast stretch to the full 0..=255 range.
    Stretch,
    /// Gaussian blur with an odd kernel size; 0 or 1 disables it.
    Blur { kernel: usize },
}

impl Preprocess {
    pub fn apply(&self, img: &GrayImage) -> GrayImage {
        match *self {
            Self::None => img.clone(),
            Self::Equalize => equalize_histogram(img),
            Self::Stretch => stretch_contrast(img),
            Self::Blur { kernel } => gaussian_blur(img, kernel),
        }
    }
}

pub fn equalize_histogram(img: &GrayImage) -> GrayImage {
    let mut hist = [0usize; 256];
    for &v in &img.data {
        hist[v as usize] += 1;
    }
    let total = img.data.len();
    let first = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == 0 || total == first {
        return img.clone();
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0usize;
    let scale = 255.0 / (total - first) as f64;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[level] = (cdf.saturating_sub(first) as f64 * scale).round().clamp(0.0, 255.0) as u8;
    }
    GrayImage {
        width: img.width,
        height: img.height,
        data: img.data.iter().map(|&v| lut[v as usize]).collect(),
    }
}

pub fn stretch_contrast(img: &GrayImage) -> GrayImage {
    let (Some(&lo), Some(&hi)) = (img.data.iter().min(), img.data.iter().max()) else {
        return img.clone();
    };
    if hi == lo {
        return img.clone();
    }
    let scale = 255.0 / (hi - lo) as f32;
    GrayImage {
        width: img.width,
        height: img.height,
        data: img
            .data
            .iter()
            .map(|&v| ((v - lo) as f32 * scale).round() as u8)
            .collect(),
    }
}

fn gaussian_kernel(size: usize) -> Vec<f32> {
    // OpenCV's sigma for a given aperture
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as i32;
    let mut k: Vec<f32> = (-half..=half)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    k.iter_mut().for_each(|v| *v /= sum);
    k
}

/// Separable Gaussian blur with replicated borders.
///
/// Even kernel sizes are rounded up to the next odd size.
pub fn gaussian_blur(img: &GrayImage, kernel: usize) -> GrayImage {
    if kernel <= 1 || img.is_empty() {
        return img.clone();
    }
    let size = kernel | 1;
    let k = gaussian_kernel(size);
    let half = (size / 2) as isize;
    let (w, h) = (img.width, img.height);
    let clamp = |v: isize, n: usize| v.clamp(0, n as isize - 1) as usize;

    let mut tmp = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, &kv) in k.iter().enumerate() {
                let sx = clamp(x as isize + i as isize - half, w);
                acc += kv * img.data[y * w + sx] as f32;
            }
            tmp[y * w + x] = acc;
        }
    }

    let mut data = vec![0u8; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, &kv) in k.iter().enumerate() {
                let sy = clamp(y as isize + i as isize - half, h);
                acc += kv * tmp[sy * w + x];
            }
            data[y * w + x] = acc.round().clamp(0.0, 255.0) as u8;
        }
    }
    GrayImage {
        width: w,
        height: h,
        data,
    }
}
