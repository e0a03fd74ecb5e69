//! Fingerprint image loading and normalization.
//!
//! Every tensor leaving this module has shape `(size, size, 1)` and values
//! in [0, 1], whatever the bit depth of the source scan.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use ndarray::Array3;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("cannot load image {path}: {source}")]
pub struct ImageLoadError {
    pub path: PathBuf,
    #[source]
    pub source: image::ImageError,
}

/// Square single-channel intensity tensor, `(size, size, 1)`, values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
    data: Array3<f32>,
}

impl NormalizedTensor {
    /// Side length of the square tensor.
    pub fn size(&self) -> usize {
        self.data.dim().0
    }

    pub fn as_array(&self) -> &Array3<f32> {
        &self.data
    }

    /// Largest element-wise difference to another tensor of the same shape.
    pub fn max_abs_diff(&self, other: &NormalizedTensor) -> f32 {
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

/// Load a fingerprint scan from disk and normalize it to `size × size`.
pub fn load_fingerprint(path: &Path, size: usize) -> Result<NormalizedTensor, ImageLoadError> {
    let img = image::open(path).map_err(|source| ImageLoadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(normalize_image(&img, size))
}

/// Grayscale, depth-normalize, resize, and scale a decoded image.
pub fn normalize_image(img: &DynamicImage, size: usize) -> NormalizedTensor {
    let gray = to_gray8(img);
    let side = size as u32;
    let resized = image::imageops::resize(&gray, side, side, FilterType::Triangle);

    let data = Array3::from_shape_fn((size, size, 1), |(y, x, _)| {
        resized.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
    });

    NormalizedTensor { data }
}

/// Reduce to one 8-bit luminance channel.
///
/// Sources deeper than 8 bits per channel are min-max stretched first so a
/// 16-bit scan that only occupies a narrow band does not render near-black.
fn to_gray8(img: &DynamicImage) -> GrayImage {
    let color = img.color();
    let bits_per_channel = color.bits_per_pixel() / u16::from(color.channel_count());
    if bits_per_channel <= 8 {
        img.to_luma8()
    } else {
        stretch_to_u8(&img.to_luma16())
    }
}

/// Min-max stretch a 16-bit luminance image onto [0, 255].
///
/// A constant image maps to all zeros.
pub fn stretch_to_u8(gray: &ImageBuffer<Luma<u16>, Vec<u16>>) -> GrayImage {
    let (min, max) = gray
        .pixels()
        .fold((u16::MAX, u16::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let range = f32::from(max.saturating_sub(min));

    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if range == 0.0 {
            return Luma([0]);
        }
        let v = f32::from(gray.get_pixel(x, y)[0] - min);
        Luma([(v * 255.0 / range).round().clamp(0.0, 255.0) as u8])
    })
}
