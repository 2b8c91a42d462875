//! Gradient mapping
//!
//! The gradient image is resampled to a single 256-pixel row. Each input
//! pixel's luminance (BT.601 weights, truncated to `u8`) indexes that row;
//! the looked-up color replaces RGB while the input alpha is kept.

use crate::descriptor::{OutputFormat, Quality, TaskDescriptor};
use crate::transform::{Transform, TransformError};
use image::buffer::ConvertBuffer;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage, Rgba, RgbaImage};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Entries in a gradient lookup row
pub const LUT_SIZE: usize = 256;

/// Lookup row indexed by luminance
pub type Lut = [Rgb<u8>; LUT_SIZE];

/// Resample `gradient` into a 256-entry lookup row (Lanczos3)
pub fn gradient_lut(gradient: &DynamicImage) -> Lut {
    let row = imageops::resize(&gradient.to_rgb8(), LUT_SIZE as u32, 1, FilterType::Lanczos3);

    let mut lut = [Rgb([0, 0, 0]); LUT_SIZE];
    for (x, entry) in lut.iter_mut().enumerate() {
        *entry = *row.get_pixel(x as u32, 0);
    }
    lut
}

#[inline]
fn luminance(Rgba([r, g, b, _]): Rgba<u8>) -> u8 {
    (r as f64 * 0.299 + g as f64 * 0.587 + b as f64 * 0.114) as u8
}

/// Map every pixel of `base` through `lut`, preserving alpha
pub fn apply_lut(base: &RgbaImage, lut: &Lut) -> RgbaImage {
    let mut out = RgbaImage::new(base.width(), base.height());
    for (src, dst) in base.pixels().zip(out.pixels_mut()) {
        let Rgb([r, g, b]) = lut[luminance(*src) as usize];
        *dst = Rgba([r, g, b, src[3]]);
    }
    out
}

/// The shipped transform: file in, gradient-mapped file out
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientMapTransform;

impl GradientMapTransform {
    pub fn new() -> Self {
        Self
    }
}

impl Transform for GradientMapTransform {
    fn apply(&self, task: &TaskDescriptor) -> Result<String, TransformError> {
        let base = image::open(task.input())?.to_rgba8();
        let lut = gradient_lut(&image::open(task.gradient())?);

        let mapped = apply_lut(&base, &lut);
        encode(&mapped, task.output(), task.format(), task.quality())?;

        debug!(
            "Mapped {} through {} -> {}",
            task.input_name(),
            task.gradient().display(),
            task.output().display()
        );
        Ok(format!("Created: {}", task.output_name()))
    }
}

fn encode(
    image: &RgbaImage,
    path: &Path,
    format: OutputFormat,
    quality: Quality,
) -> Result<(), TransformError> {
    let (width, height) = image.dimensions();
    let mut writer = BufWriter::new(File::create(path)?);

    match format {
        OutputFormat::Png => {
            PngEncoder::new_with_quality(&mut writer, CompressionType::Best, PngFilter::Adaptive)
                .write_image(image.as_raw(), width, height, ExtendedColorType::Rgba8)?;
        }
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb: RgbImage = image.convert();
            JpegEncoder::new_with_quality(&mut writer, quality.get()).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )?;
        }
        OutputFormat::Webp => {
            // Only lossless WebP encoding is available; quality does not apply
            WebPEncoder::new_lossless(&mut writer).write_image(
                image.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )?;
        }
    }

    writer.flush()?;
    Ok(())
}
