use crate::types::{DisplayTensor, FusionError, FusionOutcome};
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use ndarray::Array3;
use std::io::Cursor;

/// Stored renditions of a cached result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Derivative {
    /// Full resolution
    Full,
    /// Bounded by the thumbnail size
    Thumbnail,
    /// Bounded by the preview size
    Preview,
}

impl Derivative {
    pub const ALL: [Derivative; 3] = [Derivative::Full, Derivative::Thumbnail, Derivative::Preview];

    /// Subdirectory of the cache root holding this derivative
    pub fn dir_name(&self) -> &'static str {
        match self {
            Derivative::Full => "full",
            Derivative::Thumbnail => "thumb",
            Derivative::Preview => "preview",
        }
    }
}

/// `(3, height, width)` tensor to an RGB image
pub fn tensor_to_image(tensor: &DisplayTensor) -> FusionOutcome<RgbImage> {
    let (bands, height, width) = tensor.dim();
    if bands != 3 {
        return Err(FusionError::RenderFailed(format!(
            "Expected 3 bands, got {}",
            bands
        )));
    }
    if height == 0 || width == 0 {
        return Err(FusionError::RenderFailed("Empty image".to_string()));
    }

    let mut raw = Vec::with_capacity(3 * height * width);
    for i in 0..height {
        for j in 0..width {
            raw.extend_from_slice(&[tensor[[0, i, j]], tensor[[1, i, j]], tensor[[2, i, j]]]);
        }
    }
    RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| FusionError::RenderFailed("Pixel buffer size mismatch".to_string()))
}

/// RGB image back to a `(3, height, width)` tensor
pub fn image_to_tensor(img: &RgbImage) -> DisplayTensor {
    let (width, height) = img.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, i, j)| {
        img.get_pixel(j as u32, i as u32)[c]
    })
}

pub fn encode_png(img: &RgbImage) -> FusionOutcome<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

pub fn decode_png(bytes: &[u8]) -> FusionOutcome<RgbImage> {
    let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
    Ok(img.to_rgb8())
}

/// Downscale so the longer edge is at most `max_dim`, keeping aspect ratio
///
/// Images already within the bound are returned as is.
pub fn derivative(img: &RgbImage, max_dim: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    let longest = width.max(height);
    if max_dim == 0 || longest <= max_dim {
        return img.clone();
    }
    let scale = max_dim as f64 / longest as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    image::imageops::resize(img, new_w, new_h, FilterType::Lanczos3)
}
