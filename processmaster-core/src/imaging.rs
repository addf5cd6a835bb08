//! Screenshot normalization: decode, fit inside a bounding box, re-encode as PNG.
//!
//! Decoding and resampling are CPU-bound; async callers should run
//! [`normalize_screenshot`] through `tokio::task::spawn_blocking`.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Unsupported or corrupt image: {0}")]
    Decode(String),

    #[error("Failed to encode PNG: {0}")]
    Encode(String),

    #[error("Empty image payload")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// True when the source exceeded the bounds and was downscaled.
    pub resized: bool,
}

impl NormalizedImage {
    pub const MIME_TYPE: &'static str = "image/png";
}

/// Decode `bytes`, shrink to fit within `max_width` x `max_height` keeping the
/// aspect ratio (never enlarging), and encode the result as PNG.
pub fn normalize_screenshot(
    bytes: &[u8],
    max_width: u32,
    max_height: u32,
) -> Result<NormalizedImage, ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Empty);
    }

    let img = image::load_from_memory(bytes).map_err(|e| ImageError::Decode(e.to_string()))?;
    let (w, h) = img.dimensions();

    let (img, resized) = if w > max_width || h > max_height {
        (img.resize(max_width, max_height, FilterType::Lanczos3), true)
    } else {
        (img, false)
    };

    let (width, height) = img.dimensions();
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;

    Ok(NormalizedImage {
        bytes: out,
        width,
        height,
        resized,
    })
}

/// MIME type from magic bytes, for images handed to the vision model as-is.
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}
