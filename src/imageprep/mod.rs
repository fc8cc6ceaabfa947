//! Submission-time image preprocessing
//!
//! Every admitted image passes through here before moderation and
//! enqueueing: the format is sniffed from magic bytes (the declared
//! content type is never trusted), the embedded EXIF orientation is
//! applied, the longest side is capped at 2048 px, and the pixels are
//! re-encoded as a bare JPEG (quality 85, no subsampling), which drops all
//! embedded metadata. The applied operations are recorded on the job.

mod orientation;

pub use orientation::exif_orientation;

use image::metadata::Orientation;
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use thiserror::Error;

use crate::api::models::PreprocessSummary;

pub const MAX_SIDE_PX: u32 = 2048;
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum PrepError {
    #[error("unrecognized image format")]
    UnrecognizedFormat,

    #[error("image decode failed: {0}")]
    Decode(String),

    #[error("image encode failed: {0}")]
    Encode(String),
}

/// Image formats accepted for submission, identified by magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    Jpeg,
    Png,
    Webp,
}

impl SniffedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SniffedFormat::Jpeg => "jpeg",
            SniffedFormat::Png => "png",
            SniffedFormat::Webp => "webp",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            SniffedFormat::Jpeg => ImageFormat::Jpeg,
            SniffedFormat::Png => ImageFormat::Png,
            SniffedFormat::Webp => ImageFormat::WebP,
        }
    }
}

/// Magic-byte sniffing; returns None for anything but JPEG/PNG/WebP.
pub fn sniff_format(bytes: &[u8]) -> Option<SniffedFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(SniffedFormat::Jpeg);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(SniffedFormat::Png);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(SniffedFormat::Webp);
    }
    None
}

/// Normalized submission image: oriented, bounded, metadata-free JPEG
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub source_format: SniffedFormat,
    pub operations: Vec<String>,
}

impl PreparedImage {
    pub fn summary(&self) -> PreprocessSummary {
        PreprocessSummary {
            source_format: self.source_format.as_str().to_string(),
            width: self.width,
            height: self.height,
            operations: self.operations.clone(),
            color_profile: "srgb".to_string(),
        }
    }
}

pub fn prepare(bytes: &[u8]) -> Result<PreparedImage, PrepError> {
    prepare_bounded(bytes, MAX_SIDE_PX)
}

pub fn prepare_bounded(bytes: &[u8], max_side: u32) -> Result<PreparedImage, PrepError> {
    let format = sniff_format(bytes).ok_or(PrepError::UnrecognizedFormat)?;
    let mut operations = Vec::new();

    let mut img = image::load_from_memory_with_format(bytes, format.image_format())
        .map_err(|e| PrepError::Decode(e.to_string()))?;

    if format == SniffedFormat::Jpeg {
        if let Some(raw) = exif_orientation(bytes) {
            if let Some(o) = Orientation::from_exif(raw as u8) {
                if o != Orientation::NoTransforms {
                    img.apply_orientation(o);
                    operations.push(format!("auto-orient:{raw}"));
                }
            }
        }
    }

    if img.width().max(img.height()) > max_side {
        img = img.resize(max_side, max_side, FilterType::Lanczos3);
        operations.push(format!("resize:{}x{}", img.width(), img.height()));
    }

    let jpeg = encode_jpeg(&img)?;
    operations.push(format!("re-encode:jpeg-q{JPEG_QUALITY}-444"));
    operations.push("strip-metadata".to_string());

    Ok(PreparedImage {
        width: img.width(),
        height: img.height(),
        jpeg,
        source_format: format,
        operations,
    })
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, PrepError> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    // RGB8 drops any alpha channel; the encoder writes 1x1 sampling (4:4:4)
    // and no metadata segments.
    encoder
        .encode_image(&img.to_rgb8())
        .map_err(|e| PrepError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn sniffs_by_magic_bytes_not_extension() {
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(SniffedFormat::Jpeg));
        assert_eq!(sniff_format(&png_bytes(2, 2)), Some(SniffedFormat::Png));
        let webp_header = b"RIFF\x00\x00\x00\x00WEBPVP8 ";
        assert_eq!(sniff_format(webp_header), Some(SniffedFormat::Webp));
        assert_eq!(sniff_format(b"GIF89a"), None);
        assert_eq!(sniff_format(b""), None);
    }

    #[test]
    fn output_is_jpeg_and_metadata_free() {
        let prepared = prepare(&png_bytes(64, 48)).unwrap();
        assert_eq!(sniff_format(&prepared.jpeg), Some(SniffedFormat::Jpeg));
        assert_eq!(prepared.width, 64);
        assert_eq!(prepared.height, 48);
        // Re-encode produces no APP1 segment, so no orientation survives
        assert_eq!(exif_orientation(&prepared.jpeg), None);
        assert!(prepared.operations.iter().any(|op| op == "strip-metadata"));
    }

    #[test]
    fn oversized_images_shrink_to_bound() {
        let prepared = prepare_bounded(&png_bytes(400, 100), 200).unwrap();
        assert_eq!(prepared.width, 200);
        assert_eq!(prepared.height, 50);
        assert!(prepared.operations.iter().any(|op| op.starts_with("resize:")));
    }

    #[test]
    fn small_images_are_not_resized() {
        let prepared = prepare_bounded(&png_bytes(100, 80), 200).unwrap();
        assert_eq!((prepared.width, prepared.height), (100, 80));
        assert!(!prepared.operations.iter().any(|op| op.starts_with("resize:")));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(prepare(b"not an image"), Err(PrepError::UnrecognizedFormat)));
    }

    #[test]
    fn summary_reports_srgb() {
        let summary = prepare(&png_bytes(10, 10)).unwrap().summary();
        assert_eq!(summary.color_profile, "srgb");
        assert_eq!(summary.source_format, "png");
    }
}
