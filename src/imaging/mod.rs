//! Image decoding, square letterboxing and re-encoding shared by the upload
//! path, the messaging pack builder and the background-removal tool.

pub mod background;

use std::io::Cursor;

use image::{
    imageops::{self, FilterType},
    DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

pub const THUMBNAIL_SIZE: u32 = 256;
const DISPLAY_WEBP_QUALITY: f32 = 90.0;
const TRANSPARENCY_SAMPLE_SIZE: u32 = 100;
const TRANSPARENCY_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Webp,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Png
    }
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
        }
    }
}

pub fn decode(data: &[u8]) -> AppResult<DynamicImage> {
    let image = image::load_from_memory(data)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(AppError::Validation(format!(
            "Invalid image dimensions: {}x{}",
            width, height
        )));
    }
    Ok(image)
}

/// Lowercase extension of the container format, sniffed from the bytes.
pub fn sniff_extension(data: &[u8]) -> Option<&'static str> {
    let format = image::guess_format(data).ok()?;
    let ext = match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Gif => "gif",
        ImageFormat::WebP => "webp",
        ImageFormat::Bmp => "bmp",
        _ => return None,
    };
    Some(ext)
}

/// Scales `image` to fit inside a `size`×`size` square, keeping its aspect
/// ratio, and centers it on a fully transparent canvas.
pub fn letterbox(image: &DynamicImage, size: u32) -> RgbaImage {
    let size = size.max(1);
    let (width, height) = image.dimensions();
    let (fit_width, fit_height) = fit_within(width, height, size);

    let resized = image
        .resize_exact(fit_width, fit_height, FilterType::Lanczos3)
        .to_rgba8();

    let mut canvas = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 0]));
    let x = (size - fit_width) / 2;
    let y = (size - fit_height) / 2;
    imageops::replace(&mut canvas, &resized, x as i64, y as i64);
    canvas
}

fn fit_within(width: u32, height: u32, size: u32) -> (u32, u32) {
    let longest = width.max(height).max(1) as f64;
    let scale = size as f64 / longest;
    let fit = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, size);
    (fit(width), fit(height))
}

pub fn encode(image: &RgbaImage, format: OutputFormat, quality: f32) -> AppResult<Vec<u8>> {
    match format {
        OutputFormat::Png => {
            let mut buffer = Cursor::new(Vec::new());
            image.write_to(&mut buffer, ImageFormat::Png)?;
            Ok(buffer.into_inner())
        }
        OutputFormat::Webp => Ok(encode_webp(image, quality)),
    }
}

/// Lossy WebP at the given quality (0-100).
pub fn encode_webp(image: &RgbaImage, quality: f32) -> Vec<u8> {
    let encoder = webp::Encoder::from_rgba(image.as_raw(), image.width(), image.height());
    encoder.encode(quality.clamp(0.0, 100.0)).to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransparencyReport {
    pub sampled_pixels: u64,
    pub transparent_pixels: u64,
    pub ratio: f64,
    pub transparent: bool,
}

/// Heuristic check for an image whose background was already removed:
/// samples a downscaled copy and counts pixels that are not fully opaque.
pub fn looks_transparent(image: &DynamicImage) -> TransparencyReport {
    if !image.color().has_alpha() {
        let (width, height) = image.dimensions();
        let sampled = fit_within(width, height, TRANSPARENCY_SAMPLE_SIZE);
        return TransparencyReport {
            sampled_pixels: sampled.0 as u64 * sampled.1 as u64,
            transparent_pixels: 0,
            ratio: 0.0,
            transparent: false,
        };
    }

    let sample = image
        .thumbnail(TRANSPARENCY_SAMPLE_SIZE, TRANSPARENCY_SAMPLE_SIZE)
        .to_rgba8();
    let sampled_pixels = sample.width() as u64 * sample.height() as u64;
    let transparent_pixels = sample.pixels().filter(|p| p.0[3] < 255).count() as u64;
    let ratio = if sampled_pixels == 0 {
        0.0
    } else {
        transparent_pixels as f64 / sampled_pixels as f64
    };

    TransparencyReport {
        sampled_pixels,
        transparent_pixels,
        ratio,
        transparent: ratio > TRANSPARENCY_THRESHOLD,
    }
}

/// Everything the catalog stores for a freshly uploaded image.
#[derive(Debug, Clone)]
pub struct PreparedAssets {
    pub source_extension: &'static str,
    pub width: u32,
    pub height: u32,
    pub display_webp: Vec<u8>,
    pub thumbnail_webp: Vec<u8>,
}

pub fn prepare_assets(data: &[u8]) -> AppResult<PreparedAssets> {
    let source_extension = sniff_extension(data)
        .ok_or_else(|| AppError::Validation("Unsupported image format".to_string()))?;
    let image = decode(data)?;
    let (width, height) = image.dimensions();

    let display_webp = encode_webp(&image.to_rgba8(), DISPLAY_WEBP_QUALITY);
    let thumbnail = letterbox(&image, THUMBNAIL_SIZE);
    let thumbnail_webp = encode_webp(&thumbnail, DISPLAY_WEBP_QUALITY);

    Ok(PreparedAssets {
        source_extension,
        width,
        height,
        display_webp,
        thumbnail_webp,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn png_bytes(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, pixel);
        encode(&image, OutputFormat::Png, 100.0).expect("encode png")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::png_bytes;
    use super::*;

    #[test]
    fn letterbox_centers_wide_image() {
        let wide = DynamicImage::ImageRgba8(RgbaImage::from_pixel(200, 100, Rgba([255, 0, 0, 255])));
        let boxed = letterbox(&wide, 512);

        assert_eq!(boxed.dimensions(), (512, 512));
        // 200x100 scales to 512x256, leaving 128px bands above and below.
        assert_eq!(boxed.get_pixel(256, 10).0[3], 0);
        assert_eq!(boxed.get_pixel(256, 500).0[3], 0);
        let center = boxed.get_pixel(256, 256).0;
        assert!(center[0] > 250 && center[3] == 255);
        assert_eq!(boxed.get_pixel(5, 256).0[3], 255);
    }

    #[test]
    fn letterbox_centers_tall_image() {
        let tall = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 40, Rgba([0, 0, 255, 255])));
        let boxed = letterbox(&tall, 96);

        assert_eq!(boxed.dimensions(), (96, 96));
        assert_eq!(boxed.get_pixel(2, 48).0[3], 0);
        assert_eq!(boxed.get_pixel(48, 48).0[3], 255);
    }

    #[test]
    fn fit_within_never_returns_zero() {
        assert_eq!(fit_within(1000, 1, 512), (512, 1));
        assert_eq!(fit_within(64, 64, 512), (512, 512));
    }

    #[test]
    fn opaque_image_is_not_transparent() {
        let opaque = DynamicImage::ImageRgba8(RgbaImage::from_pixel(300, 300, Rgba([9, 9, 9, 255])));
        let report = looks_transparent(&opaque);
        assert_eq!(report.transparent_pixels, 0);
        assert!(!report.transparent);
        assert_eq!(report.sampled_pixels, 100 * 100);
    }

    #[test]
    fn mostly_clear_image_is_transparent() {
        let mut image = RgbaImage::from_pixel(50, 50, Rgba([0, 0, 0, 0]));
        for x in 20..30 {
            for y in 20..30 {
                image.put_pixel(x, y, Rgba([200, 10, 10, 255]));
            }
        }
        let report = looks_transparent(&DynamicImage::ImageRgba8(image));
        assert!(report.transparent);
        assert!(report.ratio > 0.9);
    }

    #[test]
    fn rgb_image_skips_sampling() {
        let rgb = DynamicImage::ImageRgb8(image::RgbImage::new(20, 20));
        assert!(!looks_transparent(&rgb).transparent);
    }

    #[test]
    fn prepare_assets_reads_dimensions_and_format() {
        let png = png_bytes(64, 32, Rgba([10, 200, 30, 255]));
        let assets = prepare_assets(&png).unwrap();

        assert_eq!(assets.source_extension, "png");
        assert_eq!((assets.width, assets.height), (64, 32));
        assert_eq!(sniff_extension(&assets.display_webp), Some("webp"));

        let thumb = decode(&assets.thumbnail_webp).unwrap();
        assert_eq!(thumb.dimensions(), (THUMBNAIL_SIZE, THUMBNAIL_SIZE));
    }

    #[test]
    fn prepare_assets_rejects_garbage() {
        assert!(matches!(
            prepare_assets(b"not an image"),
            Err(AppError::Validation(_))
        ));
    }
}
