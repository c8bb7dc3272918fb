use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use image::{DynamicImage, Rgba, RgbaImage};
use serde::Serialize;

use super::{decode, encode, letterbox, OutputFormat};
use crate::{
    error::{AppError, AppResult},
    storage::fetch::ImageFetcher,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovalProgress {
    pub stage: &'static str,
    pub current: u64,
    pub total: u64,
}

pub type ProgressFn<'a> = &'a (dyn Fn(RemovalProgress) + Send + Sync);

/// A segmentation engine that clears the background of an image.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &'static str;

    async fn remove(&self, image: RgbaImage, progress: ProgressFn<'_>) -> AppResult<RgbaImage>;
}

/// Treats the dominant border colour as background and clears every pixel
/// connected to the border whose colour is within `tolerance` of it.
#[derive(Debug, Clone, Copy)]
pub struct EdgeColorRemover {
    pub tolerance: u8,
}

impl Default for EdgeColorRemover {
    fn default() -> Self {
        Self { tolerance: 32 }
    }
}

#[async_trait]
impl BackgroundRemover for EdgeColorRemover {
    fn name(&self) -> &'static str {
        "edge-color"
    }

    async fn remove(&self, image: RgbaImage, progress: ProgressFn<'_>) -> AppResult<RgbaImage> {
        let total = image.width() as u64 * image.height() as u64;
        progress(RemovalProgress {
            stage: "sampling",
            current: 0,
            total,
        });

        let tolerance = self.tolerance;
        let (image, cleared) = tokio::task::spawn_blocking(move || {
            let mut image = image;
            let cleared = match border_color(&image) {
                Some(background) => flood_clear(&mut image, background, tolerance),
                None => 0,
            };
            (image, cleared)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Background removal task failed: {}", e))?;

        progress(RemovalProgress {
            stage: "masking",
            current: cleared,
            total,
        });

        Ok(image)
    }
}

/// Mean colour of the opaque border pixels.
fn border_color(image: &RgbaImage) -> Option<[u8; 3]> {
    let (width, height) = image.dimensions();
    let mut sum = [0u64; 3];
    let mut count = 0u64;

    for (x, y) in border_coords(width, height) {
        let p = image.get_pixel(x, y).0;
        if p[3] == 0 {
            continue;
        }
        for c in 0..3 {
            sum[c] += p[c] as u64;
        }
        count += 1;
    }

    if count == 0 {
        return None;
    }
    Some([
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
    ])
}

fn border_coords(width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    let top_bottom = (0..width).flat_map(move |x| [(x, 0), (x, height.saturating_sub(1))]);
    let sides = (1..height.saturating_sub(1)).flat_map(move |y| [(0, y), (width.saturating_sub(1), y)]);
    top_bottom.chain(sides)
}

fn close_to(pixel: &Rgba<u8>, background: [u8; 3], tolerance: u8) -> bool {
    pixel.0[3] > 0
        && (0..3).all(|c| pixel.0[c].abs_diff(background[c]) <= tolerance)
}

/// Breadth-first fill from the border; returns the number of cleared pixels.
fn flood_clear(image: &mut RgbaImage, background: [u8; 3], tolerance: u8) -> u64 {
    let (width, height) = image.dimensions();
    let mut visited = vec![false; width as usize * height as usize];
    let mut queue = VecDeque::new();
    let index = |x: u32, y: u32| y as usize * width as usize + x as usize;

    for (x, y) in border_coords(width, height) {
        if !visited[index(x, y)] && close_to(image.get_pixel(x, y), background, tolerance) {
            visited[index(x, y)] = true;
            queue.push_back((x, y));
        }
    }

    let mut cleared = 0u64;
    while let Some((x, y)) = queue.pop_front() {
        image.put_pixel(x, y, Rgba([0, 0, 0, 0]));
        cleared += 1;

        let neighbours = [
            (x.wrapping_sub(1), y),
            (x + 1, y),
            (x, y.wrapping_sub(1)),
            (x, y + 1),
        ];
        for (nx, ny) in neighbours {
            if nx >= width || ny >= height || visited[index(nx, ny)] {
                continue;
            }
            if close_to(image.get_pixel(nx, ny), background, tolerance) {
                visited[index(nx, ny)] = true;
                queue.push_back((nx, ny));
            }
        }
    }

    cleared
}

/// Where the image to process comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Url(String),
    Bytes(Bytes),
    /// `data:<mime>;base64,<payload>`
    DataUrl(String),
}

impl ImageSource {
    pub async fn load(&self, fetcher: &dyn ImageFetcher) -> AppResult<Bytes> {
        match self {
            ImageSource::Url(url) => fetcher.fetch(url).await,
            ImageSource::Bytes(data) => Ok(data.clone()),
            ImageSource::DataUrl(data_url) => decode_data_url(data_url),
        }
    }
}

fn decode_data_url(data_url: &str) -> AppResult<Bytes> {
    let (header, payload) = data_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .ok_or_else(|| AppError::BadRequest("Malformed data URL".to_string()))?;

    if !header.ends_with(";base64") {
        return Err(AppError::BadRequest(
            "Only base64 data URLs are supported".to_string(),
        ));
    }

    BASE64
        .decode(payload.trim())
        .map(Bytes::from)
        .map_err(|_| AppError::BadRequest("Invalid base64 payload".to_string()))
}

#[derive(Debug, Clone, Copy)]
pub struct RemovalOptions {
    pub size: u32,
    pub format: OutputFormat,
    pub quality: f32,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        Self {
            size: 512,
            format: OutputFormat::Png,
            quality: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedImage {
    #[serde(skip)]
    pub data: Bytes,
    pub engine: &'static str,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub original_size: usize,
    pub processed_size: usize,
    pub elapsed_ms: u64,
}

/// Loads `source`, strips its background with `remover`, then letterboxes the
/// result into an `options.size` square and re-encodes it.
pub async fn remove_background(
    source: &ImageSource,
    fetcher: &dyn ImageFetcher,
    remover: &dyn BackgroundRemover,
    options: RemovalOptions,
    progress: ProgressFn<'_>,
) -> AppResult<ProcessedImage> {
    let started_at = Instant::now();

    let original = source.load(fetcher).await?;
    let original_size = original.len();
    progress(RemovalProgress {
        stage: "loaded",
        current: original_size as u64,
        total: original_size as u64,
    });

    let decoded = decode(&original)?.to_rgba8();
    let segmented = remover.remove(decoded, progress).await?;

    let size = options.size;
    let format = options.format;
    let quality = options.quality;
    let encoded = tokio::task::spawn_blocking(move || {
        let boxed = letterbox(&DynamicImage::ImageRgba8(segmented), size);
        encode(&boxed, format, quality)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Encoding task failed: {}", e))??;

    let processed_size = encoded.len();
    progress(RemovalProgress {
        stage: "encoded",
        current: processed_size as u64,
        total: processed_size as u64,
    });

    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    tracing::debug!(
        "Background removed with {}: {} -> {} bytes in {}ms",
        remover.name(),
        original_size,
        processed_size,
        elapsed_ms
    );

    Ok(ProcessedImage {
        data: Bytes::from(encoded),
        engine: remover.name(),
        format,
        width: size.max(1),
        height: size.max(1),
        original_size,
        processed_size,
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::GenericImageView;

    use super::*;
    use crate::imaging::{looks_transparent, test_support::png_bytes};
    use crate::storage::fetch::test_support::StaticFetcher;

    fn framed_square() -> RgbaImage {
        // White background with a red 20x20 square in the middle.
        let mut image = RgbaImage::from_pixel(60, 60, Rgba([255, 255, 255, 255]));
        for x in 20..40 {
            for y in 20..40 {
                image.put_pixel(x, y, Rgba([220, 20, 20, 255]));
            }
        }
        image
    }

    #[tokio::test]
    async fn edge_color_remover_clears_background_only() {
        let remover = EdgeColorRemover::default();
        let out = remover.remove(framed_square(), &|_| {}).await.unwrap();

        assert_eq!(out.get_pixel(0, 0).0[3], 0);
        assert_eq!(out.get_pixel(10, 50).0[3], 0);
        assert_eq!(out.get_pixel(30, 30).0, [220, 20, 20, 255]);
    }

    #[test]
    fn enclosed_background_colour_is_kept() {
        // A white hole inside the red square is not connected to the border.
        let mut image = framed_square();
        image.put_pixel(30, 30, Rgba([255, 255, 255, 255]));

        let cleared = flood_clear(&mut image, [255, 255, 255], 10);
        assert_eq!(cleared, 60 * 60 - 20 * 20);
        assert_eq!(image.get_pixel(30, 30).0[3], 255);
    }

    #[test]
    fn fully_transparent_border_has_no_colour() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        assert_eq!(border_color(&image), None);
    }

    #[test]
    fn data_url_decoding() {
        let png = png_bytes(2, 2, Rgba([1, 2, 3, 255]));
        let url = format!("data:image/png;base64,{}", BASE64.encode(&png));
        assert_eq!(decode_data_url(&url).unwrap().as_ref(), png.as_slice());

        assert!(decode_data_url("data:image/png,rawbytes").is_err());
        assert!(decode_data_url("https://example.com/a.png").is_err());
    }

    #[tokio::test]
    async fn remove_background_reports_metadata_and_progress() {
        let mut source = Vec::new();
        DynamicImage::ImageRgba8(framed_square())
            .write_to(&mut std::io::Cursor::new(&mut source), image::ImageFormat::Png)
            .unwrap();
        let fetcher = StaticFetcher::default().with("https://cdn.test/kermit.png", source.clone());
        let stages = Mutex::new(Vec::new());

        let processed = remove_background(
            &ImageSource::Url("https://cdn.test/kermit.png".to_string()),
            &fetcher,
            &EdgeColorRemover::default(),
            RemovalOptions {
                size: 128,
                format: OutputFormat::Png,
                quality: 90.0,
            },
            &|p| stages.lock().unwrap().push(p.stage),
        )
        .await
        .unwrap();

        assert_eq!(processed.original_size, source.len());
        assert_eq!(processed.processed_size, processed.data.len());
        assert_eq!((processed.width, processed.height), (128, 128));
        assert_eq!(
            *stages.lock().unwrap(),
            vec!["loaded", "sampling", "masking", "encoded"]
        );

        let output = decode(&processed.data).unwrap();
        assert_eq!(output.dimensions(), (128, 128));
        assert!(looks_transparent(&output).transparent);
    }

    #[tokio::test]
    async fn remove_background_propagates_fetch_failure() {
        let fetcher = StaticFetcher::default();
        let result = remove_background(
            &ImageSource::Url("https://cdn.test/missing.png".to_string()),
            &fetcher,
            &EdgeColorRemover::default(),
            RemovalOptions::default(),
            &|_| {},
        )
        .await;

        assert!(matches!(result, Err(AppError::Fetch(_))));
    }
}
