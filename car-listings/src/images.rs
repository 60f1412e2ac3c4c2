//! Listing photo rendering: resize to a fixed canvas, re-encode, inline as a base64 data URI.
//! Decoding and resizing are CPU-bound, so they run on the blocking pool behind a semaphore
//! that caps how many resizes are in flight across the whole process.

use std::{io::Cursor, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::try_join_all;
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use tokio::{sync::Semaphore, task};

use crate::models::{AppError, CarImage, RenderedImage, FALLBACK_CONTENT_TYPE};

pub const CANVAS_WIDTH: u32 = 400;
pub const CANVAS_HEIGHT: u32 = 300;

#[derive(Clone)]
pub struct ImageProcessor {
    permits: Arc<Semaphore>,
    width: u32,
    height: u32,
}

impl ImageProcessor {
    pub fn new(workers: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(workers.max(1))), width: CANVAS_WIDTH, height: CANVAS_HEIGHT }
    }

    pub async fn render(&self, image: &CarImage) -> Result<RenderedImage, AppError> {
        let _permit = self.permits.acquire().await.map_err(|e| AppError::Unknown(e.to_string()))?;
        let data = image.data.clone();
        let content_type = image.content_type.clone();
        let (width, height) = (self.width, self.height);
        let resized = task::spawn_blocking(move || resize_to_canvas(&data, &content_type, width, height))
            .await
            .map_err(|e| AppError::Processing(e.to_string()))??;
        let content_type = display_content_type(&image.content_type, &resized);
        let src = data_uri(&content_type, &resized);
        Ok(RenderedImage { id: image.id, content_type, src })
    }

    /// Render every image of a listing, preserving order. The first failure aborts the listing.
    pub async fn render_all(&self, images: &[CarImage]) -> Result<Vec<RenderedImage>, AppError> {
        try_join_all(images.iter().map(|i| self.render(i))).await
    }
}

/// Uploads stored without a content type are labelled with the format detected from their bytes.
fn display_content_type(stored: &str, bytes: &[u8]) -> String {
    if stored != FALLBACK_CONTENT_TYPE {
        return stored.to_string();
    }
    image::guess_format(bytes).map(|f| f.to_mime_type().to_string()).unwrap_or_else(|_| stored.to_string())
}

/// `data:<content type>;base64,<payload>`
pub fn data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

/// Decode, cover-resize to `width`×`height` (cropping the overflow) and re-encode in the source format.
pub fn resize_to_canvas(bytes: &[u8], content_type: &str, width: u32, height: u32) -> Result<Vec<u8>, AppError> {
    let format = image::guess_format(bytes)
        .ok()
        .or_else(|| ImageFormat::from_mime_type(content_type))
        .ok_or_else(|| AppError::Processing(format!("unrecognized image data ({})", content_type)))?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let mut resized = decoded.resize_to_fill(width, height, FilterType::Triangle);
    // JPEG has no alpha channel.
    if format == ImageFormat::Jpeg {
        resized = DynamicImage::ImageRgb8(resized.to_rgb8());
    }
    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, format)?;
    Ok(out.into_inner())
}
