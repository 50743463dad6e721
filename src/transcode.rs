//! Downsampling and recompression of product images.
//!
//! Images larger than the bounding box are scaled down uniformly with a
//! Catmull-Rom filter; smaller images keep their dimensions. JPEG output is
//! re-encoded at a fixed quality, PNG output losslessly.
//!
//! The work is CPU bound. Async callers go through [`Transcoder::transcode_async`],
//! which runs it on the blocking thread pool.

use crate::error::{ImageError, TranscodeError};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct TranscodeConfig {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            max_width: 800,
            max_height: 600,
            jpeg_quality: 75,
        }
    }
}

/// Image format used both to decode a source and to encode its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Png,
    Jpeg,
}

impl SourceFormat {
    /// Infers the format from the reference's file extension.
    ///
    /// Anything other than `.png`, `.jpg` or `.jpeg` is assumed to be JPEG.
    pub fn from_reference(reference: &str) -> Self {
        match crate::extension_of(reference).as_deref() {
            Some(".png") => SourceFormat::Png,
            Some(".jpg") | Some(".jpeg") => SourceFormat::Jpeg,
            _ => {
                warn!(image_ref = %reference, "Unknown image format, defaulting to JPEG");
                SourceFormat::Jpeg
            }
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            SourceFormat::Png => ImageFormat::Png,
            SourceFormat::Jpeg => ImageFormat::Jpeg,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscodedImage {
    pub bytes: Bytes,
    pub format: SourceFormat,
    pub width: u32,
    pub height: u32,
}

impl TranscodedImage {
    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }
}

/// Largest uniform downscale of `width`x`height` that fits the box.
///
/// Scaled sides are truncated, never rounded up. Returns `None` when the
/// image already fits; images are never upscaled.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return None;
    }
    let (w, h) = (u64::from(width), u64::from(height));
    let (max_w, max_h) = (u64::from(max_width), u64::from(max_height));
    // Width is the binding side when max_w / w <= max_h / h.
    let (new_w, new_h) = if max_w * h <= max_h * w {
        (max_w, h * max_w / w)
    } else {
        (w * max_h / h, max_h)
    };
    // Both fit in u32: each is at most the matching max side.
    Some((new_w.max(1) as u32, new_h.max(1) as u32))
}

#[derive(Debug, Default)]
pub struct Transcoder {
    config: TranscodeConfig,
}

impl Transcoder {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    /// Decodes, downsizes and re-encodes `data` in `format`.
    pub fn transcode(
        &self,
        data: &[u8],
        format: SourceFormat,
    ) -> Result<TranscodedImage, TranscodeError> {
        let img = decode(data, format)?;
        let (orig_w, orig_h) = (img.width(), img.height());

        let img = match fit_within(orig_w, orig_h, self.config.max_width, self.config.max_height) {
            Some((w, h)) => {
                debug!(
                    original_width = orig_w,
                    original_height = orig_h,
                    width = w,
                    height = h,
                    "Resizing image"
                );
                img.resize_exact(w, h, FilterType::CatmullRom)
            }
            None => img,
        };

        let bytes = self.encode(&img, format)?;
        Ok(TranscodedImage {
            bytes,
            format,
            width: img.width(),
            height: img.height(),
        })
    }

    /// Runs [`Transcoder::transcode`] on the blocking thread pool.
    pub async fn transcode_async(
        self: &Arc<Self>,
        data: Bytes,
        format: SourceFormat,
    ) -> Result<TranscodedImage, ImageError> {
        let transcoder = Arc::clone(self);
        tokio::task::spawn_blocking(move || transcoder.transcode(&data, format))
            .await
            .map_err(|e| ImageError::Task(e.to_string()))?
            .map_err(ImageError::from)
    }

    fn encode(&self, img: &DynamicImage, format: SourceFormat) -> Result<Bytes, TranscodeError> {
        let mut buf = Vec::new();
        match format {
            SourceFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb = img.to_rgb8();
                JpegEncoder::new_with_quality(&mut buf, self.config.jpeg_quality)
                    .encode_image(&rgb)
                    .map_err(TranscodeError::Encode)?;
            }
            SourceFormat::Png => {
                img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                    .map_err(TranscodeError::Encode)?;
            }
        }
        Ok(Bytes::from(buf))
    }
}

/// Decodes with the inferred format first, then with content sniffing.
fn decode(data: &[u8], format: SourceFormat) -> Result<DynamicImage, TranscodeError> {
    match image::load_from_memory_with_format(data, format.image_format()) {
        Ok(img) => Ok(img),
        Err(inferred_err) => {
            debug!(error = %inferred_err, ?format, "Inferred format failed, sniffing content");
            image::load_from_memory(data).map_err(|_| TranscodeError::Decode(inferred_err))
        }
    }
}
