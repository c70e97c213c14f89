use std::time::Duration;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::pipeline::ImageSource;
use crate::util::{read_limited, BodyError};

/// Hard ceiling the publishing surface accepts for one blob.
pub const MAX_UPLOAD_BYTES: usize = 900_000;
/// Bounding box the image is scaled into (never upscaled).
pub const MAX_DIMENSION: u32 = 1000;
pub const START_QUALITY: u8 = 100;
pub const MIN_QUALITY: u8 = 40;
pub const QUALITY_STEP: u8 = 5;

const MAX_DOWNLOAD_SIZE: usize = 20 * 1024 * 1024; // 20MB
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("Download timed out")]
    Timeout,
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Image too large to download (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Image decode/encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("Compression task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<BodyError> for CompressError {
    fn from(e: BodyError) -> Self {
        match e {
            BodyError::Network(e) => CompressError::Network(e),
            BodyError::TooLarge(limit) => CompressError::ResponseTooLarge(limit),
            BodyError::Incomplete { expected, received } => {
                CompressError::IncompleteResponse { expected, received }
            }
        }
    }
}

/// Encoded image ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub bytes: Vec<u8>,
    /// JPEG quality used, or `None` when the original bytes were kept.
    pub quality: Option<u8>,
    pub mime_type: &'static str,
}

impl ImageAsset {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn exceeds_ceiling(&self) -> bool {
        self.bytes.len() > MAX_UPLOAD_BYTES
    }
}

/// Downloads images and squeezes them under [`MAX_UPLOAD_BYTES`].
#[derive(Debug, Clone)]
pub struct ImageCompressor {
    client: reqwest::Client,
}

impl ImageCompressor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, CompressError> {
        let response = tokio::time::timeout(DOWNLOAD_TIMEOUT, self.client.get(url.clone()).send())
            .await
            .map_err(|_| CompressError::Timeout)?
            .map_err(CompressError::Network)?;

        if !response.status().is_success() {
            return Err(CompressError::HttpStatus(response.status().as_u16()));
        }

        Ok(read_limited(response, MAX_DOWNLOAD_SIZE).await?)
    }

    async fn try_compress(&self, url: &Url) -> Result<ImageAsset, CompressError> {
        let raw = self.download(url).await?;
        let raw_len = raw.len();
        // Decoding and re-encoding are CPU-bound; keep them off the async workers
        let asset = tokio::task::spawn_blocking(move || compress_bytes(&raw)).await??;

        tracing::debug!(
            url = %url,
            original = raw_len,
            compressed = asset.len(),
            quality = ?asset.quality,
            "Compressed image"
        );
        Ok(asset)
    }
}

#[async_trait]
impl ImageSource for ImageCompressor {
    async fn compress(&self, url: &Url) -> Option<ImageAsset> {
        match self.try_compress(url).await {
            Ok(asset) => {
                if asset.exceeds_ceiling() {
                    tracing::warn!(
                        url = %url,
                        bytes = asset.len(),
                        ceiling = MAX_UPLOAD_BYTES,
                        "Image still over the upload ceiling at minimum quality"
                    );
                }
                Some(asset)
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Image unavailable, posting without thumbnail");
                None
            }
        }
    }
}

/// Decodes `raw`, fits it into the bounding box and walks the quality ladder
/// down from [`START_QUALITY`] until the JPEG fits [`MAX_UPLOAD_BYTES`] or
/// [`MIN_QUALITY`] is reached.
///
/// Reaching the floor while still oversized is not an error; the oversized
/// asset is returned. Whenever the re-encode comes out larger than `raw`, the
/// original bytes are returned unchanged, resized or not, so the output never
/// exceeds the input.
pub fn compress_bytes(raw: &[u8]) -> Result<ImageAsset, CompressError> {
    let format = image::guess_format(raw)?;
    let decoded = image::load_from_memory_with_format(raw, format)?;

    let resized = decoded.width() > MAX_DIMENSION || decoded.height() > MAX_DIMENSION;
    let fitted = if resized {
        decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
    } else {
        decoded
    };
    // JPEG has no alpha channel
    let rgb = fitted.into_rgb8();

    let mut quality = START_QUALITY;
    let mut bytes = encode_jpeg(&rgb, quality)?;
    while bytes.len() > MAX_UPLOAD_BYTES && quality > MIN_QUALITY {
        quality -= QUALITY_STEP;
        bytes = encode_jpeg(&rgb, quality)?;
    }

    if bytes.len() > raw.len() {
        return Ok(ImageAsset {
            bytes: raw.to_vec(),
            quality: None,
            mime_type: format.to_mime_type(),
        });
    }

    Ok(ImageAsset {
        bytes,
        quality: Some(quality),
        mime_type: "image/jpeg",
    })
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, CompressError> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(rgb)?;
    Ok(buf)
}
