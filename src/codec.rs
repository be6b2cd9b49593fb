//! Media probing and image transforms.
//!
//! [`MediaCodec`] is the seam to whatever decodes uploaded content.  Its
//! methods are synchronous and CPU-bound; callers run them on the blocking
//! pool.  [`ImageCodec`] handles still images through the `image` crate
//! and reports everything else as unknown.

use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use crate::errors::{DamError, DamResult};

/// Resolution reported when content cannot be decoded.
pub const UNKNOWN_RESOLUTION: &str = "Unknown";

/// A derived preview image.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub data: Bytes,
    /// File extension of the encoded preview, without the dot.
    pub extension: &'static str,
}

/// What a codec learned about a staged file.
#[derive(Debug, Clone)]
pub struct Probe {
    /// `"<width>x<height>"`, or [`UNKNOWN_RESOLUTION`].
    pub resolution: String,
    pub duration: Option<String>,
    pub thumbnail: Option<Thumbnail>,
}

impl Probe {
    pub fn unknown() -> Self {
        Self {
            resolution: UNKNOWN_RESOLUTION.to_string(),
            duration: None,
            thumbnail: None,
        }
    }
}

/// An edit applied to an image asset's latest content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOperation {
    /// Clockwise rotation; 90, 180 or 270 degrees.
    Rotate { degrees: u32 },
    /// Exact resize to non-zero dimensions.
    Resize { width: u32, height: u32 },
}

impl ImageOperation {
    pub fn validate(&self) -> DamResult<()> {
        match *self {
            ImageOperation::Rotate { degrees } if !matches!(degrees, 90 | 180 | 270) => Err(
                DamError::validation(format!("rotation must be 90, 180 or 270, got {degrees}")),
            ),
            ImageOperation::Resize { width, height } if width == 0 || height == 0 => Err(
                DamError::validation(format!("resize to {width}x{height} has a zero dimension")),
            ),
            _ => Ok(()),
        }
    }
}

/// Decodes uploaded media.
pub trait MediaCodec: Send + Sync + 'static {
    /// Inspect the staged file at `path`.
    fn probe(&self, path: &Path, content_type: &str) -> anyhow::Result<Probe>;

    /// Apply `operation` to encoded image bytes, returning the re-encoded
    /// result in the same format.
    fn transform(&self, data: &[u8], operation: ImageOperation) -> anyhow::Result<Bytes>;
}

/// Still-image codec backed by the `image` crate.
pub struct ImageCodec {
    thumbnail_max_edge: u32,
}

impl ImageCodec {
    pub fn new(thumbnail_max_edge: u32) -> Self {
        Self { thumbnail_max_edge }
    }
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::new(256)
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> anyhow::Result<Bytes> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format)?;
    Ok(Bytes::from(out.into_inner()))
}

impl MediaCodec for ImageCodec {
    fn probe(&self, path: &Path, content_type: &str) -> anyhow::Result<Probe> {
        if !content_type.starts_with("image/") {
            return Ok(Probe::unknown());
        }
        let data = std::fs::read(path)?;
        let image = image::load_from_memory(&data)?;
        let thumbnail = if self.thumbnail_max_edge > 0 {
            let preview = image.thumbnail(self.thumbnail_max_edge, self.thumbnail_max_edge);
            Some(Thumbnail {
                data: encode(&preview, ImageFormat::Png)?,
                extension: "png",
            })
        } else {
            None
        };
        Ok(Probe {
            resolution: format!("{}x{}", image.width(), image.height()),
            duration: None,
            thumbnail,
        })
    }

    fn transform(&self, data: &[u8], operation: ImageOperation) -> anyhow::Result<Bytes> {
        let format = image::guess_format(data)?;
        let image = image::load_from_memory_with_format(data, format)?;
        let edited = match operation {
            ImageOperation::Rotate { degrees: 90 } => image.rotate90(),
            ImageOperation::Rotate { degrees: 180 } => image.rotate180(),
            ImageOperation::Rotate { degrees: 270 } => image.rotate270(),
            ImageOperation::Rotate { degrees } => anyhow::bail!("unsupported rotation {degrees}"),
            ImageOperation::Resize { width, height } => {
                image.resize_exact(width, height, image::imageops::FilterType::Triangle)
            }
        };
        encode(&edited, format)
    }
}
