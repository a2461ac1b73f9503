//! Region decoder backends.
//!
//! A backend wraps one opened image and can decode any sub-rectangle of it at a
//! power-of-two downsample factor. Backends own their pixel source explicitly:
//! once `recycle` has run, every decode returns `None` instead of touching freed
//! memory, and the owner is expected to call `recycle` itself rather than rely on
//! drop order.

use std::fmt;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageError, RgbaImage};
use thiserror::Error;

use super::rotation::Rotation;
use crate::geometry::Rect;

/// Errors raised by a backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The bytes are not in a format any compiled-in codec understands.
    #[error("unsupported image format")]
    UnsupportedFormat,

    /// The format was recognised but the data could not be decoded.
    #[error("corrupt image data: {reason}")]
    CorruptData { reason: String },

    /// Reading the encoded source failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend has been recycled.
    #[error("decoder disposed")]
    Disposed,
}

impl From<ImageError> for BackendError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Unsupported(_) => BackendError::UnsupportedFormat,
            ImageError::IoError(e) => BackendError::Io(e),
            other => BackendError::CorruptData {
                reason: other.to_string(),
            },
        }
    }
}

/// Memory layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit RGBA, non-premultiplied.
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Decoded pixels handed back to the rendering layer.
#[derive(Clone, PartialEq)]
pub struct PixelBuffer {
    image: RgbaImage,
}

impl PixelBuffer {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Wrap raw RGBA samples. Returns `None` if the length does not match.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        RgbaImage::from_raw(width, height, data).map(Self::new)
    }

    pub fn empty() -> Self {
        Self::new(RgbaImage::new(0, 0))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn format(&self) -> PixelFormat {
        PixelFormat::Rgba8
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    /// Estimated resident size in bytes.
    pub fn memory_bytes(&self) -> usize {
        (self.width() as usize) * (self.height() as usize) * self.format().bytes_per_pixel()
    }

    /// A new buffer with `rotation` applied clockwise.
    pub fn rotated(&self, rotation: Rotation) -> PixelBuffer {
        let image = match rotation {
            Rotation::Deg0 => self.image.clone(),
            Rotation::Deg90 => imageops::rotate90(&self.image),
            Rotation::Deg180 => imageops::rotate180(&self.image),
            Rotation::Deg270 => imageops::rotate270(&self.image),
        };
        PixelBuffer::new(image)
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("format", &self.format())
            .finish()
    }
}

/// A platform decoding capability for one opened image.
///
/// `decode_region` may run concurrently with the other read-only methods, never
/// concurrently with `recycle`. Implementations enforce that internally.
pub trait RegionDecoderBackend: Send + Sync {
    /// Native pixel width, valid for the backend's whole lifetime.
    fn intrinsic_width(&self) -> u32;

    /// Native pixel height, valid for the backend's whole lifetime.
    fn intrinsic_height(&self) -> u32;

    /// Canonical rotation from embedded orientation metadata, if any.
    fn orientation(&self) -> Rotation {
        Rotation::Deg0
    }

    /// Stable identity of the pixel source, used for cache keys.
    fn source_hash(&self) -> u64;

    /// Decode `rect` at `1/sample_size` resolution.
    ///
    /// Out-of-range rectangles are clamped to the image bounds. Returns `Ok(None)`
    /// once the backend has been recycled.
    fn decode_region(
        &self,
        sample_size: u32,
        rect: Rect,
    ) -> Result<Option<PixelBuffer>, BackendError>;

    /// Bake `rotation` into a new buffer.
    fn rotate(&self, buffer: &PixelBuffer, rotation: Rotation) -> PixelBuffer {
        buffer.rotated(rotation)
    }

    /// Release the pixel source. Idempotent.
    fn recycle(&self);

    fn is_recycled(&self) -> bool;

    /// Fail with [`BackendError::Disposed`] if the backend was recycled.
    fn ensure_live(&self) -> Result<(), BackendError> {
        if self.is_recycled() {
            Err(BackendError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Crop `rect` out of `image` and downsample it by `sample_size`.
///
/// Output dimensions round up, so a 3px wide strip at sample size 2 yields 2px.
pub(crate) fn sample_region(image: &DynamicImage, sample_size: u32, rect: Rect) -> PixelBuffer {
    let (width, height) = image.dimensions();
    let rect = rect.clamp_to(width, height);
    if rect.is_empty() {
        return PixelBuffer::empty();
    }

    let sample_size = sample_size.max(1);
    let region = image.crop_imm(rect.x, rect.y, rect.width, rect.height);
    if sample_size == 1 {
        return PixelBuffer::new(region.to_rgba8());
    }

    let out_w = rect.width.div_ceil(sample_size).max(1);
    let out_h = rect.height.div_ceil(sample_size).max(1);
    let scaled = region.resize_exact(out_w, out_h, FilterType::Triangle);
    PixelBuffer::new(scaled.to_rgba8())
}
