//! Backend over an already decoded raster.

use image::{DynamicImage, GenericImageView, RgbaImage};
use parking_lot::RwLock;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use super::backend::{sample_region, BackendError, PixelBuffer, RegionDecoderBackend};
use super::rotation::Rotation;
use crate::geometry::Rect;

/// Serves regions out of pixels that are already resident in memory.
///
/// The pixels live behind an `Option` that `recycle` takes, so a recycled backend
/// has nothing left to read from.
pub struct RasterBackend {
    pixels: RwLock<Option<DynamicImage>>,
    width: u32,
    height: u32,
    orientation: Rotation,
    source_hash: u64,
}

impl RasterBackend {
    /// Wrap a decoded image. The source hash is computed from the raw samples.
    pub fn new(image: DynamicImage) -> Self {
        let source_hash = xxh3_64(image.as_bytes());
        Self::with_hash(image, source_hash)
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        Self::new(DynamicImage::ImageRgba8(image))
    }

    /// Wrap a decoded image whose identity is already known (e.g. a hash of the
    /// encoded bytes it came from).
    pub fn with_hash(image: DynamicImage, source_hash: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: RwLock::new(Some(image)),
            width,
            height,
            orientation: Rotation::Deg0,
            source_hash,
        }
    }

    /// Report `orientation` as the embedded rotation of this source.
    pub fn with_orientation(mut self, orientation: Rotation) -> Self {
        self.orientation = orientation;
        self
    }
}

impl RegionDecoderBackend for RasterBackend {
    fn intrinsic_width(&self) -> u32 {
        self.width
    }

    fn intrinsic_height(&self) -> u32 {
        self.height
    }

    fn orientation(&self) -> Rotation {
        self.orientation
    }

    fn source_hash(&self) -> u64 {
        self.source_hash
    }

    fn decode_region(
        &self,
        sample_size: u32,
        rect: Rect,
    ) -> Result<Option<PixelBuffer>, BackendError> {
        let pixels = self.pixels.read();
        Ok(pixels
            .as_ref()
            .map(|image| sample_region(image, sample_size, rect)))
    }

    fn recycle(&self) {
        if self.pixels.write().take().is_some() {
            debug!(
                width = self.width,
                height = self.height,
                "Recycled raster backend"
            );
        }
    }

    fn is_recycled(&self) -> bool {
        self.pixels.read().is_none()
    }
}
