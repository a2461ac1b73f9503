use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::backend::{BackendError, PixelBuffer, RegionDecoderBackend};
use super::raster::RasterBackend;
use super::rotation::Rotation;
use crate::geometry::Rect;

/// Backend built on the `image` crate.
///
/// The encoded format is sniffed from the leading bytes. Orientation is read from
/// the embedded EXIF block before the pixel data is decoded.
pub struct ImageBackend {
    raster: RasterBackend,
    format: ImageFormat,
}

impl ImageBackend {
    /// Open encoded image bytes.
    pub fn open(bytes: &[u8]) -> Result<Self, BackendError> {
        let format = image::guess_format(bytes).map_err(|_| BackendError::UnsupportedFormat)?;
        let mut decoder = ImageReader::with_format(Cursor::new(bytes), format).into_decoder()?;

        let orientation = match decoder.orientation() {
            Ok(orientation) => Rotation::from_orientation(orientation),
            Err(e) => {
                warn!(?format, error = %e, "Failed to read orientation, assuming upright");
                Rotation::Deg0
            }
        };

        let image = DynamicImage::from_decoder(decoder)?;
        debug!(
            ?format,
            width = image.width(),
            height = image.height(),
            rotation = orientation.degrees(),
            "Opened image backend"
        );

        let raster = RasterBackend::with_hash(image, xxh3_64(bytes)).with_orientation(orientation);
        Ok(Self { raster, format })
    }

    /// Read and open an image file.
    pub fn open_path(path: &Path) -> Result<Self, BackendError> {
        let bytes = std::fs::read(path)?;
        Self::open(&bytes)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

impl RegionDecoderBackend for ImageBackend {
    fn intrinsic_width(&self) -> u32 {
        self.raster.intrinsic_width()
    }

    fn intrinsic_height(&self) -> u32 {
        self.raster.intrinsic_height()
    }

    fn orientation(&self) -> Rotation {
        self.raster.orientation()
    }

    fn source_hash(&self) -> u64 {
        self.raster.source_hash()
    }

    fn decode_region(
        &self,
        sample_size: u32,
        rect: Rect,
    ) -> Result<Option<PixelBuffer>, BackendError> {
        self.raster.decode_region(sample_size, rect)
    }

    fn recycle(&self) {
        self.raster.recycle();
    }

    fn is_recycled(&self) -> bool {
        self.raster.is_recycled()
    }
}
