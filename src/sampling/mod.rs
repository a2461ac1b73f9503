//! Region decoding pipeline for very large images.
//!
//! This module provides:
//! - `RegionDecoderBackend` - Decodes rectangles of a source at a downsample factor
//! - `PriorityRequestQueue` - Blocking deque where the newest request is served first
//! - `SamplingDecoder` - Per-image decoder with a thumbnail and on-demand regions
//! - `TileGrid` / `TileCache` - Block tiling and a shared LRU of decoded regions

pub mod backend;
pub mod cache;
pub mod decoder;
pub mod error;
pub mod image_backend;
pub mod queue;
pub mod raster;
pub mod request;
pub mod rotation;
pub mod tiles;

pub use backend::{BackendError, PixelBuffer, PixelFormat, RegionDecoderBackend};
pub use cache::{TileCache, TileKey};
pub use decoder::{
    sample_size_for, sample_size_for_width, DecoderState, SamplingDecoder, SamplingDecoderBuilder,
};
pub use error::DecoderError;
pub use image_backend::ImageBackend;
pub use queue::PriorityRequestQueue;
pub use raster::RasterBackend;
pub use request::{DecodeOutcome, DecodedRegion, RegionHandle, RegionRequest, ViewportSlot};
pub use rotation::{InvalidRotation, Rotation};
pub use tiles::{Tile, TileGrid, TileIndex};
