//! regionview: decode only what is visible of very large images, and track the
//! on-screen geometry of items that morph into a full-screen viewer.

pub mod config;
pub mod geometry;
pub mod sampling;
pub mod transform;

pub use config::{ConfigError, DecoderConfig, DecoderConfigBuilder};
pub use geometry::{Point, Rect, Size};
pub use sampling::{
    DecodeOutcome, DecodedRegion, DecoderError, DecoderState, ImageBackend, PixelBuffer,
    RegionDecoderBackend, RegionHandle, Rotation, SamplingDecoder, TileCache, ViewportSlot,
};
pub use transform::{AnchorGeometry, AnchorRecord, AnchorRegistry, AnchorUpdate};
