//! Error types for the sampling decoder.

use thiserror::Error;

use super::backend::BackendError;
use super::rotation::InvalidRotation;
use crate::geometry::Rect;

/// Errors surfaced across the sampling decoder boundary.
#[derive(Error, Debug)]
pub enum DecoderError {
    /// The backend could not be opened. Fatal for this image.
    #[error("decode backend unavailable: {0}")]
    DecodeBackendUnavailable(#[from] BackendError),

    /// A region could not be decoded. Transient; the caller may request it again.
    #[error("region decode failed for {rect:?} at sample size {sample_size}: {reason}")]
    RegionDecodeFailed {
        rect: Rect,
        sample_size: u32,
        reason: String,
    },

    /// The decoder was used after `release`.
    #[error("sampling decoder already released")]
    AlreadyReleased,

    /// The requested viewport does not overlap the image.
    #[error("region {rect:?} lies outside the {width}x{height} image")]
    EmptyRegion { rect: Rect, width: u32, height: u32 },

    #[error(transparent)]
    InvalidRotation(#[from] InvalidRotation),

    /// The consumer thread could not be started.
    #[error("failed to spawn decoder worker: {0}")]
    Worker(#[source] std::io::Error),
}
