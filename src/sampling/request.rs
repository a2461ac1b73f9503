//! Region requests and the handles callers wait on.

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::trace;

use super::backend::PixelBuffer;
use super::error::DecoderError;
use super::tiles::TileIndex;
use crate::geometry::Rect;

/// Logical viewport position a request is decoded for.
///
/// A newer request for a slot supersedes any older one still queued for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewportSlot {
    /// The main visible viewport.
    Primary,
    /// One block of the tile grid.
    Tile(TileIndex),
    /// Caller-defined slot.
    Custom(u32),
}

/// An immutable region decode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    /// Monotonically increasing per decoder; larger is newer.
    pub seq: u64,
    pub slot: ViewportSlot,
    /// Target rectangle in oriented image pixels, clamped to the image.
    pub rect: Rect,
    /// `rect` mapped into native (pre-rotation) pixels.
    pub native_rect: Rect,
    /// Power-of-two downsample factor, at least 1.
    pub sample_size: u32,
}

impl RegionRequest {
    /// Whether both requests would produce the same pixels.
    pub fn same_target(&self, other: &RegionRequest) -> bool {
        self.rect == other.rect && self.sample_size == other.sample_size
    }
}

/// Decoded pixels for a request, already rotated for display.
#[derive(Debug, Clone)]
pub struct DecodedRegion {
    pub request: RegionRequest,
    pub buffer: Arc<PixelBuffer>,
    /// Served from the tile cache without touching the backend.
    pub from_cache: bool,
}

impl DecodedRegion {
    pub fn sample_size(&self) -> u32 {
        self.request.sample_size
    }
}

/// Terminal state of a request.
#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(DecodedRegion),
    /// A newer request replaced this one, or the backend went away first.
    Superseded,
    /// The request was withdrawn or the decoder was released.
    Cancelled,
    Failed(DecoderError),
}

impl DecodeOutcome {
    pub fn is_decoded(&self) -> bool {
        matches!(self, DecodeOutcome::Decoded(_))
    }

    /// Superseded and cancelled requests are expected, not failures.
    pub fn is_failure(&self) -> bool {
        matches!(self, DecodeOutcome::Failed(_))
    }

    pub fn into_region(self) -> Option<DecodedRegion> {
        match self {
            DecodeOutcome::Decoded(region) => Some(region),
            _ => None,
        }
    }
}

/// Producer-side half of a request; resolves the matching [`RegionHandle`].
pub(crate) struct Responder {
    seq: u64,
    tx: Sender<DecodeOutcome>,
}

impl Responder {
    pub(crate) fn resolve(self, outcome: DecodeOutcome) {
        if self.tx.send(outcome).is_err() {
            trace!(seq = self.seq, "Request handle dropped before resolution");
        }
    }
}

/// Caller-side half of a request.
///
/// Dropping the decoder without resolving a handle reports `Cancelled`.
#[derive(Debug)]
pub struct RegionHandle {
    request: RegionRequest,
    rx: Receiver<DecodeOutcome>,
}

pub(crate) fn channel(request: RegionRequest) -> (Responder, RegionHandle) {
    let (tx, rx) = flume::bounded(1);
    (
        Responder {
            seq: request.seq,
            tx,
        },
        RegionHandle { request, rx },
    )
}

impl RegionHandle {
    pub fn request(&self) -> &RegionRequest {
        &self.request
    }

    pub fn sample_size(&self) -> u32 {
        self.request.sample_size
    }

    /// Block until the request resolves.
    pub fn wait(self) -> DecodeOutcome {
        self.rx.recv().unwrap_or(DecodeOutcome::Cancelled)
    }

    /// Block for at most `timeout`. `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DecodeOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(DecodeOutcome::Cancelled),
        }
    }

    /// Non-blocking poll.
    pub fn try_outcome(&self) -> Option<DecodeOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(DecodeOutcome::Cancelled),
        }
    }

    /// Await the request from async code.
    pub async fn outcome(self) -> DecodeOutcome {
        self.rx
            .recv_async()
            .await
            .unwrap_or(DecodeOutcome::Cancelled)
    }
}
