//! Sampling decoder: decodes what is visible at the resolution it is shown at.
//!
//! - One consumer thread per decoder serializes all backend work for the image
//! - Producers never block: requests are queued urgently and return a handle
//! - A newer request for the same viewport slot supersedes a queued older one
//! - Release recycles the backend exactly once and cancels everything pending

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::backend::{BackendError, PixelBuffer, RegionDecoderBackend};
use super::cache::{TileCache, TileKey};
use super::error::DecoderError;
use super::image_backend::ImageBackend;
use super::queue::PriorityRequestQueue;
use super::request::{
    channel, DecodeOutcome, DecodedRegion, RegionHandle, RegionRequest, Responder, ViewportSlot,
};
use super::rotation::Rotation;
use super::tiles::{TileGrid, TileIndex};
use crate::config::DecoderConfig;
use crate::geometry::{Rect, Size};

static NEXT_DECODER_ID: AtomicUsize = AtomicUsize::new(0);

/// How long drop waits for the consumer thread before detaching it.
const WORKER_EXIT_GRACE: Duration = Duration::from_millis(250);

/// Downsample factor for showing `rect` at `display` size.
///
/// `floor(min(rw/dw, rh/dh))`, at least 1, rounded down to a power of two.
pub fn sample_size_for(rect: Rect, display: Size) -> u32 {
    if rect.is_empty() || display.is_empty() {
        return 1;
    }
    let ratio = (rect.width / display.width).min(rect.height / display.height);
    floor_power_of_two(ratio.max(1))
}

/// Largest power-of-two factor that keeps `src_width` at least `req_width` wide.
pub fn sample_size_for_width(src_width: u32, req_width: u32) -> u32 {
    let mut sample = 1u32;
    if req_width == 0 {
        return sample;
    }
    while sample < (1 << 30) && src_width / (sample * 2) >= req_width {
        sample *= 2;
    }
    sample
}

fn floor_power_of_two(n: u32) -> u32 {
    1 << (u32::BITS - 1 - n.leading_zeros())
}

/// Lifecycle of a decoder.
///
/// `Opening` is only held inside `open`/`build` while the backend and thumbnail
/// are prepared; a decoder handed to callers is `Ready` or `Released`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Opening,
    Ready,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Decode(RegionRequest),
    Shutdown,
}

/// A caller waiting on a decode.
struct Waiter {
    request: RegionRequest,
    responder: Responder,
}

/// One backend decode and everyone waiting on its pixels.
struct Pending {
    /// The request that was queued.
    request: RegionRequest,
    responder: Responder,
    /// Later requests for the same pixels that arrived while this one was in flight.
    joined: Vec<Waiter>,
}

impl Pending {
    fn new(request: RegionRequest, responder: Responder) -> Self {
        Self {
            request,
            responder,
            joined: Vec::new(),
        }
    }

    fn waiter_count(&self) -> usize {
        1 + self.joined.len()
    }

    fn seqs(&self) -> Vec<u64> {
        std::iter::once(self.request.seq)
            .chain(self.joined.iter().map(|w| w.request.seq))
            .collect()
    }

    fn into_waiters(self) -> Vec<Waiter> {
        let mut waiters = Vec::with_capacity(1 + self.joined.len());
        waiters.push(Waiter {
            request: self.request,
            responder: self.responder,
        });
        waiters.extend(self.joined);
        waiters
    }

    /// Resolve every waiter with the same terminal outcome.
    fn resolve_all(self, outcome: fn() -> DecodeOutcome) {
        for waiter in self.into_waiters() {
            waiter.responder.resolve(outcome());
        }
    }
}

/// Requests that are queued or being decoded, guarded together with the state
/// so that release and submission never interleave.
struct Ledger {
    state: DecoderState,
    /// Keyed by the seq of the queued request.
    pending: HashMap<u64, Pending>,
    /// Newest seq submitted per slot.
    latest_by_slot: HashMap<ViewportSlot, u64>,
}

impl Ledger {
    fn take(&mut self, seq: u64) -> Option<Pending> {
        self.pending.remove(&seq)
    }

    /// Stale once its slot moved on to a request outside the decode it waits on.
    fn is_stale(&self, request: &RegionRequest, group: &[u64]) -> bool {
        self.latest_by_slot
            .get(&request.slot)
            .is_some_and(|latest| *latest > request.seq && !group.contains(latest))
    }
}

/// What serving one pending decode produced, shared by all of its waiters.
enum Served {
    Pixels {
        buffer: Arc<PixelBuffer>,
        from_cache: bool,
    },
    /// The backend was recycled underneath the request.
    Gone,
    Failed(String),
}

impl Served {
    fn outcome_for(&self, request: RegionRequest, stale: bool) -> DecodeOutcome {
        match self {
            Served::Pixels { .. } if stale => DecodeOutcome::Superseded,
            Served::Pixels { buffer, from_cache } => DecodeOutcome::Decoded(DecodedRegion {
                request,
                buffer: Arc::clone(buffer),
                from_cache: *from_cache,
            }),
            Served::Gone => DecodeOutcome::Superseded,
            Served::Failed(reason) => DecodeOutcome::Failed(DecoderError::RegionDecodeFailed {
                rect: request.rect,
                sample_size: request.sample_size,
                reason: reason.clone(),
            }),
        }
    }
}

type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// State shared between a decoder and its consumer thread.
struct Shared {
    /// Process-unique id used in thread names and logs.
    id: usize,
    backend: Box<dyn RegionDecoderBackend>,
    /// Canonical rotation baked into every decoded buffer.
    rotation: Rotation,
    native_width: u32,
    native_height: u32,
    queue: PriorityRequestQueue<Job>,
    /// Lock order: `ledger` before `queue`.
    ledger: Mutex<Ledger>,
    /// Optional cache shared with other decoders.
    cache: Option<TileCache>,
}

impl Shared {
    fn cache_key(&self, request: &RegionRequest) -> TileKey {
        TileKey {
            source: self.backend.source_hash(),
            rotation: self.rotation,
            rect: request.rect,
            sample_size: request.sample_size,
        }
    }

    fn cached(&self, request: &RegionRequest) -> Option<Arc<PixelBuffer>> {
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(&self.cache_key(request)))
    }

    /// Decode the native rectangle and bake in the canonical rotation.
    ///
    /// Backend panics are converted into errors so they never cross this boundary.
    fn decode(&self, sample_size: u32, native_rect: Rect) -> Result<Option<PixelBuffer>, String> {
        let decoded = panic::catch_unwind(AssertUnwindSafe(|| {
            self.backend.decode_region(sample_size, native_rect)
        }));
        match decoded {
            Ok(Ok(Some(buffer))) if self.rotation != Rotation::Deg0 => {
                Ok(Some(self.backend.rotate(&buffer, self.rotation)))
            }
            Ok(Ok(buffer)) => Ok(buffer),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("backend panicked".to_string()),
        }
    }

    /// Serve one dequeued request on the consumer thread.
    fn serve(&self, request: RegionRequest) {
        let served = if self.backend.is_recycled() {
            Served::Gone
        } else if let Some(buffer) = self.cached(&request) {
            trace!(decoder = self.id, seq = request.seq, "Queued region found in tile cache");
            Served::Pixels {
                buffer,
                from_cache: true,
            }
        } else {
            self.decode_request(&request)
        };

        let resolved: Vec<(Waiter, bool)> = {
            let mut ledger = self.ledger.lock();
            match ledger.take(request.seq) {
                Some(entry) => {
                    let group = entry.seqs();
                    entry
                        .into_waiters()
                        .into_iter()
                        .map(|waiter| {
                            let stale = ledger.is_stale(&waiter.request, &group);
                            (waiter, stale)
                        })
                        .collect()
                }
                // Released (and already cancelled) while decoding.
                None => {
                    trace!(decoder = self.id, seq = request.seq, "Discarding decoded region");
                    Vec::new()
                }
            }
        };

        for (waiter, stale) in resolved {
            let outcome = served.outcome_for(waiter.request, stale);
            waiter.responder.resolve(outcome);
        }
    }

    fn decode_request(&self, request: &RegionRequest) -> Served {
        trace!(
            decoder = self.id,
            seq = request.seq,
            ?request.rect,
            request.sample_size,
            "Decoding region"
        );
        match self.decode(request.sample_size, request.native_rect) {
            Ok(Some(buffer)) => {
                let buffer = Arc::new(buffer);
                if let Some(cache) = &self.cache {
                    cache.insert(self.cache_key(request), Arc::clone(&buffer));
                }
                Served::Pixels {
                    buffer,
                    from_cache: false,
                }
            }
            Ok(None) if self.backend.is_recycled() => Served::Gone,
            Ok(None) => Served::Failed("backend returned no pixels".to_string()),
            Err(reason) => {
                warn!(decoder = self.id, seq = request.seq, %reason, "Region decode failed");
                Served::Failed(reason)
            }
        }
    }
}

/// Consumer loop: one request at a time until the shutdown sentinel arrives.
fn worker_loop(shared: Arc<Shared>) {
    debug!(decoder = shared.id, "Region decoder worker started");
    loop {
        match shared.queue.take() {
            Job::Decode(request) => shared.serve(request),
            Job::Shutdown => break,
        }
    }
    debug!(decoder = shared.id, "Region decoder worker stopped");
}

/// Decodes regions of one large image on demand.
pub struct SamplingDecoder {
    shared: Arc<Shared>,
    /// Consumer thread; joined on drop if it exits within the grace period.
    worker: Option<JoinHandle<()>>,
    /// Disconnects when the consumer thread exits.
    worker_exit: Receiver<()>,
    /// Placeholder decoded at open, dropped on release.
    thumbnail: RwLock<Option<Arc<PixelBuffer>>>,
    /// Block tiling of the oriented image.
    grid: Mutex<TileGrid>,
    /// Last issued request seq.
    next_seq: AtomicU64,
    /// Fired once, by the first release.
    on_release: Mutex<Option<ReleaseCallback>>,
}

impl SamplingDecoder {
    /// Open encoded bytes with the `image` backend and default configuration.
    ///
    /// `rotation` overrides the orientation embedded in the image.
    pub fn open(bytes: &[u8], rotation: Option<Rotation>) -> Result<Self, DecoderError> {
        SamplingDecoderBuilder::new().rotation(rotation).open(bytes)
    }

    pub fn builder() -> SamplingDecoderBuilder {
        SamplingDecoderBuilder::new()
    }

    fn start(
        backend: Box<dyn RegionDecoderBackend>,
        rotation: Option<Rotation>,
        config: DecoderConfig,
        cache: Option<TileCache>,
        on_release: Option<ReleaseCallback>,
    ) -> Result<Self, DecoderError> {
        backend.ensure_live()?;

        let id = NEXT_DECODER_ID.fetch_add(1, Ordering::Relaxed);
        let rotation = rotation.unwrap_or_else(|| backend.orientation());
        let native_width = backend.intrinsic_width();
        let native_height = backend.intrinsic_height();
        let (width, height) = rotation.oriented_size(native_width, native_height);

        let shared = Arc::new(Shared {
            id,
            backend,
            rotation,
            native_width,
            native_height,
            queue: PriorityRequestQueue::with_capacity(config.queue_capacity),
            ledger: Mutex::new(Ledger {
                state: DecoderState::Opening,
                pending: HashMap::new(),
                latest_by_slot: HashMap::new(),
            }),
            cache,
        });

        // Placeholder covering the whole image, decoded before any viewport work.
        let thumb_sample = sample_size_for_width(width, config.thumbnail_width);
        let thumb_rect = rotation.to_native_rect(Rect::of_size(width, height), native_width, native_height);
        let thumbnail = match shared.decode(thumb_sample, thumb_rect) {
            Ok(Some(buffer)) => Arc::new(buffer),
            Ok(None) => return Err(BackendError::Disposed.into()),
            Err(reason) => return Err(BackendError::CorruptData { reason }.into()),
        };

        let (exit_tx, worker_exit) = flume::bounded::<()>(0);
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("region-decoder-{}", id))
                .spawn(move || {
                    let _exit = exit_tx;
                    worker_loop(shared)
                })
                .map_err(DecoderError::Worker)?
        };

        shared.ledger.lock().state = DecoderState::Ready;
        debug!(
            decoder = id,
            width,
            height,
            rotation = rotation.degrees(),
            thumb_sample,
            "Sampling decoder ready"
        );

        Ok(Self {
            shared,
            worker: Some(worker),
            worker_exit,
            thumbnail: RwLock::new(Some(thumbnail)),
            grid: Mutex::new(TileGrid::new(width, height, config.max_block_count)),
            next_seq: AtomicU64::new(0),
            on_release: Mutex::new(on_release),
        })
    }

    pub fn state(&self) -> DecoderState {
        self.shared.ledger.lock().state
    }

    pub fn rotation(&self) -> Rotation {
        self.shared.rotation
    }

    /// Size of the image as displayed (after rotation).
    pub fn intrinsic_size(&self) -> Size {
        let (width, height) = self
            .shared
            .rotation
            .oriented_size(self.shared.native_width, self.shared.native_height);
        Size::new(width, height)
    }

    /// Size of the image as stored.
    pub fn native_size(&self) -> Size {
        Size::new(self.shared.native_width, self.shared.native_height)
    }

    /// The low-resolution placeholder decoded at open, already rotated.
    pub fn thumbnail(&self) -> Result<Arc<PixelBuffer>, DecoderError> {
        self.thumbnail
            .read()
            .clone()
            .ok_or(DecoderError::AlreadyReleased)
    }

    /// Number of requests queued or being decoded.
    pub fn pending_count(&self) -> usize {
        self.shared
            .ledger
            .lock()
            .pending
            .values()
            .map(Pending::waiter_count)
            .sum()
    }

    /// Request `viewport` for the primary slot.
    pub fn request_region(
        &self,
        viewport: Rect,
        display: Size,
    ) -> Result<RegionHandle, DecoderError> {
        self.request_region_in(ViewportSlot::Primary, viewport, display)
    }

    /// Request `viewport` shown at `display` size for `slot`.
    ///
    /// A still-queued request for the same slot, or for the same pixels, is
    /// superseded by this one. A request for pixels already being decoded waits on
    /// that decode instead of starting another.
    pub fn request_region_in(
        &self,
        slot: ViewportSlot,
        viewport: Rect,
        display: Size,
    ) -> Result<RegionHandle, DecoderError> {
        let rect = self.clamp_viewport(viewport)?;
        self.submit(slot, rect, sample_size_for(rect, display))
    }

    /// Request every tile visible in `viewport`, cancelling queued tiles that
    /// scrolled out of view.
    pub fn request_tiles(
        &self,
        viewport: Rect,
        display: Size,
    ) -> Result<Vec<(TileIndex, RegionHandle)>, DecoderError> {
        let viewport = self.clamp_viewport(viewport)?;
        let sample_size = sample_size_for(viewport, display);
        let visible = self.grid.lock().visible_tiles(viewport);

        let keep: HashSet<ViewportSlot> = visible
            .iter()
            .map(|tile| ViewportSlot::Tile(tile.index))
            .collect();
        let cancelled = self.cancel_where(|slot| {
            matches!(slot, ViewportSlot::Tile(_)) && !keep.contains(&slot)
        });
        if cancelled > 0 {
            trace!(decoder = self.shared.id, cancelled, "Cancelled off-screen tiles");
        }

        visible
            .into_iter()
            .map(|tile| {
                self.submit(ViewportSlot::Tile(tile.index), tile.rect, sample_size)
                    .map(|handle| (tile.index, handle))
            })
            .collect()
    }

    /// A copy of the current tile grid.
    pub fn tile_grid(&self) -> TileGrid {
        self.grid.lock().clone()
    }

    /// Rebuild the tile grid. Queued tile requests are cancelled when it changes.
    pub fn set_max_block_count(&self, count: u32) -> bool {
        let changed = self.grid.lock().set_max_block_count(count);
        if changed {
            self.cancel_where(|slot| matches!(slot, ViewportSlot::Tile(_)));
        }
        changed
    }

    /// Withdraw the pending request for `slot`.
    ///
    /// In-flight decodes are not interrupted; a request waiting on another
    /// request's decode is detached from it.
    pub fn cancel(&self, slot: ViewportSlot) -> bool {
        self.cancel_where(|candidate| candidate == slot) > 0
    }

    /// Release the backend and cancel everything pending. Idempotent.
    pub fn release(&self) {
        let cancelled: Vec<Waiter> = {
            let mut ledger = self.shared.ledger.lock();
            if ledger.state == DecoderState::Released {
                return;
            }
            ledger.state = DecoderState::Released;
            self.shared.queue.clear();
            self.shared.queue.push_urgent(Job::Shutdown);
            ledger.latest_by_slot.clear();
            ledger
                .pending
                .drain()
                .flat_map(|(_, pending)| pending.into_waiters())
                .collect()
        };

        self.shared.backend.recycle();
        self.thumbnail.write().take();

        debug!(
            decoder = self.shared.id,
            cancelled = cancelled.len(),
            "Released sampling decoder"
        );
        for waiter in cancelled {
            waiter.responder.resolve(DecodeOutcome::Cancelled);
        }

        if let Some(callback) = self.on_release.lock().take() {
            callback();
        }
    }

    fn clamp_viewport(&self, viewport: Rect) -> Result<Rect, DecoderError> {
        let size = self.intrinsic_size();
        let rect = viewport.clamp_to(size.width, size.height);
        if rect.is_empty() {
            return Err(DecoderError::EmptyRegion {
                rect: viewport,
                width: size.width,
                height: size.height,
            });
        }
        Ok(rect)
    }

    fn submit(
        &self,
        slot: ViewportSlot,
        rect: Rect,
        sample_size: u32,
    ) -> Result<RegionHandle, DecoderError> {
        let shared = &self.shared;
        let request = RegionRequest {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
            slot,
            rect,
            native_rect: shared
                .rotation
                .to_native_rect(rect, shared.native_width, shared.native_height),
            sample_size,
        };
        let (responder, handle) = channel(request);

        let mut ledger = shared.ledger.lock();
        if ledger.state != DecoderState::Ready {
            return Err(DecoderError::AlreadyReleased);
        }

        let superseded: Vec<u64> = ledger
            .pending
            .values()
            .filter(|p| p.request.slot == slot || p.request.same_target(&request))
            .map(|p| p.request.seq)
            .collect();
        let mut superseded_count = 0;
        for seq in superseded {
            let queued = ledger
                .pending
                .get(&seq)
                .is_some_and(|p| shared.queue.remove(&Job::Decode(p.request)));
            if queued {
                if let Some(old) = ledger.take(seq) {
                    old.resolve_all(|| DecodeOutcome::Superseded);
                    superseded_count += 1;
                }
            }
        }
        ledger.latest_by_slot.insert(slot, request.seq);

        if let Some(buffer) = shared.cached(&request) {
            drop(ledger);
            trace!(decoder = shared.id, seq = request.seq, "Tile cache hit");
            responder.resolve(DecodeOutcome::Decoded(DecodedRegion {
                request,
                buffer,
                from_cache: true,
            }));
            return Ok(handle);
        }

        // Anything left with the same target is in flight; queued ones were removed above.
        if let Some(in_flight) = ledger
            .pending
            .values_mut()
            .find(|p| p.request.same_target(&request))
        {
            trace!(
                decoder = shared.id,
                seq = request.seq,
                joined = in_flight.request.seq,
                "Joined in-flight decode"
            );
            in_flight.joined.push(Waiter { request, responder });
            return Ok(handle);
        }

        ledger
            .pending
            .insert(request.seq, Pending::new(request, responder));
        if let Some(Job::Decode(evicted)) = shared.queue.push_urgent(Job::Decode(request)) {
            if let Some(old) = ledger.take(evicted.seq) {
                old.resolve_all(|| DecodeOutcome::Superseded);
            }
        }

        trace!(
            decoder = shared.id,
            seq = request.seq,
            ?slot,
            ?rect,
            sample_size,
            superseded = superseded_count,
            "Queued region request"
        );
        Ok(handle)
    }

    /// Cancel pending requests whose slot matches `predicate`.
    fn cancel_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(ViewportSlot) -> bool,
    {
        let shared = &self.shared;
        let mut ledger = shared.ledger.lock();

        let mut detached = Vec::new();
        for entry in ledger.pending.values_mut() {
            let (cancel, keep): (Vec<Waiter>, Vec<Waiter>) = entry
                .joined
                .drain(..)
                .partition(|waiter| predicate(waiter.request.slot));
            entry.joined = keep;
            detached.extend(cancel);
        }
        let mut cancelled = detached.len();
        for waiter in detached {
            waiter.responder.resolve(DecodeOutcome::Cancelled);
        }

        let candidates: Vec<RegionRequest> = ledger
            .pending
            .values()
            .filter(|p| predicate(p.request.slot))
            .map(|p| p.request)
            .collect();

        for request in candidates {
            if shared.queue.remove(&Job::Decode(request)) {
                if let Some(entry) = ledger.take(request.seq) {
                    cancelled += entry.waiter_count();
                    entry.resolve_all(|| DecodeOutcome::Cancelled);
                }
            }
        }
        cancelled
    }
}

impl Drop for SamplingDecoder {
    fn drop(&mut self) {
        self.release();
        let Some(worker) = self.worker.take() else {
            return;
        };
        match self.worker_exit.recv_timeout(WORKER_EXIT_GRACE) {
            Err(RecvTimeoutError::Timeout) => {
                // The worker exits on its own once the stuck decode returns.
                debug!(decoder = self.shared.id, "Detaching busy region decoder worker");
            }
            _ => {
                if worker.join().is_err() {
                    warn!(decoder = self.shared.id, "Region decoder worker panicked");
                }
            }
        }
    }
}

/// Builder for [`SamplingDecoder`] with configuration options.
pub struct SamplingDecoderBuilder {
    rotation: Option<Rotation>,
    config: DecoderConfig,
    cache: Option<TileCache>,
    on_release: Option<ReleaseCallback>,
}

impl SamplingDecoderBuilder {
    pub fn new() -> Self {
        Self {
            rotation: None,
            config: DecoderConfig::default(),
            cache: None,
            on_release: None,
        }
    }

    /// Override the embedded orientation. `None` keeps the embedded one.
    pub fn rotation(mut self, rotation: Option<Rotation>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn config(mut self, config: DecoderConfig) -> Self {
        self.config = config;
        self
    }

    /// Share decoded regions through `cache`.
    pub fn cache(mut self, cache: TileCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run `callback` once when the decoder is released.
    pub fn on_release<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_release = Some(Box::new(callback));
        self
    }

    /// Open encoded bytes with the `image` backend.
    pub fn open(self, bytes: &[u8]) -> Result<SamplingDecoder, DecoderError> {
        let backend = ImageBackend::open(bytes)?;
        self.build(Box::new(backend))
    }

    /// Start a decoder over an existing backend.
    pub fn build(
        self,
        backend: Box<dyn RegionDecoderBackend>,
    ) -> Result<SamplingDecoder, DecoderError> {
        SamplingDecoder::start(
            backend,
            self.rotation,
            self.config,
            self.cache,
            self.on_release,
        )
    }
}

impl Default for SamplingDecoderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::image_backend::fixtures::{encode_jpeg_with_orientation, split_image};
    use crate::sampling::raster::RasterBackend;
    use flume::{Receiver, Sender};
    use image::RgbaImage;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default, Clone)]
    struct Counters {
        decodes: Arc<AtomicUsize>,
        recycles: Arc<AtomicUsize>,
    }

    /// Declares a size without holding pixels; regions come back blank.
    struct SyntheticBackend {
        width: u32,
        height: u32,
        recycled: AtomicBool,
        counters: Counters,
        started: Option<Sender<Rect>>,
        gate: Option<Receiver<()>>,
        fail_on: Option<Rect>,
        panic_on: Option<Rect>,
    }

    impl SyntheticBackend {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                recycled: AtomicBool::new(false),
                counters: Counters::default(),
                started: None,
                gate: None,
                fail_on: None,
                panic_on: None,
            }
        }

        /// Every decode reports on `started` and then waits for a token on the
        /// returned sender (or for it to be dropped).
        fn gated(mut self) -> (Self, Receiver<Rect>, Sender<()>) {
            let (started_tx, started_rx) = flume::unbounded();
            let (gate_tx, gate_rx) = flume::unbounded();
            self.started = Some(started_tx);
            self.gate = Some(gate_rx);
            (self, started_rx, gate_tx)
        }
    }

    impl RegionDecoderBackend for SyntheticBackend {
        fn intrinsic_width(&self) -> u32 {
            self.width
        }

        fn intrinsic_height(&self) -> u32 {
            self.height
        }

        fn source_hash(&self) -> u64 {
            (u64::from(self.width) << 32) | u64::from(self.height)
        }

        fn decode_region(
            &self,
            sample_size: u32,
            rect: Rect,
        ) -> Result<Option<PixelBuffer>, BackendError> {
            if let Some(started) = &self.started {
                let _ = started.send(rect);
            }
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            if self.recycled.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if self.fail_on == Some(rect) {
                return Err(BackendError::CorruptData {
                    reason: "bad block".to_string(),
                });
            }
            if self.panic_on == Some(rect) {
                panic!("native decoder crashed");
            }
            self.counters.decodes.fetch_add(1, Ordering::SeqCst);
            Ok(Some(PixelBuffer::new(RgbaImage::new(
                rect.width.div_ceil(sample_size),
                rect.height.div_ceil(sample_size),
            ))))
        }

        fn recycle(&self) {
            if !self.recycled.swap(true, Ordering::SeqCst) {
                self.counters.recycles.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_recycled(&self) -> bool {
            self.recycled.load(Ordering::SeqCst)
        }
    }

    /// Occupy the worker with a request that blocks until the gate opens.
    fn park_worker(decoder: &SamplingDecoder, started: &Receiver<Rect>) -> RegionHandle {
        let blocker = decoder
            .request_region_in(
                ViewportSlot::Custom(0),
                Rect::new(0, 0, 100, 100),
                Size::new(100, 100),
            )
            .unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), Rect::new(0, 0, 100, 100));
        blocker
    }

    /// Open a gated 10000x8000 decoder and park its worker on a blocker request.
    fn busy_decoder() -> (SamplingDecoder, RegionHandle, Sender<()>, Receiver<Rect>) {
        let (backend, started, gate) = SyntheticBackend::new(10_000, 8_000).gated();
        // Token for the thumbnail decoded during open.
        gate.send(()).unwrap();
        let decoder = SamplingDecoder::builder()
            .build(Box::new(backend))
            .unwrap();
        assert_eq!(started.recv_timeout(WAIT).unwrap(), Rect::of_size(10_000, 8_000));

        let blocker = park_worker(&decoder, &started);
        (decoder, blocker, gate, started)
    }

    fn is_red(pixel: &image::Rgba<u8>) -> bool {
        pixel[0] > 200 && pixel[2] < 80
    }

    fn is_blue(pixel: &image::Rgba<u8>) -> bool {
        pixel[2] > 200 && pixel[0] < 80
    }

    fn decoded(outcome: DecodeOutcome) -> DecodedRegion {
        match outcome {
            DecodeOutcome::Decoded(region) => region,
            other => panic!("expected decoded region, got {:?}", other),
        }
    }

    #[test]
    fn test_sample_size_for() {
        let rect = Rect::new(0, 0, 1000, 800);
        assert_eq!(sample_size_for(rect, Size::new(500, 400)), 2);
        assert_eq!(sample_size_for(rect, Size::new(100, 100)), 8);
        assert_eq!(sample_size_for(rect, Size::new(300, 300)), 2);
        assert_eq!(sample_size_for(rect, Size::new(2000, 2000)), 1);
        assert_eq!(sample_size_for(rect, Size::new(0, 400)), 1);
        assert_eq!(
            sample_size_for(Rect::new(0, 0, 3000, 3000), Size::new(500, 500)),
            4
        );
    }

    #[test]
    fn test_sample_size_for_width() {
        assert_eq!(sample_size_for_width(10_000, 720), 8);
        assert_eq!(sample_size_for_width(1440, 720), 2);
        assert_eq!(sample_size_for_width(720, 720), 1);
        assert_eq!(sample_size_for_width(100, 720), 1);
        assert_eq!(sample_size_for_width(100, 0), 1);
    }

    #[test]
    fn test_open_decodes_thumbnail() {
        let decoder = SamplingDecoder::builder()
            .build(Box::new(SyntheticBackend::new(10_000, 8_000)))
            .unwrap();
        assert_eq!(decoder.state(), DecoderState::Ready);
        assert_eq!(decoder.intrinsic_size(), Size::new(10_000, 8_000));

        let thumb = decoder.thumbnail().unwrap();
        assert_eq!((thumb.width(), thumb.height()), (1250, 1000));
    }

    #[test]
    fn test_open_garbage_fails() {
        let result = SamplingDecoder::open(b"not an image at all", None);
        assert!(matches!(
            result,
            Err(DecoderError::DecodeBackendUnavailable(_))
        ));
    }

    #[test]
    fn test_open_recycled_backend_fails() {
        let backend = SyntheticBackend::new(10, 10);
        backend.recycle();
        let result = SamplingDecoder::builder().build(Box::new(backend));
        assert!(matches!(
            result,
            Err(DecoderError::DecodeBackendUnavailable(BackendError::Disposed))
        ));
    }

    #[test]
    fn test_newer_request_supersedes_queued() {
        let (decoder, blocker, gate, _started) = busy_decoder();

        let first = decoder
            .request_region(Rect::new(0, 0, 1000, 800), Size::new(500, 400))
            .unwrap();
        assert_eq!(first.sample_size(), 2);
        let second = decoder
            .request_region(Rect::new(9000, 7000, 1000, 800), Size::new(500, 400))
            .unwrap();

        assert!(matches!(first.wait(), DecodeOutcome::Superseded));
        drop(gate);

        let region = decoded(second.wait_timeout(WAIT).unwrap());
        assert_eq!(region.request.rect, Rect::new(9000, 7000, 1000, 800));
        assert_eq!(region.sample_size(), 2);
        assert_eq!((region.buffer.width(), region.buffer.height()), (500, 400));
        assert!(!region.from_cache);
        assert!(blocker.wait_timeout(WAIT).unwrap().is_decoded());
    }

    #[test]
    fn test_in_flight_request_superseded_by_newer() {
        let (backend, started, gate) = SyntheticBackend::new(1000, 1000).gated();
        gate.send(()).unwrap();
        let decoder = SamplingDecoder::builder().build(Box::new(backend)).unwrap();
        started.recv_timeout(WAIT).unwrap();

        let first = decoder
            .request_region(Rect::new(0, 0, 100, 100), Size::new(100, 100))
            .unwrap();
        started.recv_timeout(WAIT).unwrap();
        let second = decoder
            .request_region(Rect::new(500, 500, 100, 100), Size::new(100, 100))
            .unwrap();
        drop(gate);

        assert!(matches!(
            first.wait_timeout(WAIT).unwrap(),
            DecodeOutcome::Superseded
        ));
        assert!(second.wait_timeout(WAIT).unwrap().is_decoded());
    }

    #[test]
    fn test_newest_request_served_first() {
        let (decoder, _blocker, gate, started) = busy_decoder();
        let older = decoder
            .request_region_in(
                ViewportSlot::Custom(1),
                Rect::new(0, 0, 10, 10),
                Size::new(10, 10),
            )
            .unwrap();
        let newer = decoder
            .request_region_in(
                ViewportSlot::Custom(2),
                Rect::new(20, 20, 10, 10),
                Size::new(10, 10),
            )
            .unwrap();
        drop(gate);

        assert!(newer.wait_timeout(WAIT).unwrap().is_decoded());
        assert!(older.wait_timeout(WAIT).unwrap().is_decoded());
        let order: Vec<Rect> = started.try_iter().collect();
        assert_eq!(order, vec![Rect::new(20, 20, 10, 10), Rect::new(0, 0, 10, 10)]);
    }

    #[test]
    fn test_release_cancels_pending() {
        let (decoder, blocker, gate, _started) = busy_decoder();

        let queued = decoder
            .request_region(Rect::new(0, 0, 1000, 800), Size::new(500, 400))
            .unwrap();
        assert_eq!(decoder.pending_count(), 2);

        decoder.release();
        decoder.release();

        assert!(matches!(queued.wait(), DecodeOutcome::Cancelled));
        assert!(matches!(blocker.wait(), DecodeOutcome::Cancelled));
        assert_eq!(decoder.state(), DecoderState::Released);
        assert_eq!(decoder.pending_count(), 0);
        assert!(matches!(
            decoder.request_region(Rect::new(0, 0, 10, 10), Size::new(10, 10)),
            Err(DecoderError::AlreadyReleased)
        ));
        assert!(matches!(
            decoder.thumbnail(),
            Err(DecoderError::AlreadyReleased)
        ));
        drop(gate);
    }

    #[test]
    fn test_release_recycles_once_and_notifies() {
        let backend = SyntheticBackend::new(100, 100);
        let counters = backend.counters.clone();
        let released = Arc::new(AtomicUsize::new(0));
        let decoder = {
            let released = Arc::clone(&released);
            SamplingDecoder::builder()
                .on_release(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                })
                .build(Box::new(backend))
                .unwrap()
        };

        decoder.release();
        decoder.release();
        drop(decoder);

        assert_eq!(counters.recycles.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_does_not_wait_for_stuck_decode() {
        let (backend, started, gate) = SyntheticBackend::new(1000, 1000).gated();
        let counters = backend.counters.clone();
        gate.send(()).unwrap();
        let decoder = SamplingDecoder::builder().build(Box::new(backend)).unwrap();
        started.recv_timeout(WAIT).unwrap();
        let blocker = park_worker(&decoder, &started);

        let (done_tx, done_rx) = flume::bounded(1);
        thread::spawn(move || {
            drop(decoder);
            let _ = done_tx.send(());
        });

        // The gate stays shut, so the worker is still inside the backend.
        done_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(counters.recycles.load(Ordering::SeqCst), 1);
        assert!(matches!(blocker.wait(), DecodeOutcome::Cancelled));
        drop(gate);
    }

    #[test]
    fn test_drop_releases_backend() {
        let backend = SyntheticBackend::new(100, 100);
        let counters = backend.counters.clone();
        let decoder = SamplingDecoder::builder().build(Box::new(backend)).unwrap();
        drop(decoder);
        assert_eq!(counters.recycles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_pending_slot() {
        let (decoder, _blocker, gate, _started) = busy_decoder();
        let handle = decoder
            .request_region_in(
                ViewportSlot::Custom(7),
                Rect::new(0, 0, 10, 10),
                Size::new(10, 10),
            )
            .unwrap();

        assert!(decoder.cancel(ViewportSlot::Custom(7)));
        assert!(!decoder.cancel(ViewportSlot::Custom(7)));
        assert!(matches!(handle.wait(), DecodeOutcome::Cancelled));
        drop(gate);
    }

    #[test]
    fn test_empty_region_rejected() {
        let decoder = SamplingDecoder::builder()
            .build(Box::new(SyntheticBackend::new(100, 100)))
            .unwrap();
        let result = decoder.request_region(Rect::new(200, 200, 10, 10), Size::new(10, 10));
        assert!(matches!(result, Err(DecoderError::EmptyRegion { .. })));
    }

    #[test]
    fn test_viewport_clamped_to_image() {
        let decoder = SamplingDecoder::builder()
            .build(Box::new(SyntheticBackend::new(100, 100)))
            .unwrap();
        let handle = decoder
            .request_region(Rect::new(50, 50, 100, 100), Size::new(50, 50))
            .unwrap();
        assert_eq!(handle.request().rect, Rect::new(50, 50, 50, 50));
        let region = decoded(handle.wait_timeout(WAIT).unwrap());
        assert_eq!((region.buffer.width(), region.buffer.height()), (50, 50));
    }

    #[test]
    fn test_backend_error_is_transient() {
        let mut backend = SyntheticBackend::new(100, 100);
        backend.fail_on = Some(Rect::new(0, 0, 10, 10));
        backend.panic_on = Some(Rect::new(10, 10, 10, 10));
        let decoder = SamplingDecoder::builder().build(Box::new(backend)).unwrap();

        let failed = decoder
            .request_region(Rect::new(0, 0, 10, 10), Size::new(10, 10))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(matches!(
            failed,
            DecodeOutcome::Failed(DecoderError::RegionDecodeFailed { .. })
        ));

        let panicked = decoder
            .request_region(Rect::new(10, 10, 10, 10), Size::new(10, 10))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(panicked.is_failure());

        let retry = decoder
            .request_region(Rect::new(20, 20, 10, 10), Size::new(10, 10))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(retry.is_decoded());
        assert_eq!(decoder.state(), DecoderState::Ready);
    }

    #[test]
    fn test_cache_hit_skips_backend() {
        let cache = TileCache::new(16);
        let backend = SyntheticBackend::new(1000, 1000);
        let counters = backend.counters.clone();
        let decoder = SamplingDecoder::builder()
            .cache(cache.clone())
            .build(Box::new(backend))
            .unwrap();
        let after_open = counters.decodes.load(Ordering::SeqCst);

        let rect = Rect::new(0, 0, 200, 200);
        let first = decoded(
            decoder
                .request_region(rect, Size::new(100, 100))
                .unwrap()
                .wait_timeout(WAIT)
                .unwrap(),
        );
        assert!(!first.from_cache);

        let second = decoded(
            decoder
                .request_region(rect, Size::new(100, 100))
                .unwrap()
                .try_outcome()
                .unwrap(),
        );
        assert!(second.from_cache);
        assert!(Arc::ptr_eq(&first.buffer, &second.buffer));
        assert_eq!(counters.decodes.load(Ordering::SeqCst), after_open + 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_request_joins_in_flight_decode() {
        let (backend, started, gate) = SyntheticBackend::new(1000, 1000).gated();
        let counters = backend.counters.clone();
        gate.send(()).unwrap();
        let decoder = SamplingDecoder::builder()
            .cache(TileCache::new(16))
            .build(Box::new(backend))
            .unwrap();
        started.recv_timeout(WAIT).unwrap();
        let after_open = counters.decodes.load(Ordering::SeqCst);

        let rect = Rect::new(0, 0, 200, 200);
        let first = decoder.request_region(rect, Size::new(100, 100)).unwrap();
        started.recv_timeout(WAIT).unwrap();
        let second = decoder.request_region(rect, Size::new(100, 100)).unwrap();
        let other_slot = decoder
            .request_region_in(ViewportSlot::Custom(3), rect, Size::new(100, 100))
            .unwrap();
        assert_eq!(decoder.pending_count(), 3);
        drop(gate);

        let first = decoded(first.wait_timeout(WAIT).unwrap());
        let second = decoded(second.wait_timeout(WAIT).unwrap());
        let other_slot = decoded(other_slot.wait_timeout(WAIT).unwrap());
        assert!(Arc::ptr_eq(&first.buffer, &second.buffer));
        assert!(Arc::ptr_eq(&first.buffer, &other_slot.buffer));
        assert_eq!(second.request.seq, first.request.seq + 1);
        assert_eq!(counters.decodes.load(Ordering::SeqCst), after_open + 1);
        assert!(started.try_recv().is_err());
    }

    #[test]
    fn test_cancel_detaches_joined_request() {
        let (decoder, _blocker, gate, _started) = busy_decoder();
        let rect = Rect::new(0, 0, 100, 100);
        let joined = decoder
            .request_region_in(ViewportSlot::Custom(5), rect, Size::new(100, 100))
            .unwrap();
        assert_eq!(decoder.pending_count(), 2);

        assert!(decoder.cancel(ViewportSlot::Custom(5)));
        assert!(matches!(joined.wait(), DecodeOutcome::Cancelled));
        assert_eq!(decoder.pending_count(), 1);
        drop(gate);
    }

    #[test]
    fn test_queued_request_served_from_cache() {
        let cache = TileCache::new(16);
        let (backend, started, gate) = SyntheticBackend::new(1000, 1000).gated();
        let counters = backend.counters.clone();
        let source = backend.source_hash();
        gate.send(()).unwrap();
        let decoder = SamplingDecoder::builder()
            .cache(cache.clone())
            .build(Box::new(backend))
            .unwrap();
        started.recv_timeout(WAIT).unwrap();
        let _blocker = park_worker(&decoder, &started);

        let rect = Rect::new(500, 500, 200, 200);
        let queued = decoder
            .request_region_in(ViewportSlot::Custom(1), rect, Size::new(100, 100))
            .unwrap();
        // Another decoder sharing the cache fills it while this one waits.
        let buffer = Arc::new(PixelBuffer::new(RgbaImage::new(100, 100)));
        cache.insert(
            TileKey {
                source,
                rotation: Rotation::Deg0,
                rect,
                sample_size: 2,
            },
            Arc::clone(&buffer),
        );
        gate.send(()).unwrap();

        let region = decoded(queued.wait_timeout(WAIT).unwrap());
        assert!(region.from_cache);
        assert!(Arc::ptr_eq(&region.buffer, &buffer));
        // Thumbnail and blocker only.
        assert_eq!(counters.decodes.load(Ordering::SeqCst), 2);
        assert!(started.try_recv().is_err());
    }

    #[test]
    fn test_request_tiles_cancels_offscreen() {
        let (decoder, _blocker, gate, _started) = busy_decoder();
        let display = Size::new(500, 400);

        let first = decoder
            .request_tiles(Rect::new(2000, 2000, 1000, 800), display)
            .unwrap();
        let indices: Vec<TileIndex> = first.iter().map(|(index, _)| *index).collect();
        assert_eq!(
            indices,
            vec![
                TileIndex::new(0, 0),
                TileIndex::new(1, 0),
                TileIndex::new(0, 1),
                TileIndex::new(1, 1)
            ]
        );

        let second = decoder
            .request_tiles(Rect::new(9000, 7000, 1000, 800), display)
            .unwrap();
        for (_, handle) in first {
            assert!(matches!(handle.wait(), DecodeOutcome::Cancelled));
        }
        drop(gate);

        let mut decoded_tiles = Vec::new();
        for (index, handle) in second {
            let region = decoded(handle.wait_timeout(WAIT).unwrap());
            decoded_tiles.push((index, region.buffer.width(), region.buffer.height()));
        }
        assert_eq!(
            decoded_tiles,
            vec![
                (TileIndex::new(3, 2), 1250, 1250),
                (TileIndex::new(3, 3), 1250, 250)
            ]
        );
    }

    #[test]
    fn test_set_max_block_count_rebuilds_grid() {
        let decoder = SamplingDecoder::builder()
            .build(Box::new(SyntheticBackend::new(10_000, 8_000)))
            .unwrap();
        assert_eq!(decoder.tile_grid().len(), 16);
        assert!(decoder.set_max_block_count(2));
        assert!(!decoder.set_max_block_count(2));
        assert_eq!(decoder.tile_grid().block_size(), 5_000);
    }

    #[test]
    fn test_embedded_orientation_rotates_output() {
        let bytes = encode_jpeg_with_orientation(&split_image(64, 32), 6);
        let decoder = SamplingDecoder::open(&bytes, None).unwrap();

        assert_eq!(decoder.rotation(), Rotation::Deg90);
        assert_eq!(decoder.native_size(), Size::new(64, 32));
        assert_eq!(decoder.intrinsic_size(), Size::new(32, 64));

        // The red left half of the stored image ends up on top.
        let thumb = decoder.thumbnail().unwrap();
        assert_eq!((thumb.width(), thumb.height()), (32, 64));
        assert!(is_red(thumb.as_image().get_pixel(16, 8)));
        assert!(is_blue(thumb.as_image().get_pixel(16, 56)));

        let handle = decoder
            .request_region(Rect::new(0, 0, 32, 16), Size::new(32, 16))
            .unwrap();
        assert_eq!(handle.request().native_rect, Rect::new(0, 0, 16, 32));
        let top = decoded(handle.wait_timeout(WAIT).unwrap());
        assert_eq!((top.buffer.width(), top.buffer.height()), (32, 16));
        assert!(is_red(top.buffer.as_image().get_pixel(16, 8)));

        let bottom = decoded(
            decoder
                .request_region(Rect::new(0, 48, 32, 16), Size::new(32, 16))
                .unwrap()
                .wait_timeout(WAIT)
                .unwrap(),
        );
        assert_eq!((bottom.buffer.width(), bottom.buffer.height()), (32, 16));
        assert!(is_blue(bottom.buffer.as_image().get_pixel(16, 8)));
    }

    #[test]
    fn test_rotation_override_maps_pixels() {
        let backend = RasterBackend::from_rgba(split_image(4, 2));
        let decoder = SamplingDecoder::builder()
            .rotation(Some(Rotation::Deg90))
            .build(Box::new(backend))
            .unwrap();
        assert_eq!(decoder.intrinsic_size(), Size::new(2, 4));

        let top = decoded(
            decoder
                .request_region(Rect::new(0, 0, 2, 2), Size::new(2, 2))
                .unwrap()
                .wait_timeout(WAIT)
                .unwrap(),
        );
        let bottom = decoded(
            decoder
                .request_region(Rect::new(0, 2, 2, 2), Size::new(2, 2))
                .unwrap()
                .wait_timeout(WAIT)
                .unwrap(),
        );
        assert!(top.buffer.as_image().pixels().all(|p| p.0 == [255, 0, 0, 255]));
        assert!(bottom.buffer.as_image().pixels().all(|p| p.0 == [0, 0, 255, 255]));
    }

    #[tokio::test]
    async fn test_outcome_awaitable() {
        let decoder = SamplingDecoder::builder()
            .build(Box::new(SyntheticBackend::new(2000, 2000)))
            .unwrap();
        let handle = decoder
            .request_region(Rect::new(0, 0, 2000, 2000), Size::new(500, 500))
            .unwrap();
        let region = handle.outcome().await.into_region().unwrap();
        assert_eq!(region.sample_size(), 4);
        assert_eq!(region.buffer.width(), 500);
    }
}
