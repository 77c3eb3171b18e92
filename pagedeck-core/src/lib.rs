use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{instrument, warn};
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("4c9f7a83-20d1-5e6b-9b0a-61c84fd2e905").expect("valid namespace UUID")
});

/// Content-addressed id: the same byte stream always maps to the same document.
pub fn document_id_for_bytes(bytes: &[u8]) -> DocumentId {
    Uuid::new_v5(&DOCUMENT_NAMESPACE, bytes)
}

pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 2.0;
pub const ZOOM_STEP: f32 = 0.1;
pub const THUMBNAIL_SCALE: f32 = 0.2;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("document bytes did not parse: {detail}")]
    Malformed { detail: String },
    #[error("unsupported document payload: {detail}")]
    Unsupported { detail: String },
    #[error("document contains no pages")]
    Empty,
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("no drawable surface for page {page}")]
    SurfaceUnavailable { page: usize },
    #[error("failed to decode page {page}: {detail}")]
    DecodeFailed { page: usize, detail: String },
    #[error("render of page {page} timed out")]
    Timeout { page: usize },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("source document bytes are no longer retained")]
    SourceUnavailable,
    #[error("failed to copy page {page}: {detail}")]
    CopyFailed { page: usize, detail: String },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("server unreachable: {detail}")]
    Unreachable { detail: String },
    #[error("server returned status {status}")]
    ServerError { status: u16 },
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterKind {
    Thumbnail,
    FullPage,
}

/// Transform inputs captured at request time. A raster produced from this
/// request is valid only while the page's transform still matches.
#[derive(Debug, Clone, Copy)]
pub struct RasterRequest {
    pub page_index: usize,
    pub kind: RasterKind,
    pub rotation: u16,
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct RasterEntry {
    pub page_index: usize,
    pub kind: RasterKind,
    pub rotation: u16,
    pub scale: f32,
    pub image: RenderImage,
}

#[async_trait]
pub trait PageRasterizer: Send + Sync {
    fn page_count(&self) -> usize;
    async fn rasterize(&self, request: RasterRequest) -> Result<RenderImage, RenderError>;
}

#[async_trait]
pub trait DocumentDecoder: Send + Sync {
    async fn decode(&self, bytes: Bytes) -> Result<Arc<dyn PageRasterizer>, LoadError>;
}

/// A loaded document. Immutable after load; the original bytes are retained
/// so the export builder can reconstruct output without re-rasterizing.
#[derive(Clone)]
pub struct Document {
    id: DocumentId,
    page_count: usize,
    source: Bytes,
    rasterizer: Arc<dyn PageRasterizer>,
}

impl Document {
    pub async fn load(decoder: &dyn DocumentDecoder, bytes: Bytes) -> Result<Self, LoadError> {
        let rasterizer = decoder.decode(bytes.clone()).await?;
        let page_count = rasterizer.page_count();
        if page_count == 0 {
            return Err(LoadError::Empty);
        }
        Ok(Self {
            id: document_id_for_bytes(&bytes),
            page_count,
            source: bytes,
            rasterizer,
        })
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn source_bytes(&self) -> &Bytes {
        &self.source
    }

    pub fn rasterizer(&self) -> Arc<dyn PageRasterizer> {
        Arc::clone(&self.rasterizer)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("page_count", &self.page_count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateDirection {
    Clockwise,
    CounterClockwise,
}

impl RotateDirection {
    pub fn degrees(self) -> i32 {
        match self {
            RotateDirection::Clockwise => 90,
            RotateDirection::CounterClockwise => -90,
        }
    }
}

fn normalize_degrees(value: i32) -> u16 {
    (((value % 360) + 360) % 360) as u16
}

/// Global scale, per-page rotation and the selection set. Never mutated in
/// place: every operation returns the next state plus the list of pages whose
/// cached raster it invalidated.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformState {
    scale: f32,
    rotation: Vec<u16>,
    selection: BTreeSet<usize>,
}

impl TransformState {
    pub fn new(page_count: usize) -> Self {
        Self {
            scale: 1.0,
            rotation: vec![0; page_count],
            selection: BTreeSet::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.rotation.len()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn rotation(&self, page_index: usize) -> u16 {
        self.rotation.get(page_index).copied().unwrap_or(0)
    }

    pub fn selection(&self) -> &BTreeSet<usize> {
        &self.selection
    }

    pub fn set_scale(&self, scale: f32) -> (Self, Vec<usize>) {
        let clamped = scale.clamp(MIN_SCALE, MAX_SCALE);
        let mut next = self.clone();
        next.scale = clamped;
        let stale = if (clamped - self.scale).abs() > f32::EPSILON {
            (0..self.rotation.len()).collect()
        } else {
            Vec::new()
        };
        (next, stale)
    }

    pub fn zoom_in(&self) -> (Self, Vec<usize>) {
        self.set_scale(self.scale + ZOOM_STEP)
    }

    pub fn zoom_out(&self) -> (Self, Vec<usize>) {
        self.set_scale(self.scale - ZOOM_STEP)
    }

    pub fn toggle_selection(&self, page_index: usize) -> (Self, Vec<usize>) {
        let mut next = self.clone();
        if page_index < next.rotation.len() && !next.selection.remove(&page_index) {
            next.selection.insert(page_index);
        }
        (next, Vec::new())
    }

    pub fn clear_selection(&self) -> (Self, Vec<usize>) {
        let mut next = self.clone();
        next.selection.clear();
        (next, Vec::new())
    }

    /// Applies a ±90° delta to the selected pages, or to every page when the
    /// selection is empty. Rotation is cumulative and normalized to [0, 360).
    pub fn rotate(&self, direction: RotateDirection) -> (Self, Vec<usize>) {
        let targets: Vec<usize> = if self.selection.is_empty() {
            (0..self.rotation.len()).collect()
        } else {
            self.selection.iter().copied().collect()
        };
        let mut next = self.clone();
        for &page in &targets {
            if let Some(slot) = next.rotation.get_mut(page) {
                *slot = normalize_degrees(i32::from(*slot) + direction.degrees());
            }
        }
        (next, targets)
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// One thumbnail and one full-page slot per page, latest-wins. An entry is
/// returned only when its captured rotation (and scale, for full pages)
/// matches the requested transform; anything else is a miss.
#[derive(Default)]
pub struct RasterCache {
    slots: Mutex<HashMap<(usize, RasterKind), RasterEntry>>,
}

impl RasterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thumbnail(&self, page_index: usize, rotation: u16) -> Option<RasterEntry> {
        self.slots
            .lock()
            .get(&(page_index, RasterKind::Thumbnail))
            .filter(|entry| entry.rotation == rotation)
            .cloned()
    }

    pub fn full_page(&self, page_index: usize, rotation: u16, scale: f32) -> Option<RasterEntry> {
        self.slots
            .lock()
            .get(&(page_index, RasterKind::FullPage))
            .filter(|entry| {
                entry.rotation == rotation && quantize_scale(entry.scale) == quantize_scale(scale)
            })
            .cloned()
    }

    pub fn put(&self, entry: RasterEntry) {
        self.slots
            .lock()
            .insert((entry.page_index, entry.kind), entry);
    }

    pub fn invalidate(&self, page_index: usize) {
        let mut slots = self.slots.lock();
        slots.remove(&(page_index, RasterKind::Thumbnail));
        slots.remove(&(page_index, RasterKind::FullPage));
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId {
    pub kind: RasterKind,
    pub page_index: usize,
}

impl SurfaceId {
    pub fn thumbnail(page_index: usize) -> Self {
        Self {
            kind: RasterKind::Thumbnail,
            page_index,
        }
    }

    pub fn full_page(page_index: usize) -> Self {
        Self {
            kind: RasterKind::FullPage,
            page_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Rendering,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub enum RenderEvent {
    Completed { surface: SurfaceId, generation: u64 },
    Failed { surface: SurfaceId, error: RenderError },
}

struct SurfaceSlot {
    generation: u64,
    state: SurfaceState,
    task: Option<JoinHandle<()>>,
}

impl SurfaceSlot {
    fn new() -> Self {
        Self {
            generation: 0,
            state: SurfaceState::Idle,
            task: None,
        }
    }
}

/// Raster surfaces for the loaded document, one per page and kind. Lifetime
/// is tied to the document: a new load rebuilds the arena from scratch.
struct SurfaceArena {
    thumbnails: Vec<SurfaceSlot>,
    full_pages: Vec<SurfaceSlot>,
}

impl SurfaceArena {
    fn new(page_count: usize) -> Self {
        Self {
            thumbnails: (0..page_count).map(|_| SurfaceSlot::new()).collect(),
            full_pages: (0..page_count).map(|_| SurfaceSlot::new()).collect(),
        }
    }

    fn slot(&self, surface: SurfaceId) -> Option<&SurfaceSlot> {
        match surface.kind {
            RasterKind::Thumbnail => self.thumbnails.get(surface.page_index),
            RasterKind::FullPage => self.full_pages.get(surface.page_index),
        }
    }

    fn slot_mut(&mut self, surface: SurfaceId) -> Option<&mut SurfaceSlot> {
        match surface.kind {
            RasterKind::Thumbnail => self.thumbnails.get_mut(surface.page_index),
            RasterKind::FullPage => self.full_pages.get_mut(surface.page_index),
        }
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>, notify: Arc<Notify>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter, notify }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Issues, tracks and cancels asynchronous renders. Every surface owns a
/// monotonically increasing generation counter; a task captures its
/// generation at issue time and its result is applied only if the counter is
/// unchanged at completion. Cancellation is therefore best-effort: an abort
/// that misses still cannot publish a stale raster.
pub struct RenderScheduler {
    rasterizer: Arc<dyn PageRasterizer>,
    cache: Arc<RasterCache>,
    arena: Arc<Mutex<SurfaceArena>>,
    full_render_permits: Arc<Semaphore>,
    thumbnail_scale: f32,
    in_flight: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
    events: Arc<Mutex<Vec<RenderEvent>>>,
}

impl RenderScheduler {
    pub fn new(
        rasterizer: Arc<dyn PageRasterizer>,
        cache: Arc<RasterCache>,
        config: &PagedeckConfig,
    ) -> Self {
        let page_count = rasterizer.page_count();
        Self {
            rasterizer,
            cache,
            arena: Arc::new(Mutex::new(SurfaceArena::new(page_count))),
            full_render_permits: Arc::new(Semaphore::new(config.max_concurrent_renders.max(1))),
            thumbnail_scale: config.thumbnail_scale,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle_notify: Arc::new(Notify::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Supersedes any in-flight render for the surface and starts a new one
    /// at the captured transform. Returns without waiting for completion.
    #[instrument(skip(self))]
    pub fn request_render(
        &self,
        surface: SurfaceId,
        rotation: u16,
        scale: f32,
    ) -> Result<(), RenderError> {
        let generation = {
            let mut arena = self.arena.lock();
            let slot = arena
                .slot_mut(surface)
                .ok_or(RenderError::SurfaceUnavailable {
                    page: surface.page_index,
                })?;
            slot.generation += 1;
            if let Some(task) = slot.task.take() {
                task.abort();
            }
            slot.state = SurfaceState::Rendering;
            slot.generation
        };

        let request = RasterRequest {
            page_index: surface.page_index,
            kind: surface.kind,
            rotation,
            scale: match surface.kind {
                RasterKind::Thumbnail => self.thumbnail_scale,
                RasterKind::FullPage => scale,
            },
        };

        let rasterizer = Arc::clone(&self.rasterizer);
        let cache = Arc::clone(&self.cache);
        let arena = Arc::clone(&self.arena);
        let events = Arc::clone(&self.events);
        let permits = matches!(surface.kind, RasterKind::FullPage)
            .then(|| Arc::clone(&self.full_render_permits));
        let guard =
            InFlightGuard::enter(Arc::clone(&self.in_flight), Arc::clone(&self.idle_notify));

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = match permits {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };

            let outcome = rasterizer.rasterize(request).await;

            let mut arena = arena.lock();
            let Some(slot) = arena.slot_mut(surface) else {
                return;
            };
            if slot.generation != generation {
                // Superseded while rendering; the result is stale and dropped.
                return;
            }
            slot.task = None;
            match outcome {
                Ok(image) => {
                    cache.put(RasterEntry {
                        page_index: surface.page_index,
                        kind: surface.kind,
                        rotation: request.rotation,
                        scale: request.scale,
                        image,
                    });
                    slot.state = SurfaceState::Completed;
                    events
                        .lock()
                        .push(RenderEvent::Completed { surface, generation });
                }
                Err(error) => {
                    slot.state = SurfaceState::Failed;
                    events.lock().push(RenderEvent::Failed { surface, error });
                }
            }
        });

        let mut arena = self.arena.lock();
        if let Some(slot) = arena.slot_mut(surface) {
            if slot.generation == generation {
                slot.task = Some(handle);
            } else {
                handle.abort();
            }
        }
        Ok(())
    }

    /// Cancels the surface's in-flight render, if any, without issuing a
    /// replacement. Discarded results are not reported as errors.
    pub fn cancel(&self, surface: SurfaceId) {
        let mut arena = self.arena.lock();
        let Some(slot) = arena.slot_mut(surface) else {
            return;
        };
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        if slot.state == SurfaceState::Rendering {
            slot.state = SurfaceState::Cancelled;
        }
    }

    pub fn surface_state(&self, surface: SurfaceId) -> Option<SurfaceState> {
        self.arena.lock().slot(surface).map(|slot| slot.state)
    }

    pub fn events(&self) -> Arc<Mutex<Vec<RenderEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<RenderEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Resolves once every spawned render task has finished or been aborted.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle_notify.notified());
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn download(&self, id: DocumentId) -> Result<Bytes, NetworkError>;
    async fn upload(&self, id: DocumentId, bytes: Bytes) -> Result<UploadReceipt, NetworkError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagedeckConfig {
    pub max_concurrent_renders: usize,
    pub thumbnail_scale: f32,
    pub request_timeout_secs: u64,
}

impl Default for PagedeckConfig {
    fn default() -> Self {
        Self {
            max_concurrent_renders: 4,
            thumbnail_scale: THUMBNAIL_SCALE,
            request_timeout_secs: 30,
        }
    }
}

impl PagedeckConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {:?}", path))
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(error) => {
                warn!(?error, "falling back to default configuration");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    ZoomIn,
    ZoomOut,
    SetScale { scale: f32 },
    RotateLeft,
    RotateRight,
    ToggleSelect { page: usize },
    ClearSelection,
    GotoPage { page: usize },
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    DocumentLoaded(DocumentId),
    TransformChanged { stale_pages: Vec<usize> },
    CurrentPageChanged(usize),
}

struct OpenDocument {
    document: Document,
    transform: TransformState,
    cache: Arc<RasterCache>,
    scheduler: RenderScheduler,
    current_page: usize,
}

impl OpenDocument {
    /// Every stale page gets both of its surfaces refreshed: the thumbnail
    /// and the full-resolution raster are independent tasks sharing the
    /// page's transform inputs.
    fn schedule_page(&self, page: usize) -> Result<(), RenderError> {
        let rotation = self.transform.rotation(page);
        let scale = self.transform.scale();
        self.scheduler
            .request_render(SurfaceId::thumbnail(page), rotation, scale)?;
        self.scheduler
            .request_render(SurfaceId::full_page(page), rotation, scale)?;
        Ok(())
    }
}

/// Owns the single loaded document plus its transform state, cache and
/// scheduler, and turns commands into pure state transitions followed by
/// re-render scheduling for exactly the pages each transition staled.
pub struct Session {
    config: PagedeckConfig,
    open: Option<OpenDocument>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Session {
    pub fn new(config: PagedeckConfig) -> Self {
        Self {
            config,
            open: None,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn document(&self) -> Option<&Document> {
        self.open.as_ref().map(|open| &open.document)
    }

    pub fn transform(&self) -> Option<&TransformState> {
        self.open.as_ref().map(|open| &open.transform)
    }

    pub fn cache(&self) -> Option<&RasterCache> {
        self.open.as_ref().map(|open| open.cache.as_ref())
    }

    pub fn scheduler(&self) -> Option<&RenderScheduler> {
        self.open.as_ref().map(|open| &open.scheduler)
    }

    pub fn current_page(&self) -> Option<usize> {
        self.open.as_ref().map(|open| open.current_page)
    }

    /// Snapshot for the export builder: a consistent (document, transform)
    /// pair unaffected by commands applied while the export runs.
    pub fn export_snapshot(&self) -> Option<(Document, TransformState)> {
        self.open
            .as_ref()
            .map(|open| (open.document.clone(), open.transform.clone()))
    }

    /// Decodes `bytes` into a fresh document and replaces the current one,
    /// rebuilding cache and surfaces. A failed load leaves the previously
    /// loaded document untouched.
    #[instrument(skip(self, decoder, bytes), fields(len = bytes.len()))]
    pub async fn open_bytes(
        &mut self,
        decoder: &dyn DocumentDecoder,
        bytes: Bytes,
    ) -> Result<DocumentId, LoadError> {
        let document = Document::load(decoder, bytes).await?;
        let cache = Arc::new(RasterCache::new());
        let scheduler =
            RenderScheduler::new(document.rasterizer(), Arc::clone(&cache), &self.config);
        let transform = TransformState::new(document.page_count());
        let id = document.id();
        let open = OpenDocument {
            document,
            transform,
            cache,
            scheduler,
            current_page: 0,
        };
        for page in 0..open.document.page_count() {
            if let Err(error) = open.schedule_page(page) {
                warn!(?error, page, "failed to seed initial render");
            }
        }
        self.open = Some(open);
        self.events.lock().push(SessionEvent::DocumentLoaded(id));
        Ok(id)
    }

    pub fn apply(&mut self, command: Command) -> Result<(), RenderError> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        match command {
            Command::ZoomIn => {
                let (next, stale) = open.transform.zoom_in();
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::ZoomOut => {
                let (next, stale) = open.transform.zoom_out();
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::SetScale { scale } => {
                let (next, stale) = open.transform.set_scale(scale);
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::RotateLeft => {
                let (next, stale) = open.transform.rotate(RotateDirection::CounterClockwise);
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::RotateRight => {
                let (next, stale) = open.transform.rotate(RotateDirection::Clockwise);
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::ToggleSelect { page } => {
                let (next, stale) = open.transform.toggle_selection(page);
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::ClearSelection => {
                let (next, stale) = open.transform.clear_selection();
                Self::commit(open, &self.events, next, stale)?;
            }
            Command::GotoPage { page } => {
                let clamped = page.min(open.document.page_count().saturating_sub(1));
                if clamped != open.current_page {
                    open.current_page = clamped;
                    self.events
                        .lock()
                        .push(SessionEvent::CurrentPageChanged(clamped));
                }
            }
        }
        Ok(())
    }

    fn commit(
        open: &mut OpenDocument,
        events: &Arc<Mutex<Vec<SessionEvent>>>,
        next: TransformState,
        stale: Vec<usize>,
    ) -> Result<(), RenderError> {
        open.transform = next;
        for &page in &stale {
            open.cache.invalidate(page);
            open.schedule_page(page)?;
        }
        events
            .lock()
            .push(SessionEvent::TransformChanged { stale_pages: stale });
        Ok(())
    }

    pub async fn wait_idle(&self) {
        if let Some(open) = &self.open {
            open.scheduler.wait_idle().await;
        }
    }
}
