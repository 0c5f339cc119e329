//! Per-resource records and the public handle type.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::CacheError;
use crate::geometry::ImageSpec;
use crate::plugin::ImageReader;

/// Lifecycle of a record's decoder attachment.
///
/// `Unopened -> Open` on a successful decoder attach, `Unopened -> Broken`
/// on failure. Broken stores the settled error and short-circuits every
/// later open attempt until the record is invalidated.
pub(crate) enum FileState {
    Unopened,
    Open,
    Broken(CacheError),
}

/// Mutable interior of a [`FileRecord`]: lifecycle state, the decoder
/// handle, and the subimage/miplevel counts discovered at open.
///
/// Everything here is guarded by one lock so a single-threaded decoder is
/// never entered concurrently, and open/mark-broken settles exactly once.
pub(crate) struct RecordInner {
    pub state: FileState,
    /// Open decoder, `None` when closed by the open-file cap. A record can
    /// be `Open` with no reader; it reopens silently on next use.
    pub reader: Option<Box<dyn ImageReader>>,
    pub subimages: u32,
    /// Miplevel count per subimage.
    pub miplevels: Vec<u32>,
}

/// Unique in-memory record for one resource.
pub(crate) struct FileRecord {
    name: Arc<str>,
    /// Identity embedded in tile keys. Bumped on invalidation so tiles of
    /// the old incarnation become unreachable.
    file_id: AtomicU64,
    /// True when synthetic: backed by an application-supplied reader, not
    /// counted against the open-file cap and never closed by it. Atomic
    /// because registering in-memory data under an existing name converts
    /// the record in place.
    synthetic: AtomicBool,
    pub(crate) inner: Mutex<RecordInner>,
    /// Cached geometry, `specs[subimage][miplevel]`, filled lazily.
    pub(crate) specs: RwLock<Vec<Vec<Option<Arc<ImageSpec>>>>>,
    /// Registry clock stamp of the last use, for LRU decoder closing.
    pub(crate) last_use: AtomicU64,
    /// Bumped on invalidation; lets per-thread caches detect staleness.
    generation: AtomicU64,
    /// Mirrors `inner.reader.is_some() && !synthetic`, readable without the
    /// record lock so the close sweep can scan cheaply.
    pub(crate) open: AtomicBool,
}

impl FileRecord {
    pub fn new(name: Arc<str>, file_id: u64, synthetic: bool) -> Self {
        Self {
            name,
            file_id: AtomicU64::new(file_id),
            synthetic: AtomicBool::new(synthetic),
            inner: Mutex::new(RecordInner {
                state: FileState::Unopened,
                reader: None,
                subimages: 0,
                miplevels: Vec::new(),
            }),
            specs: RwLock::new(Vec::new()),
            last_use: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> u64 {
        self.file_id.load(Ordering::Acquire)
    }

    pub fn swap_file_id(&self, new_id: u64) -> u64 {
        self.file_id.swap(new_id, Ordering::AcqRel)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic.load(Ordering::Acquire)
    }

    pub fn set_synthetic(&self, synthetic: bool) {
        self.synthetic.store(synthetic, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn touch(&self, stamp: u64) {
        self.last_use.store(stamp, Ordering::Relaxed);
    }

    /// Cached spec lookup without the record lock.
    pub fn cached_spec(&self, subimage: u32, miplevel: u32) -> Option<Arc<ImageSpec>> {
        self.specs
            .read()
            .get(subimage as usize)
            .and_then(|levels| levels.get(miplevel as usize))
            .and_then(|slot| slot.clone())
    }

    pub fn store_spec(&self, subimage: u32, miplevel: u32, spec: Arc<ImageSpec>) {
        let mut specs = self.specs.write();
        if let Some(slot) = specs
            .get_mut(subimage as usize)
            .and_then(|levels| levels.get_mut(miplevel as usize))
        {
            *slot = Some(spec);
        }
    }
}

// =============================================================================
// Image Handle
// =============================================================================

/// Opaque, cheap-to-copy reference to a cached file record.
///
/// Prefer handle-based calls after the first name lookup: they skip the
/// name hashing and map probe entirely. Handles stay valid across
/// invalidation (the record reopens on next use) and across decoder closes
/// forced by the open-file cap.
#[derive(Clone)]
pub struct ImageHandle {
    record: Arc<FileRecord>,
}

impl ImageHandle {
    pub(crate) fn new(record: Arc<FileRecord>) -> Self {
        Self { record }
    }

    /// The resource name this handle refers to.
    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub(crate) fn record(&self) -> &Arc<FileRecord> {
        &self.record
    }

    /// Current tile-key identity of the underlying record.
    pub(crate) fn file_id(&self) -> u64 {
        self.record.file_id()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.record.generation()
    }
}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageHandle")
            .field("name", &self.name())
            .field("file_id", &self.file_id())
            .finish()
    }
}
