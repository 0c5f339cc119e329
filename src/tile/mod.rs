//! Tile store: keys, pinned tile handles, and the byte-budgeted map.
//!
//! Tiles are keyed by [`TileId`] and held in a sharded map of
//! [`TileSlot`]s. A slot is either `Resident` (decoded pixels) or `Pending`
//! (one thread is decoding; the slot carries the rendezvous the other
//! threads wait on). The pending slot is what makes a miss single-flight:
//! for any given tile, the decode runs once no matter how many threads ask.
//!
//! A [`Tile`] handle pins its entry against eviction for as long as it (or
//! any clone) is alive. Eviction only ever considers unpinned entries.

mod store;

pub(crate) use store::TileStore;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::CacheError;
use crate::geometry::SampleType;

// =============================================================================
// Tile Id
// =============================================================================

/// Complete identity of one cached tile.
///
/// `file_id` is the record's current identity, not its name: invalidation
/// retires the id, which orphans every tile of the old incarnation without
/// touching the tile map. The channel range is part of the key, so requests
/// for different channel subsets of the same tile are distinct entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TileId {
    pub file_id: u64,
    pub subimage: u32,
    pub miplevel: u32,
    /// Tile origin, anchored on the tile grid of the level's data window.
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub chbegin: u32,
    pub chend: u32,
}

// =============================================================================
// Pixel Storage
// =============================================================================

/// Borrowed pixel memory for a tile added via the zero-copy path. The
/// application guarantees the allocation outlives the cache (or is removed
/// by invalidation first); the cache never frees it.
pub(crate) struct AliasedPixels {
    ptr: *const u8,
    len: usize,
}

// The cache only ever reads through the pointer, and validity is the
// caller's contract with `add_tile_shared`.
unsafe impl Send for AliasedPixels {}
unsafe impl Sync for AliasedPixels {}

/// Backing storage for a tile's pixels.
pub(crate) enum PixelData {
    /// Cache-owned allocation, counted against the memory budget and freed
    /// on eviction.
    Owned(Bytes),
    /// Application-owned memory. Costs the budget nothing and is never
    /// freed by eviction.
    Aliased(AliasedPixels),
}

impl PixelData {
    /// Wrap application-owned memory without copying.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` readable bytes that stay valid and
    /// unmodified until the tile is invalidated or the cache is dropped.
    pub unsafe fn aliased(ptr: *const u8, len: usize) -> Self {
        PixelData::Aliased(AliasedPixels { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            PixelData::Owned(bytes) => bytes,
            // Validity is guaranteed by the aliased constructor's contract.
            PixelData::Aliased(alias) => unsafe {
                std::slice::from_raw_parts(alias.ptr, alias.len)
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PixelData::Owned(bytes) => bytes.len(),
            PixelData::Aliased(alias) => alias.len,
        }
    }

    /// Bytes charged to the memory budget.
    pub fn charged_bytes(&self) -> usize {
        match self {
            PixelData::Owned(bytes) => bytes.len(),
            PixelData::Aliased(_) => 0,
        }
    }
}

// =============================================================================
// Tile Entry
// =============================================================================

/// One resident tile. Shared between the store's map, any number of pinned
/// [`Tile`] handles, and per-thread microcaches.
pub(crate) struct TileEntry {
    pub id: TileId,
    pixels: PixelData,
    /// Sample type of the stored pixels (the file's native type).
    format: SampleType,
    /// Outstanding pinned handles. Non-zero entries are never evicted.
    refs: AtomicU32,
    /// Store clock stamp of the most recent use, for LRU eviction.
    pub last_use: AtomicU64,
    /// Set when the entry leaves the map (eviction or invalidation), so
    /// handles that outlive residency can detect staleness.
    evicted: AtomicBool,
}

impl TileEntry {
    pub fn new(id: TileId, pixels: PixelData, format: SampleType) -> Self {
        Self {
            id,
            pixels,
            format,
            refs: AtomicU32::new(0),
            last_use: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        self.pixels.as_slice()
    }

    pub fn charged_bytes(&self) -> usize {
        self.pixels.charged_bytes()
    }

    pub fn is_pinned(&self) -> bool {
        self.refs.load(Ordering::Acquire) > 0
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn touch(&self, stamp: u64) {
        self.last_use.store(stamp, Ordering::Relaxed);
    }
}

// =============================================================================
// Tile Handle
// =============================================================================

/// Pinned reference to a resident tile.
///
/// While any handle to an entry is alive the entry cannot be evicted, so the
/// pixel slice stays valid; drop the handle (or pass it to
/// [`release_tile`](crate::ImageCache::release_tile)) to let the memory
/// budget reclaim it. Cloning is cheap and pins the entry once more.
pub struct Tile {
    entry: Arc<TileEntry>,
}

impl Tile {
    pub(crate) fn pin(entry: Arc<TileEntry>) -> Self {
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    /// Decoded pixels: x-fastest, tight-packed, the tile's full footprint in
    /// the requested channel range and the file's native sample type.
    pub fn pixels(&self) -> &[u8] {
        self.entry.pixels()
    }

    pub fn byte_len(&self) -> usize {
        self.entry.pixels.len()
    }

    /// Sample type of [`pixels`](Self::pixels).
    pub fn format(&self) -> SampleType {
        self.entry.format
    }

    pub(crate) fn entry(&self) -> &Arc<TileEntry> {
        &self.entry
    }

    pub(crate) fn id(&self) -> &TileId {
        &self.entry.id
    }

    /// Whether the underlying entry is still in the tile map. A stale
    /// handle's pixels remain readable; it just no longer counts as a cache
    /// residency.
    pub(crate) fn is_current(&self) -> bool {
        !self.entry.is_evicted()
    }
}

impl Clone for Tile {
    fn clone(&self) -> Self {
        Tile::pin(self.entry.clone())
    }
}

impl Drop for Tile {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.entry.id)
            .field("bytes", &self.entry.pixels.len())
            .finish()
    }
}

// =============================================================================
// In-Flight Decode
// =============================================================================

/// Rendezvous for a tile being decoded by one thread while others wait.
pub(crate) struct InFlight {
    result: Mutex<Option<Result<Arc<TileEntry>, CacheError>>>,
    ready: Condvar,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Publish the decode outcome and wake every waiter.
    pub fn publish(&self, outcome: Result<Arc<TileEntry>, CacheError>) {
        *self.result.lock() = Some(outcome);
        self.ready.notify_all();
    }

    /// Block until the producing thread publishes, then share its outcome.
    pub fn wait(&self) -> Result<Arc<TileEntry>, CacheError> {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = &*result {
                return outcome.clone();
            }
            self.ready.wait(&mut result);
        }
    }
}

/// State of one key in the tile map.
#[derive(Clone)]
pub(crate) enum TileSlot {
    /// A thread is decoding this tile; join it instead of decoding again.
    Pending(Arc<InFlight>),
    Resident(Arc<TileEntry>),
}

// =============================================================================
// Tests
// =============================================================================
