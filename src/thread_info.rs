//! Per-thread access context.
//!
//! Tile access is extremely repetitive: the next request is very often for
//! the tile just used, or the one before it. [`ThreadInfo`] exploits that
//! with a two-entry microcache of pinned tiles plus the last handle looked
//! up by name, answering repeats without touching any shared lock. It also
//! batches hot-path statistics locally so the common path never contends on
//! the global counters.
//!
//! A `ThreadInfo` is plain owned state: create one per worker thread with
//! [`ImageCache::create_thread_info`](crate::ImageCache::create_thread_info),
//! pass it by `&mut` to the pixel-path methods, and hand it back through
//! [`destroy_thread_info`](crate::ImageCache::destroy_thread_info) so its
//! batched counters reach the global statistics. Nothing is tied to actual
//! thread identity or TLS.

use crate::file::ImageHandle;
use crate::stats::{LocalStats, StatCounters};
use crate::tile::{Tile, TileId};

/// Local counter events accumulated before folding into the global stats.
const STAT_FOLD_THRESHOLD: u64 = 128;

/// Per-thread microcache and statistics buffer.
#[derive(Default)]
pub struct ThreadInfo {
    /// Last handle resolved by name.
    handle: Option<ImageHandle>,
    /// Most recently used tile, then the one before it.
    tile: Option<Tile>,
    lasttile: Option<Tile>,
    pub(crate) stats: LocalStats,
}

impl ThreadInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a name lookup from the cached handle, if it matches.
    pub(crate) fn find_handle(&self, name: &str) -> Option<ImageHandle> {
        self.handle
            .as_ref()
            .filter(|h| h.name() == name)
            .cloned()
    }

    pub(crate) fn remember_handle(&mut self, handle: ImageHandle) {
        self.handle = Some(handle);
    }

    /// Answer a tile lookup from the microcache. Entries that were evicted
    /// or invalidated since they were remembered are dropped, not returned.
    pub(crate) fn find_tile(&mut self, id: &TileId) -> Option<Tile> {
        if let Some(tile) = &self.tile {
            if !tile.is_current() {
                self.tile = None;
            } else if tile.id() == id {
                return self.tile.clone();
            }
        }
        if let Some(tile) = &self.lasttile {
            if !tile.is_current() {
                self.lasttile = None;
            } else if tile.id() == id {
                std::mem::swap(&mut self.tile, &mut self.lasttile);
                return self.tile.clone();
            }
        }
        None
    }

    /// Remember `tile` as the most recent, demoting the previous one.
    pub(crate) fn remember_tile(&mut self, tile: Tile) {
        if let Some(current) = &self.tile {
            if current.id() == tile.id() {
                self.tile = Some(tile);
                return;
            }
        }
        self.lasttile = std::mem::replace(&mut self.tile, Some(tile));
    }

    /// Drop the pinned tiles and cached handle, releasing their entries for
    /// eviction.
    pub fn clear(&mut self) {
        self.handle = None;
        self.tile = None;
        self.lasttile = None;
    }

    /// Fold local counters into the global stats when enough accumulated.
    pub(crate) fn maybe_fold(&mut self, global: &StatCounters) {
        if self.stats.pending() >= STAT_FOLD_THRESHOLD {
            self.stats.fold_into(global);
        }
    }

    pub(crate) fn fold(&mut self, global: &StatCounters) {
        self.stats.fold_into(global);
    }
}

impl std::fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("handle", &self.handle.as_ref().map(|h| h.name()))
            .field("tile", &self.tile.as_ref().map(|t| *t.id()))
            .field("lasttile", &self.lasttile.as_ref().map(|t| *t.id()))
            .finish()
    }
}
