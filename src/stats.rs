//! Cache statistics.
//!
//! Hot-path counters accumulate in each thread's
//! [`ThreadInfo`](crate::ThreadInfo) and fold into these process-wide
//! atomics in batches, so the common path never contends on a shared
//! counter. [`CacheStats`] is a point-in-time snapshot for callers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Global atomic counters owned by one cache instance.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub tile_queries: AtomicU64,
    pub tile_hits: AtomicU64,
    pub microcache_hits: AtomicU64,
    pub tiles_created: AtomicU64,
    pub tiles_evicted: AtomicU64,
    pub bytes_decoded: AtomicU64,
    pub files_opened: AtomicU64,
    pub files_closed: AtomicU64,
    pub open_failures: AtomicU64,
    pub open_files_peak: AtomicUsize,
}

impl StatCounters {
    pub fn note_open_files(&self, current: usize) {
        self.open_files_peak.fetch_max(current, Ordering::Relaxed);
    }
}

/// Snapshot of cache activity and residency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Tile lookups through `get_tile` (including microcache hits).
    pub tile_queries: u64,
    /// Lookups satisfied by a resident tile (microcache or main map).
    pub tile_hits: u64,
    /// Subset of hits satisfied by the per-thread microcache alone.
    pub microcache_hits: u64,
    /// Tiles decoded or added.
    pub tiles_created: u64,
    /// Tiles dropped by the eviction pass.
    pub tiles_evicted: u64,
    /// Bytes produced by decode calls.
    pub bytes_decoded: u64,
    /// Successful decoder opens (including silent reopens).
    pub files_opened: u64,
    /// Decoder handles closed by the open-file cap or invalidation.
    pub files_closed: u64,
    /// Opens that failed and marked a resource broken.
    pub open_failures: u64,
    /// Most decoder handles simultaneously open.
    pub open_files_peak: usize,
    /// Decoder handles currently open.
    pub open_files: usize,
    /// Decoded tile bytes currently resident.
    pub resident_bytes: usize,
    /// Tiles currently resident.
    pub resident_tiles: usize,
    /// File records currently known (open, unopened, or broken).
    pub known_files: usize,
}

impl StatCounters {
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            tile_queries: self.tile_queries.load(Ordering::Relaxed),
            tile_hits: self.tile_hits.load(Ordering::Relaxed),
            microcache_hits: self.microcache_hits.load(Ordering::Relaxed),
            tiles_created: self.tiles_created.load(Ordering::Relaxed),
            tiles_evicted: self.tiles_evicted.load(Ordering::Relaxed),
            bytes_decoded: self.bytes_decoded.load(Ordering::Relaxed),
            files_opened: self.files_opened.load(Ordering::Relaxed),
            files_closed: self.files_closed.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            open_files_peak: self.open_files_peak.load(Ordering::Relaxed),
            open_files: 0,
            resident_bytes: 0,
            resident_tiles: 0,
            known_files: 0,
        }
    }
}

/// Per-thread counters, folded into the global [`StatCounters`] in batches.
#[derive(Debug, Default, Clone)]
pub(crate) struct LocalStats {
    pub tile_queries: u64,
    pub tile_hits: u64,
    pub microcache_hits: u64,
    pub bytes_decoded: u64,
}

impl LocalStats {
    /// Total events accumulated since the last fold.
    pub fn pending(&self) -> u64 {
        self.tile_queries + self.bytes_decoded
    }

    pub fn fold_into(&mut self, global: &StatCounters) {
        if self.tile_queries > 0 {
            global
                .tile_queries
                .fetch_add(self.tile_queries, Ordering::Relaxed);
        }
        if self.tile_hits > 0 {
            global.tile_hits.fetch_add(self.tile_hits, Ordering::Relaxed);
        }
        if self.microcache_hits > 0 {
            global
                .microcache_hits
                .fetch_add(self.microcache_hits, Ordering::Relaxed);
        }
        if self.bytes_decoded > 0 {
            global
                .bytes_decoded
                .fetch_add(self.bytes_decoded, Ordering::Relaxed);
        }
        *self = LocalStats::default();
    }
}
