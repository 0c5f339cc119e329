//! Byte-budgeted tile storage with single-flight decoding.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::geometry::SampleType;
use crate::map::ShardedMap;
use crate::stats::StatCounters;
use crate::tile::{InFlight, PixelData, Tile, TileEntry, TileId, TileSlot};

/// The tile map plus its memory accounting.
///
/// Residency is bounded by a byte budget over cache-owned pixel data.
/// Exceeding the budget triggers an approximate-LRU sweep that drops the
/// oldest unpinned tiles; pinned tiles and aliased (application-owned)
/// tiles are never candidates, so the budget is a target the resident
/// total converges to, not a hard ceiling.
pub(crate) struct TileStore {
    tiles: ShardedMap<TileId, TileSlot>,
    /// Cache-owned pixel bytes currently resident.
    mem_used: AtomicUsize,
    max_memory: AtomicUsize,
    /// Monotonic use clock; tiles are stamped on every touch.
    clock: AtomicU64,
    stats: Arc<StatCounters>,
}

impl TileStore {
    pub fn new(config: &CacheConfig, stats: Arc<StatCounters>) -> Self {
        Self {
            tiles: ShardedMap::with_bins(config.map_bins),
            mem_used: AtomicUsize::new(0),
            max_memory: AtomicUsize::new(config.max_memory_bytes),
            clock: AtomicU64::new(0),
            stats,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    // =========================================================================
    // Lookup & Decode
    // =========================================================================

    /// Fetch the tile for `id`, decoding it with `decode` on a miss.
    ///
    /// Exactly one thread runs `decode` for a given key; concurrent callers
    /// block on the in-flight slot and share the outcome. The returned tile
    /// is pinned, so the eviction pass triggered by this very insertion
    /// cannot reclaim it. The boolean reports whether the tile was already
    /// resident (or in flight) when we arrived.
    pub fn get_or_insert<F>(
        &self,
        id: TileId,
        format: SampleType,
        decode: F,
    ) -> Result<(Tile, bool), CacheError>
    where
        F: FnOnce() -> Result<PixelData, CacheError>,
    {
        let inflight = {
            let mut bin = self.tiles.lock_bin(&id);
            match bin.get(&id) {
                Some(TileSlot::Resident(entry)) => {
                    // Pin under the bin lock so eviction cannot slip in
                    // between the lookup and the pin.
                    let tile = Tile::pin(entry.clone());
                    drop(bin);
                    tile.entry().touch(self.tick());
                    return Ok((tile, true));
                }
                Some(TileSlot::Pending(inflight)) => inflight.clone(),
                None => {
                    let inflight = Arc::new(InFlight::new());
                    bin.insert(id, TileSlot::Pending(inflight.clone()));
                    drop(bin);
                    return self
                        .produce(id, format, inflight, decode)
                        .map(|t| (t, false));
                }
            }
        };

        // Join the decode already in flight. On failure the producer has
        // removed the slot; the shared error is reported as ours.
        let entry = inflight.wait()?;
        let tile = Tile::pin(entry);
        tile.entry().touch(self.tick());
        Ok((tile, true))
    }

    /// Run the decode we won, publish the outcome, and settle the slot.
    fn produce<F>(
        &self,
        id: TileId,
        format: SampleType,
        inflight: Arc<InFlight>,
        decode: F,
    ) -> Result<Tile, CacheError>
    where
        F: FnOnce() -> Result<PixelData, CacheError>,
    {
        match decode() {
            Ok(pixels) => {
                let charged = pixels.charged_bytes();
                let entry = Arc::new(TileEntry::new(id, pixels, format));
                entry.touch(self.tick());
                // Pin before the slot settles so the budget pass below
                // cannot reclaim the tile we are about to hand back.
                let tile = Tile::pin(entry.clone());
                {
                    let mut bin = self.tiles.lock_bin(&id);
                    let ours = matches!(
                        bin.get(&id),
                        Some(TileSlot::Pending(current)) if Arc::ptr_eq(current, &inflight)
                    );
                    if ours {
                        bin.insert(id, TileSlot::Resident(entry.clone()));
                        self.mem_used.fetch_add(charged, Ordering::AcqRel);
                    } else {
                        // Invalidation swept our pending slot while we
                        // decoded. Waiters still get the pixels; the tile
                        // just never becomes resident.
                        entry.mark_evicted();
                    }
                }
                self.stats.tiles_created.fetch_add(1, Ordering::Relaxed);
                trace!(?id, bytes = charged, "tile decoded");
                inflight.publish(Ok(entry));
                self.enforce_budget();
                Ok(tile)
            }
            Err(err) => {
                // Errors are not cached: remove the slot so the next
                // request retries the decode.
                let mut bin = self.tiles.lock_bin(&id);
                let ours = matches!(
                    bin.get(&id),
                    Some(TileSlot::Pending(current)) if Arc::ptr_eq(current, &inflight)
                );
                if ours {
                    bin.remove(&id);
                }
                drop(bin);
                inflight.publish(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Insert a tile directly, replacing any resident entry under the same
    /// key. Used by the application-push paths, which bypass decoding.
    pub fn add(&self, id: TileId, pixels: PixelData, format: SampleType) -> Arc<TileEntry> {
        let charged = pixels.charged_bytes();
        let entry = Arc::new(TileEntry::new(id, pixels, format));
        entry.touch(self.tick());

        let mut bin = self.tiles.lock_bin(&id);
        let old = bin.insert(id, TileSlot::Resident(entry.clone()));
        drop(bin);
        if let Some(TileSlot::Resident(old)) = old {
            old.mark_evicted();
            self.mem_used.fetch_sub(old.charged_bytes(), Ordering::AcqRel);
        }
        self.mem_used.fetch_add(charged, Ordering::AcqRel);
        self.stats.tiles_created.fetch_add(1, Ordering::Relaxed);
        self.enforce_budget();
        entry
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Drop oldest unpinned tiles until owned residency is back under the
    /// budget. Best effort: a tile pinned between the scan and the removal
    /// is skipped, and aliased tiles are never touched.
    pub fn enforce_budget(&self) {
        let max = self.max_memory.load(Ordering::Relaxed);
        if self.mem_used.load(Ordering::Acquire) <= max {
            return;
        }

        let mut candidates: Vec<(u64, TileId)> = Vec::new();
        self.tiles.for_each(|id, slot| {
            if let TileSlot::Resident(entry) = slot {
                if !entry.is_pinned() && entry.charged_bytes() > 0 {
                    candidates.push((entry.last_use.load(Ordering::Relaxed), *id));
                }
            }
        });
        candidates.sort_unstable_by_key(|(stamp, _)| *stamp);

        let mut dropped = 0usize;
        for (_, id) in candidates {
            if self.mem_used.load(Ordering::Acquire) <= max {
                break;
            }
            if self.evict(&id) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(
                dropped,
                resident_bytes = self.mem_used.load(Ordering::Relaxed),
                "eviction pass finished"
            );
        }
    }

    fn evict(&self, id: &TileId) -> bool {
        let mut bin = self.tiles.lock_bin(id);
        let evictable = matches!(
            bin.get(id),
            Some(TileSlot::Resident(entry)) if !entry.is_pinned()
        );
        if !evictable {
            return false;
        }
        let Some(TileSlot::Resident(entry)) = bin.remove(id) else {
            return false;
        };
        drop(bin);
        entry.mark_evicted();
        self.mem_used.fetch_sub(entry.charged_bytes(), Ordering::AcqRel);
        self.stats.tiles_evicted.fetch_add(1, Ordering::Relaxed);
        true
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove every tile (resident or pending) keyed under `file_id`.
    pub fn invalidate_file(&self, file_id: u64) {
        let mut freed = 0usize;
        let mut removed = 0u64;
        self.tiles.retain(|id, slot| {
            if id.file_id != file_id {
                return true;
            }
            if let TileSlot::Resident(entry) = slot {
                entry.mark_evicted();
                freed += entry.charged_bytes();
            }
            removed += 1;
            false
        });
        self.mem_used.fetch_sub(freed, Ordering::AcqRel);
        self.stats.tiles_evicted.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            debug!(file_id, removed, "purged tiles for invalidated resource");
        }
    }

    /// Remove everything and zero the accounting.
    pub fn clear(&self) {
        self.tiles.retain(|_, slot| {
            if let TileSlot::Resident(entry) = slot {
                entry.mark_evicted();
            }
            false
        });
        self.mem_used.store(0, Ordering::Release);
    }

    // =========================================================================
    // Limits & Introspection
    // =========================================================================

    pub fn set_max_memory(&self, bytes: usize) {
        self.max_memory.store(bytes, Ordering::Relaxed);
        self.enforce_budget();
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory.load(Ordering::Relaxed)
    }

    pub fn resident_bytes(&self) -> usize {
        self.mem_used.load(Ordering::Acquire)
    }

    pub fn resident_tiles(&self) -> usize {
        let mut count = 0;
        self.tiles.for_each(|_, slot| {
            if matches!(slot, TileSlot::Resident(_)) {
                count += 1;
            }
        });
        count
    }
}

// =============================================================================
// Tests
// =============================================================================
