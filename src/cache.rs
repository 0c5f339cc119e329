//! The public cache facade.
//!
//! [`ImageCache`] ties the pieces together: the file registry resolves names
//! to records and serializes decoder access, the tile store holds the
//! bounded working set, and [`ThreadInfo`] gives each worker thread a
//! contention-free fast path. `get_pixels` is the main entry point for
//! most callers; `get_tile`/`release_tile` expose the raw tile granularity
//! for code that wants to manage its own pixel access.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::file::{FileRegistry, ImageHandle};
use crate::geometry::{convert_samples, fill_samples, ChannelRange, ImageSpec, Region, SampleType};
use crate::plugin::{ImageOpener, ImageReader, MemoryOpener};
use crate::stats::{CacheStats, StatCounters};
use crate::thread_info::ThreadInfo;
use crate::tile::{PixelData, Tile, TileId, TileStore};

// =============================================================================
// Image Cache
// =============================================================================

/// Memory-bounded, format-agnostic tile cache over an [`ImageOpener`].
///
/// All pixel-path methods take a `&mut ThreadInfo`; create one per worker
/// thread with [`create_thread_info`](Self::create_thread_info). The cache
/// itself is `Send + Sync` and is normally shared behind an `Arc`.
pub struct ImageCache {
    registry: FileRegistry,
    store: TileStore,
    stats: Arc<StatCounters>,
    fill_value: f32,
    strict_region: bool,
    /// Rendered message of the most recent failure, for `last_error`.
    last_error: Mutex<Option<String>>,
}

impl ImageCache {
    pub fn new(config: CacheConfig, opener: Arc<dyn ImageOpener>) -> Self {
        let stats = Arc::new(StatCounters::default());
        debug!(
            max_memory_bytes = config.max_memory_bytes,
            max_open_files = config.max_open_files,
            autotile = config.autotile,
            "image cache created"
        );
        Self {
            registry: FileRegistry::new(opener, &config, stats.clone()),
            store: TileStore::new(&config, stats.clone()),
            fill_value: config.fill_value,
            strict_region: config.strict_region,
            stats,
            last_error: Mutex::new(None),
        }
    }

    // =========================================================================
    // Thread Info
    // =========================================================================

    /// Create a per-thread access context. One per worker thread; sharing
    /// one across threads defeats its purpose (it is `!Sync` by design).
    pub fn create_thread_info(&self) -> ThreadInfo {
        ThreadInfo::new()
    }

    /// Retire a thread context, folding its batched statistics into the
    /// cache-wide counters and releasing its pinned tiles.
    pub fn destroy_thread_info(&self, mut info: ThreadInfo) {
        info.fold(&self.stats);
        info.clear();
    }

    // =========================================================================
    // Handles & Geometry
    // =========================================================================

    /// Resolve a name to a reusable handle. Cheap on repeats: the thread's
    /// cached handle answers without touching the name map.
    pub fn get_image_handle(&self, info: &mut ThreadInfo, name: &str) -> ImageHandle {
        if let Some(handle) = info.find_handle(name) {
            return handle;
        }
        let handle = self.registry.get_handle(name);
        info.remember_handle(handle.clone());
        handle
    }

    /// Geometry of one (subimage, miplevel), opening the file on first use.
    pub fn get_geometry(
        &self,
        _info: &mut ThreadInfo,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
    ) -> Result<Arc<ImageSpec>, CacheError> {
        self.registry
            .geometry(handle.record(), subimage, miplevel)
            .map_err(|err| self.record_error(err))
    }

    // =========================================================================
    // Tile Access
    // =========================================================================

    /// Fetch one cache tile, pinned. `(x, y, z)` must be a tile origin on
    /// the level's tile grid; the returned tile covers the full tile
    /// footprint in the requested channel range and the file's native
    /// sample type (edge tiles are zero-padded past the data window).
    #[allow(clippy::too_many_arguments)]
    pub fn get_tile(
        &self,
        info: &mut ThreadInfo,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
    ) -> Result<Tile, CacheError> {
        self.get_tile_inner(info, handle, subimage, miplevel, x, y, z, channels)
            .map_err(|err| self.record_error(err))
    }

    /// Release a pinned tile, making it eligible for eviction again.
    /// Equivalent to dropping the handle.
    pub fn release_tile(&self, tile: Tile) {
        drop(tile);
    }

    /// Direct access to a tile's decoded pixels and their sample type.
    pub fn tile_pixels<'a>(&self, tile: &'a Tile) -> (&'a [u8], SampleType) {
        (tile.pixels(), tile.format())
    }

    #[allow(clippy::too_many_arguments)]
    fn get_tile_inner(
        &self,
        info: &mut ThreadInfo,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
    ) -> Result<Tile, CacheError> {
        info.stats.tile_queries += 1;
        info.maybe_fold(&self.stats);

        let spec = self.registry.geometry(handle.record(), subimage, miplevel)?;
        channels.validate(spec.nchannels)?;
        if !spec.is_tile_origin(x, y, z) {
            return Err(CacheError::TileOutOfRange {
                name: handle.name().to_string(),
                x,
                y,
                z,
            });
        }

        let id = TileId {
            file_id: handle.file_id(),
            subimage,
            miplevel,
            x,
            y,
            z,
            chbegin: channels.begin,
            chend: channels.end,
        };
        if let Some(tile) = info.find_tile(&id) {
            info.stats.tile_hits += 1;
            info.stats.microcache_hits += 1;
            return Ok(tile);
        }

        let mut decoded = 0u64;
        let (tile, resident) = self.store.get_or_insert(id, spec.format, || {
            let pixels =
                self.decode_tile(handle, &spec, subimage, miplevel, x, y, z, channels)?;
            decoded = pixels.len() as u64;
            Ok(pixels)
        })?;
        if resident {
            info.stats.tile_hits += 1;
        } else {
            info.stats.bytes_decoded += decoded;
        }
        info.remember_tile(tile.clone());
        Ok(tile)
    }

    /// Decode one full tile footprint. Edge tiles decode the in-window part
    /// and zero-pad the remainder, so every tile buffer has the same stride.
    #[allow(clippy::too_many_arguments)]
    fn decode_tile(
        &self,
        handle: &ImageHandle,
        spec: &ImageSpec,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
    ) -> Result<PixelData, CacheError> {
        let full = spec.tile_region(x, y, z);
        let clipped = full.intersect(&spec.data_window());
        let pixel_bytes = spec.pixel_bytes(channels.count());
        let mut buf = vec![0u8; spec.tile_bytes(channels.count())];

        if clipped == full {
            self.registry.decode_region(
                handle.record(),
                subimage,
                miplevel,
                full,
                channels,
                &mut buf,
            )?;
            return Ok(PixelData::Owned(Bytes::from(buf)));
        }

        if !clipped.is_empty() {
            let mut partial = vec![0u8; clipped.pixels() as usize * pixel_bytes];
            self.registry.decode_region(
                handle.record(),
                subimage,
                miplevel,
                clipped,
                channels,
                &mut partial,
            )?;
            let tw = full.width() as usize;
            let th = full.height() as usize;
            let row = clipped.width() as usize * pixel_bytes;
            let mut src = 0usize;
            for zz in clipped.zbegin..clipped.zend {
                let slab = (zz - full.zbegin) as usize * th * tw;
                for yy in clipped.ybegin..clipped.yend {
                    let dst = (slab
                        + (yy - full.ybegin) as usize * tw
                        + (clipped.xbegin - full.xbegin) as usize)
                        * pixel_bytes;
                    buf[dst..dst + row].copy_from_slice(&partial[src..src + row]);
                    src += row;
                }
            }
        }
        Ok(PixelData::Owned(Bytes::from(buf)))
    }

    // =========================================================================
    // Region Access
    // =========================================================================

    /// Copy an arbitrary region into `out`, converted to `format`.
    ///
    /// The region is decomposed into covering tiles; each is fetched through
    /// the tile path (hitting the cache where possible) and its overlap is
    /// converted into place. Portions outside the data window are filled
    /// with the configured fill value and reported as success, unless the
    /// cache was built with `strict_region`. `out` must be exactly
    /// `region.pixels() * channels.count() * format.size()` bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn get_pixels(
        &self,
        info: &mut ThreadInfo,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
        region: Region,
        channels: ChannelRange,
        format: SampleType,
        out: &mut [u8],
    ) -> Result<(), CacheError> {
        self.get_pixels_inner(info, handle, subimage, miplevel, region, channels, format, out)
            .map_err(|err| self.record_error(err))
    }

    #[allow(clippy::too_many_arguments)]
    fn get_pixels_inner(
        &self,
        info: &mut ThreadInfo,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
        region: Region,
        channels: ChannelRange,
        format: SampleType,
        out: &mut [u8],
    ) -> Result<(), CacheError> {
        if region.is_empty() {
            return Err(CacheError::InvalidParameter(format!(
                "empty region {region:?}"
            )));
        }
        let spec = self.registry.geometry(handle.record(), subimage, miplevel)?;
        channels.validate(spec.nchannels)?;

        let nch = channels.count() as usize;
        let dst_pixel = nch * format.size();
        let expected = region.pixels() as usize * dst_pixel;
        if out.len() != expected {
            return Err(CacheError::InvalidParameter(format!(
                "output buffer is {} bytes, region requires {}",
                out.len(),
                expected
            )));
        }

        let inside = region.intersect(&spec.data_window());
        if inside != region {
            if self.strict_region {
                return Err(CacheError::RegionOutOfRange {
                    name: handle.name().to_string(),
                    region,
                });
            }
            fill_samples(format, self.fill_value, out);
            if inside.is_empty() {
                return Ok(());
            }
        }

        let native = spec.format;
        let src_pixel = nch * native.size();
        let rw = region.width() as usize;
        let rh = region.height() as usize;
        let tw = spec.tile_width.max(1) as usize;
        let th = spec.tile_height.max(1) as usize;
        let step_x = tw as i32;
        let step_y = th as i32;
        let step_z = spec.tile_depth.max(1) as i32;

        let (x0, y0, z0) = spec.tile_align(inside.xbegin, inside.ybegin, inside.zbegin);
        let mut tz = z0;
        while tz < inside.zend {
            let mut ty = y0;
            while ty < inside.yend {
                let mut tx = x0;
                while tx < inside.xend {
                    let tile =
                        self.get_tile_inner(info, handle, subimage, miplevel, tx, ty, tz, channels)?;
                    let overlap = inside.intersect(&spec.tile_region(tx, ty, tz));
                    let src = tile.pixels();
                    let run = overlap.width() as usize;
                    for zz in overlap.zbegin..overlap.zend {
                        let src_slab = (zz - tz) as usize * th * tw;
                        let dst_slab = (zz - region.zbegin) as usize * rh * rw;
                        for yy in overlap.ybegin..overlap.yend {
                            let src_off = (src_slab
                                + (yy - ty) as usize * tw
                                + (overlap.xbegin - tx) as usize)
                                * src_pixel;
                            let dst_off = (dst_slab
                                + (yy - region.ybegin) as usize * rw
                                + (overlap.xbegin - region.xbegin) as usize)
                                * dst_pixel;
                            convert_samples(
                                native,
                                &src[src_off..src_off + run * src_pixel],
                                format,
                                &mut out[dst_off..dst_off + run * dst_pixel],
                            )?;
                        }
                    }
                    tx += step_x;
                }
                ty += step_y;
            }
            tz += step_z;
        }
        Ok(())
    }

    // =========================================================================
    // Application-Supplied Data
    // =========================================================================

    /// Register a resource backed by an application-supplied reader, making
    /// in-memory pixel data addressable like any file. Replaces (and
    /// purges the tiles of) any previous resource of the same name.
    pub fn add_file(&self, name: &str, reader: Box<dyn ImageReader>) -> Result<(), CacheError> {
        let (_, replaced) = self
            .registry
            .add_synthetic(name, reader)
            .map_err(|err| self.record_error(err))?;
        if let Some(old_id) = replaced {
            self.store.invalidate_file(old_id);
        }
        Ok(())
    }

    /// Insert one tile's pixels directly, copying `data` into the cache.
    ///
    /// `data` holds the full tile footprint for the channel range, in
    /// `format` (converted to the file's native type if they differ), and
    /// replaces any resident tile under the same key.
    #[allow(clippy::too_many_arguments)]
    pub fn add_tile(
        &self,
        info: &mut ThreadInfo,
        name: &str,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
        format: SampleType,
        data: &[u8],
    ) -> Result<(), CacheError> {
        let handle = self.get_image_handle(info, name);
        let (id, spec) = self
            .tile_target(&handle, subimage, miplevel, x, y, z, channels)
            .map_err(|err| self.record_error(err))?;

        let tile_pixels = spec.tile_bytes(channels.count()) / spec.pixel_bytes(channels.count());
        let expected = tile_pixels * channels.count() as usize * format.size();
        if data.len() != expected {
            return Err(self.record_error(CacheError::InvalidParameter(format!(
                "tile data is {} bytes, footprint requires {}",
                data.len(),
                expected
            ))));
        }
        let pixels = if format == spec.format {
            Bytes::copy_from_slice(data)
        } else {
            let mut buf = vec![0u8; tile_pixels * channels.count() as usize * spec.format.size()];
            convert_samples(format, data, spec.format, &mut buf)
                .map_err(|err| self.record_error(err))?;
            Bytes::from(buf)
        };
        self.store.add(id, PixelData::Owned(pixels), spec.format);
        Ok(())
    }

    /// Insert one tile aliasing `data` in place, with no copy.
    ///
    /// The tile indexes the caller's memory directly: later mutation of the
    /// buffer is visible through `tile_pixels`, and eviction only drops the
    /// index entry. `data` must be in the file's native sample type.
    ///
    /// # Safety
    ///
    /// The caller must keep `data`'s allocation alive, unmoved, and
    /// unresized until the tile is removed (by `invalidate` of the resource
    /// or `invalidate_all`) or the cache is dropped.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn add_tile_shared(
        &self,
        info: &mut ThreadInfo,
        name: &str,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
        data: &[u8],
    ) -> Result<(), CacheError> {
        let handle = self.get_image_handle(info, name);
        let (id, spec) = self
            .tile_target(&handle, subimage, miplevel, x, y, z, channels)
            .map_err(|err| self.record_error(err))?;

        let expected = spec.tile_bytes(channels.count());
        if data.len() != expected {
            return Err(self.record_error(CacheError::InvalidParameter(format!(
                "tile data is {} bytes, footprint requires {}",
                data.len(),
                expected
            ))));
        }
        let pixels = PixelData::aliased(data.as_ptr(), data.len());
        self.store.add(id, pixels, spec.format);
        Ok(())
    }

    /// Validate a tile origin and build its key.
    fn tile_target(
        &self,
        handle: &ImageHandle,
        subimage: u32,
        miplevel: u32,
        x: i32,
        y: i32,
        z: i32,
        channels: ChannelRange,
    ) -> Result<(TileId, Arc<ImageSpec>), CacheError> {
        let spec = self.registry.geometry(handle.record(), subimage, miplevel)?;
        channels.validate(spec.nchannels)?;
        if !spec.is_tile_origin(x, y, z) {
            return Err(CacheError::TileOutOfRange {
                name: handle.name().to_string(),
                x,
                y,
                z,
            });
        }
        let id = TileId {
            file_id: handle.file_id(),
            subimage,
            miplevel,
            x,
            y,
            z,
            chbegin: channels.begin,
            chend: channels.end,
        };
        Ok((id, spec))
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Forget everything cached about `name`: its tiles, geometry, decoder,
    /// and any broken state. The next access rediscovers the resource from
    /// scratch.
    pub fn invalidate(&self, name: &str) {
        if let Some(old_id) = self.registry.invalidate(name) {
            self.store.invalidate_file(old_id);
        }
    }

    /// Invalidate every known resource and drop every tile.
    pub fn invalidate_all(&self) {
        self.registry.invalidate_all();
        self.store.clear();
    }

    // =========================================================================
    // Limits, Errors & Statistics
    // =========================================================================

    /// Retarget the tile memory budget, evicting immediately if the new
    /// value is below current residency.
    pub fn set_max_memory_bytes(&self, bytes: usize) {
        self.store.set_max_memory(bytes);
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.store.max_memory()
    }

    pub fn set_max_open_files(&self, count: usize) {
        self.registry.set_max_open_files(count);
    }

    pub fn max_open_files(&self) -> usize {
        self.registry.max_open_files()
    }

    /// Set the tile size synthesized for scanline-only sources. Affects
    /// files opened after the call.
    pub fn set_autotile(&self, tile_size: u32) {
        self.registry.set_autotile(tile_size);
    }

    pub fn autotile(&self) -> u32 {
        self.registry.autotile()
    }

    /// Rendered message of the most recent failure reported by any thread
    /// through this cache, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_error(&self, err: CacheError) -> CacheError {
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    /// Point-in-time snapshot of activity counters and residency.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.snapshot();
        stats.open_files = self.registry.open_file_count();
        stats.known_files = self.registry.known_file_count();
        stats.resident_bytes = self.store.resident_bytes();
        stats.resident_tiles = self.store.resident_tiles();
        stats
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("max_memory_bytes", &self.max_memory_bytes())
            .field("max_open_files", &self.max_open_files())
            .field("resident_bytes", &self.store.resident_bytes())
            .finish()
    }
}

// =============================================================================
// Shared Instance
// =============================================================================

static SHARED: OnceLock<RwLock<Option<Arc<ImageCache>>>> = OnceLock::new();

fn shared_slot() -> &'static RwLock<Option<Arc<ImageCache>>> {
    SHARED.get_or_init(|| RwLock::new(None))
}

/// The process-wide default cache, created on first use with default
/// configuration over a [`MemoryOpener`]. Libraries that want to share one
/// cache without threading a reference through every layer can use this;
/// anything needing real format plugins should construct its own
/// [`ImageCache`].
pub fn shared_cache() -> Arc<ImageCache> {
    if let Some(cache) = shared_slot().read().as_ref() {
        return cache.clone();
    }
    let mut slot = shared_slot().write();
    slot.get_or_insert_with(|| {
        Arc::new(ImageCache::new(
            CacheConfig::default(),
            Arc::new(MemoryOpener::new()),
        ))
    })
    .clone()
}

/// Drop the shared instance. The next [`shared_cache`] call builds a fresh
/// one; existing `Arc`s keep the old instance alive until released.
pub fn reset_shared_cache() {
    *shared_slot().write() = None;
}

// =============================================================================
// Tests
// =============================================================================
