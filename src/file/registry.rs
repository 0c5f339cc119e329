//! Registry mapping resource names to file records.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::file::record::{FileRecord, FileState, ImageHandle, RecordInner};
use crate::geometry::{ChannelRange, ImageSpec, Region};
use crate::map::ShardedMap;
use crate::plugin::{ImageOpener, ImageReader, OpenConfig};
use crate::stats::StatCounters;

/// Registry for file records: name lookup, lazy idempotent opening, cached
/// geometry, and the open-file cap.
pub(crate) struct FileRegistry {
    files: ShardedMap<Arc<str>, Arc<FileRecord>>,
    opener: Arc<dyn ImageOpener>,
    open_config: OpenConfig,
    /// Decoder handles currently open (synthetic records excluded).
    open_files: AtomicUsize,
    max_open_files: AtomicUsize,
    autotile: AtomicU32,
    next_file_id: AtomicU64,
    /// Monotonic use clock for LRU decoder closing.
    clock: AtomicU64,
    stats: Arc<StatCounters>,
}

impl FileRegistry {
    pub fn new(opener: Arc<dyn ImageOpener>, config: &CacheConfig, stats: Arc<StatCounters>) -> Self {
        Self {
            files: ShardedMap::with_bins(config.map_bins),
            opener,
            open_config: OpenConfig::default(),
            open_files: AtomicUsize::new(0),
            max_open_files: AtomicUsize::new(config.max_open_files.max(1)),
            autotile: AtomicU32::new(config.autotile.max(1)),
            next_file_id: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            stats,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Look up or create the record for `name`. Brand-new records start
    /// unopened; nothing is probed until pixels or geometry are requested.
    pub fn get_handle(&self, name: &str) -> ImageHandle {
        if let Some(record) = self.files.get(name) {
            record.touch(self.tick());
            return ImageHandle::new(record);
        }
        let key: Arc<str> = Arc::from(name);
        let mut bin = self.files.lock_bin(name);
        let record = match bin.get(name) {
            Some(existing) => existing.clone(),
            None => {
                let record = Arc::new(FileRecord::new(key.clone(), self.next_id(), false));
                bin.insert(key, record.clone());
                record
            }
        };
        drop(bin);
        record.touch(self.tick());
        ImageHandle::new(record)
    }

    // =========================================================================
    // Opening
    // =========================================================================

    /// Attach the decoder if the record is unopened or was closed by the
    /// open-file cap. Idempotent: an already-open record returns
    /// immediately, a broken one returns its settled error without touching
    /// the opener again. The first writer wins; everyone else observes the
    /// settled state.
    pub fn ensure_open(&self, record: &Arc<FileRecord>) -> Result<(), CacheError> {
        let mut inner = record.inner.lock();
        self.open_locked(record, &mut inner)
    }

    fn open_locked(&self, record: &FileRecord, inner: &mut RecordInner) -> Result<(), CacheError> {
        match &inner.state {
            FileState::Broken(err) => return Err(err.clone()),
            FileState::Open if inner.reader.is_some() => return Ok(()),
            _ => {}
        }

        let first_open = matches!(inner.state, FileState::Unopened);
        let mut reader = match self.opener.open(record.name(), &self.open_config) {
            Ok(reader) => reader,
            Err(err) => {
                warn!(name = record.name(), error = %err, "open failed, marking resource broken");
                self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                inner.state = FileState::Broken(err.clone());
                return Err(err);
            }
        };

        if first_open {
            let subimages = reader.subimage_count().max(1);
            let miplevels: Vec<u32> = (0..subimages)
                .map(|s| reader.miplevel_count(s).max(1))
                .collect();
            // Geometry of (0, 0) is part of a successful open; deeper levels
            // are discovered lazily.
            let spec = match reader.geometry(0, 0) {
                Ok(spec) => spec,
                Err(err) => {
                    let err = CacheError::OpenFailed {
                        name: record.name().to_string(),
                        reason: err.to_string(),
                    };
                    warn!(name = record.name(), error = %err, "geometry probe failed, marking resource broken");
                    self.stats.open_failures.fetch_add(1, Ordering::Relaxed);
                    inner.state = FileState::Broken(err.clone());
                    return Err(err);
                }
            };
            let spec = Arc::new(self.apply_autotile(spec));
            {
                let mut specs = record.specs.write();
                *specs = miplevels
                    .iter()
                    .map(|&count| vec![None; count as usize])
                    .collect();
                specs[0][0] = Some(spec);
            }
            inner.subimages = subimages;
            inner.miplevels = miplevels;
        }

        inner.reader = Some(reader);
        inner.state = FileState::Open;
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        debug!(name = record.name(), reopen = !first_open, "attached decoder");

        if !record.is_synthetic() {
            record.open.store(true, Ordering::Release);
            let current = self.open_files.fetch_add(1, Ordering::AcqRel) + 1;
            self.stats.note_open_files(current);
            if current > self.max_open_files.load(Ordering::Relaxed) {
                self.close_excess(Some(record));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    /// Cached geometry for one (subimage, miplevel), fetched from the
    /// decoder on first request.
    pub fn geometry(
        &self,
        record: &Arc<FileRecord>,
        subimage: u32,
        miplevel: u32,
    ) -> Result<Arc<ImageSpec>, CacheError> {
        record.touch(self.tick());
        if let Some(spec) = record.cached_spec(subimage, miplevel) {
            return Ok(spec);
        }

        let mut inner = record.inner.lock();
        self.open_locked(record, &mut inner)?;
        if subimage >= inner.subimages {
            return Err(CacheError::SubimageOutOfRange {
                name: record.name().to_string(),
                subimage,
                count: inner.subimages,
            });
        }
        let level_count = inner.miplevels[subimage as usize];
        if miplevel >= level_count {
            return Err(CacheError::MiplevelOutOfRange {
                name: record.name().to_string(),
                subimage,
                miplevel,
                count: level_count,
            });
        }
        // Another thread may have cached it while we waited for the lock.
        if let Some(spec) = record.cached_spec(subimage, miplevel) {
            return Ok(spec);
        }

        let name = record.name().to_string();
        let reader = inner
            .reader
            .as_mut()
            .ok_or_else(|| CacheError::Unsupported("record has no decoder".to_string()))?;
        let spec = reader
            .geometry(subimage, miplevel)
            .map_err(|err| CacheError::DecodeFailed {
                name,
                reason: err.to_string(),
            })?;
        let spec = Arc::new(self.apply_autotile(spec));
        record.store_spec(subimage, miplevel, spec.clone());
        Ok(spec)
    }

    /// Synthesize tiling for scanline-only sources so the tile store has one
    /// uniform code path.
    fn apply_autotile(&self, mut spec: ImageSpec) -> ImageSpec {
        if !spec.is_tiled() {
            let autotile = self.autotile.load(Ordering::Relaxed).max(1);
            spec.tile_width = autotile.min(spec.width.max(1));
            spec.tile_height = autotile.min(spec.height.max(1));
            spec.tile_depth = 1;
        }
        spec
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode a region through the record's reader, serialized behind the
    /// record lock. A failure here reports `DecodeFailed` for this region
    /// only; it does not mark the resource broken.
    pub fn decode_region(
        &self,
        record: &Arc<FileRecord>,
        subimage: u32,
        miplevel: u32,
        region: Region,
        channels: ChannelRange,
        out: &mut [u8],
    ) -> Result<(), CacheError> {
        record.touch(self.tick());
        let mut inner = record.inner.lock();
        self.open_locked(record, &mut inner)?;
        let name = record.name().to_string();
        let reader = inner
            .reader
            .as_mut()
            .ok_or_else(|| CacheError::Unsupported("record has no decoder".to_string()))?;
        reader
            .decode_region(subimage, miplevel, region, channels, out)
            .map_err(|err| CacheError::DecodeFailed {
                name,
                reason: err.to_string(),
            })
    }

    // =========================================================================
    // Synthetic Resources
    // =========================================================================

    /// Register a resource backed by an application-supplied reader. The
    /// record is published already open; it is never closed by the
    /// open-file cap. A record already known under `name` is converted in
    /// place, so handles held by other threads stay valid; its old
    /// tile-key identity is returned so the caller can purge stale tiles.
    pub fn add_synthetic(
        &self,
        name: &str,
        mut reader: Box<dyn ImageReader>,
    ) -> Result<(ImageHandle, Option<u64>), CacheError> {
        let subimages = reader.subimage_count().max(1);
        let miplevels: Vec<u32> = (0..subimages)
            .map(|s| reader.miplevel_count(s).max(1))
            .collect();
        let spec = reader
            .geometry(0, 0)
            .map_err(|err| CacheError::OpenFailed {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        let spec = Arc::new(self.apply_autotile(spec));

        let (record, existed) = {
            let key: Arc<str> = Arc::from(name);
            let mut bin = self.files.lock_bin(name);
            match bin.get(name) {
                Some(existing) => (existing.clone(), true),
                None => {
                    let record = Arc::new(FileRecord::new(key.clone(), self.next_id(), true));
                    bin.insert(key, record.clone());
                    (record, false)
                }
            }
        };

        {
            let mut inner = record.inner.lock();
            // A real decoder held the record before: give its open-file
            // slot back.
            if inner.reader.is_some() && !record.is_synthetic() {
                record.open.store(false, Ordering::Release);
                self.open_files.fetch_sub(1, Ordering::AcqRel);
                self.stats.files_closed.fetch_add(1, Ordering::Relaxed);
            }
            inner.state = FileState::Open;
            inner.reader = Some(reader);
            inner.subimages = subimages;
            inner.miplevels = miplevels.clone();
        }
        {
            let mut specs = record.specs.write();
            *specs = miplevels
                .iter()
                .map(|&count| vec![None; count as usize])
                .collect();
            specs[0][0] = Some(spec);
        }
        record.set_synthetic(true);
        record.touch(self.tick());
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);

        let old_id = if existed {
            record.bump_generation();
            Some(record.swap_file_id(self.next_id()))
        } else {
            None
        };
        debug!(name, replaced = old_id.is_some(), "registered synthetic resource");
        Ok((ImageHandle::new(record), old_id))
    }

    // =========================================================================
    // Open-File Cap
    // =========================================================================

    /// Close least-recently-used idle decoders until the open count is back
    /// under the cap. Records whose lock is contended are skipped rather
    /// than waited on; the cap is a target, not a hard ceiling.
    fn close_excess(&self, keep: Option<&FileRecord>) {
        let max = self.max_open_files.load(Ordering::Relaxed).max(1);
        while self.open_files.load(Ordering::Acquire) > max {
            let mut victim: Option<(u64, Arc<FileRecord>)> = None;
            self.files.for_each(|_, record| {
                if !record.is_open() {
                    return;
                }
                if let Some(keep) = keep {
                    if std::ptr::eq(Arc::as_ptr(record), keep) {
                        return;
                    }
                }
                let last_use = record.last_use.load(Ordering::Relaxed);
                let better = match &victim {
                    Some((best, _)) => last_use < *best,
                    None => true,
                };
                if better {
                    victim = Some((last_use, record.clone()));
                }
            });
            let Some((_, record)) = victim else { break };
            if !self.close_record(&record) {
                break;
            }
        }
    }

    /// Close one record's decoder, keeping its cached geometry. Returns
    /// false if the record is busy, synthetic, or already closed.
    fn close_record(&self, record: &FileRecord) -> bool {
        if record.is_synthetic() {
            return false;
        }
        let Some(mut inner) = record.inner.try_lock() else {
            return false;
        };
        if inner.reader.take().is_none() {
            return false;
        }
        record.open.store(false, Ordering::Release);
        self.open_files.fetch_sub(1, Ordering::AcqRel);
        self.stats.files_closed.fetch_add(1, Ordering::Relaxed);
        debug!(name = record.name(), "closed decoder for open-file cap");
        true
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Reset the record for `name`: drop its decoder, cached geometry, and
    /// broken state, and retire its tile-key identity. Returns the old
    /// identity so the caller can purge tiles. Synthetic records are
    /// removed outright (there is no file to rediscover them from).
    pub fn invalidate(&self, name: &str) -> Option<u64> {
        let record = self.files.get(name)?;
        if record.is_synthetic() {
            self.files.erase(name);
            debug!(name, "removed synthetic resource");
            return Some(record.file_id());
        }
        let mut inner = record.inner.lock();
        if inner.reader.take().is_some() {
            record.open.store(false, Ordering::Release);
            self.open_files.fetch_sub(1, Ordering::AcqRel);
            self.stats.files_closed.fetch_add(1, Ordering::Relaxed);
        }
        inner.state = FileState::Unopened;
        inner.subimages = 0;
        inner.miplevels.clear();
        drop(inner);
        record.specs.write().clear();
        record.bump_generation();
        let old = record.swap_file_id(self.next_id());
        debug!(name, "invalidated resource");
        Some(old)
    }

    /// Invalidate every known record. Returns the retired tile-key
    /// identities.
    pub fn invalidate_all(&self) -> Vec<u64> {
        let mut names: Vec<Arc<str>> = Vec::new();
        self.files.for_each(|name, _| names.push(name.clone()));
        names
            .iter()
            .filter_map(|name| self.invalidate(name))
            .collect()
    }

    // =========================================================================
    // Limits & Introspection
    // =========================================================================

    pub fn set_max_open_files(&self, count: usize) {
        self.max_open_files.store(count.max(1), Ordering::Relaxed);
        self.close_excess(None);
    }

    pub fn max_open_files(&self) -> usize {
        self.max_open_files.load(Ordering::Relaxed)
    }

    pub fn set_autotile(&self, tile_size: u32) {
        self.autotile.store(tile_size.max(1), Ordering::Relaxed);
    }

    pub fn autotile(&self) -> u32 {
        self.autotile.load(Ordering::Relaxed)
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    pub fn known_file_count(&self) -> usize {
        self.files.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
