//! In-memory images and the opener that serves them.
//!
//! [`MemoryImage`] holds fully decoded rasters for each (subimage, miplevel)
//! of a synthetic resource; [`MemoryReader`] implements the capability
//! contract over one; [`MemoryOpener`] is a name-to-image table that lets
//! application-owned pixel data appear in the cache without a detour through
//! a file format. The tile store's eviction and aliasing logic then has one
//! uniform code path regardless of data origin.
//!
//! The image keeps atomic call counters (`open_count`, `decode_count`) so
//! tests can assert that the cache decoded a region exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::CacheError;
use crate::geometry::{ChannelRange, ImageSpec, Region};
use crate::plugin::{ImageOpener, ImageReader, OpenConfig};

// =============================================================================
// Memory Image
// =============================================================================

struct Level {
    spec: ImageSpec,
    /// Full raster for the data window, x-fastest, all channels, native
    /// sample type.
    pixels: Bytes,
}

/// Pixel data for one synthetic resource: one or more subimages, each with
/// one or more miplevels.
pub struct MemoryImage {
    subimages: Vec<Vec<Level>>,
    decode_count: AtomicU64,
}

impl MemoryImage {
    /// Create a single-subimage, single-level image.
    ///
    /// `pixels` must be exactly the data window raster:
    /// `width * height * depth * nchannels * format.size()` bytes.
    pub fn new(spec: ImageSpec, pixels: impl Into<Bytes>) -> Result<Self, CacheError> {
        let mut image = Self {
            subimages: vec![Vec::new()],
            decode_count: AtomicU64::new(0),
        };
        image.push_miplevel(0, spec, pixels)?;
        Ok(image)
    }

    /// Append a miplevel to an existing subimage.
    pub fn push_miplevel(
        &mut self,
        subimage: u32,
        spec: ImageSpec,
        pixels: impl Into<Bytes>,
    ) -> Result<(), CacheError> {
        let pixels = pixels.into();
        let expected = spec.width as usize
            * spec.height as usize
            * spec.depth.max(1) as usize
            * spec.pixel_bytes(spec.nchannels);
        if pixels.len() != expected {
            return Err(CacheError::InvalidParameter(format!(
                "raster is {} bytes, spec requires {}",
                pixels.len(),
                expected
            )));
        }
        let levels = self
            .subimages
            .get_mut(subimage as usize)
            .ok_or_else(|| CacheError::InvalidParameter(format!("no subimage {subimage}")))?;
        levels.push(Level { spec, pixels });
        Ok(())
    }

    /// Start a new subimage, returning its index.
    pub fn push_subimage(&mut self) -> u32 {
        self.subimages.push(Vec::new());
        (self.subimages.len() - 1) as u32
    }

    /// Number of decode_region calls served so far, over all readers of this
    /// image.
    pub fn decode_count(&self) -> u64 {
        self.decode_count.load(Ordering::SeqCst)
    }

    fn level(&self, subimage: u32, miplevel: u32) -> Option<&Level> {
        self.subimages
            .get(subimage as usize)
            .and_then(|levels| levels.get(miplevel as usize))
    }
}

// =============================================================================
// Memory Reader
// =============================================================================

/// Capability handle over a [`MemoryImage`].
pub struct MemoryReader {
    image: Arc<MemoryImage>,
}

impl MemoryReader {
    pub fn new(image: Arc<MemoryImage>) -> Self {
        Self { image }
    }
}

impl ImageReader for MemoryReader {
    fn subimage_count(&self) -> u32 {
        self.image.subimages.len() as u32
    }

    fn miplevel_count(&self, subimage: u32) -> u32 {
        self.image
            .subimages
            .get(subimage as usize)
            .map(|levels| levels.len() as u32)
            .unwrap_or(0)
    }

    fn geometry(&mut self, subimage: u32, miplevel: u32) -> Result<ImageSpec, CacheError> {
        self.image
            .level(subimage, miplevel)
            .map(|l| l.spec.clone())
            .ok_or_else(|| CacheError::InvalidParameter(format!(
                "no miplevel {miplevel} in subimage {subimage}"
            )))
    }

    fn decode_region(
        &mut self,
        subimage: u32,
        miplevel: u32,
        region: Region,
        channels: ChannelRange,
        out: &mut [u8],
    ) -> Result<(), CacheError> {
        let level = self.image.level(subimage, miplevel).ok_or_else(|| {
            CacheError::InvalidParameter(format!(
                "no miplevel {miplevel} in subimage {subimage}"
            ))
        })?;
        let spec = &level.spec;
        let window = spec.data_window();
        if region.is_empty() || region.intersect(&window) != region {
            return Err(CacheError::InvalidParameter(format!(
                "region {region:?} not within data window {window:?}"
            )));
        }
        channels.validate(spec.nchannels)?;

        let sample = spec.format.size();
        let src_pixel = spec.pixel_bytes(spec.nchannels);
        let dst_pixel = spec.pixel_bytes(channels.count());
        let expected = region.pixels() as usize * dst_pixel;
        if out.len() != expected {
            return Err(CacheError::InvalidParameter(format!(
                "output buffer is {} bytes, region requires {}",
                out.len(),
                expected
            )));
        }

        let src_row = spec.width as usize * src_pixel;
        let src_slab = spec.height as usize * src_row;
        let chan_offset = channels.begin as usize * sample;
        let run = dst_pixel; // bytes copied per pixel

        let mut dst_off = 0usize;
        for z in region.zbegin..region.zend {
            let slab = (z - spec.z) as usize * src_slab;
            for y in region.ybegin..region.yend {
                let row = slab + (y - spec.y) as usize * src_row;
                for x in region.xbegin..region.xend {
                    let src_off = row + (x - spec.x) as usize * src_pixel + chan_offset;
                    out[dst_off..dst_off + run]
                        .copy_from_slice(&level.pixels[src_off..src_off + run]);
                    dst_off += run;
                }
            }
        }

        self.image.decode_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Memory Opener
// =============================================================================

/// Name-to-image table serving [`MemoryReader`]s.
///
/// Unknown names report [`CacheError::NotFound`]; the registry caches that
/// failure as a broken record so later lookups fail fast.
#[derive(Default)]
pub struct MemoryOpener {
    images: RwLock<HashMap<String, Arc<MemoryImage>>>,
    open_count: AtomicU64,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an image under `name`.
    pub fn register(&self, name: impl Into<String>, image: Arc<MemoryImage>) {
        self.images.write().insert(name.into(), image);
    }

    pub fn unregister(&self, name: &str) {
        self.images.write().remove(name);
    }

    /// Number of successful opens, for tests asserting open-once behavior.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl ImageOpener for MemoryOpener {
    fn open(&self, name: &str, _config: &OpenConfig) -> Result<Box<dyn ImageReader>, CacheError> {
        let image = self
            .images
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader::new(image)))
    }
}

// =============================================================================
// Tests
// =============================================================================
