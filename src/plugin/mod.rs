//! Decoding capability contract.
//!
//! The cache core never knows about concrete image formats. Everything it
//! needs from a format is expressed by two traits: [`ImageOpener`] turns a
//! resource name into an open [`ImageReader`], and the reader reports
//! geometry and decodes rectangular sub-regions on demand. Plugin discovery
//! and registration are the surrounding application's business; a simple
//! name-to-image table ([`memory::MemoryOpener`]) ships with the crate for
//! in-memory and test data.
//!
//! Readers may be single-threaded. The file registry guarantees that all
//! calls into one reader instance are serialized behind its record's lock,
//! so implementations never need internal synchronization. The `close`
//! operation of the capability contract is simply `Drop`.

pub mod memory;

use crate::error::CacheError;
use crate::geometry::{ChannelRange, ImageSpec, Region};

pub use memory::{MemoryImage, MemoryOpener, MemoryReader};

/// Options passed through to [`ImageOpener::open`].
///
/// Hints are free-form key/value pairs a format may interpret (or ignore);
/// the cache core attaches none of its own.
#[derive(Debug, Clone, Default)]
pub struct OpenConfig {
    pub hints: Vec<(String, String)>,
}

impl OpenConfig {
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An open decoder handle for one resource.
pub trait ImageReader: Send {
    /// Number of independent images in the resource. At least 1 for any
    /// successfully opened resource.
    fn subimage_count(&self) -> u32;

    /// Number of resolution levels for `subimage`; zero if the subimage is
    /// out of range.
    fn miplevel_count(&self, subimage: u32) -> u32;

    /// Report the geometry of one (subimage, miplevel) without decoding
    /// pixels.
    fn geometry(&mut self, subimage: u32, miplevel: u32) -> Result<ImageSpec, CacheError>;

    /// Decode `region` of the given subimage/miplevel into `out`.
    ///
    /// `region` is guaranteed to lie within the data window. `out` is
    /// exactly `region.pixels() * channels.count() * format.size()` bytes,
    /// tightly packed x-fastest in the image's native sample type, holding
    /// only the requested channel range.
    fn decode_region(
        &mut self,
        subimage: u32,
        miplevel: u32,
        region: Region,
        channels: ChannelRange,
        out: &mut [u8],
    ) -> Result<(), CacheError>;
}

/// Opens named resources. The one interface the file registry depends on.
pub trait ImageOpener: Send + Sync {
    fn open(&self, name: &str, config: &OpenConfig) -> Result<Box<dyn ImageReader>, CacheError>;
}
