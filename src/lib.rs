//! pixcache: a format-agnostic, memory-bounded image tile cache.
//!
//! The cache gives many threads random access to pixel data spread across
//! arbitrarily many, arbitrarily large images while holding only a bounded
//! working set in memory. Files are opened lazily through an application
//! supplied [`plugin::ImageOpener`], decoded one tile at a time, and the
//! least recently used tiles are dropped whenever the byte budget is
//! exceeded. Concurrent requests for the same tile decode it exactly once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pixcache::plugin::{MemoryImage, MemoryOpener};
//! use pixcache::{CacheConfig, ChannelRange, ImageCache, ImageSpec, Region, SampleType};
//!
//! let opener = Arc::new(MemoryOpener::new());
//! let spec = ImageSpec::new_2d(128, 128, 1, SampleType::U8).with_tiles(64, 64);
//! let image = Arc::new(MemoryImage::new(spec, vec![0u8; 128 * 128]).unwrap());
//! opener.register("mem://flat", image);
//!
//! let cache = ImageCache::new(CacheConfig::default(), opener);
//! let mut info = cache.create_thread_info();
//! let handle = cache.get_image_handle(&mut info, "mem://flat");
//!
//! let region = Region::new_2d(0, 32, 0, 32);
//! let mut out = vec![0u8; region.pixels() as usize];
//! cache
//!     .get_pixels(&mut info, &handle, 0, 0, region, ChannelRange::all(1),
//!                 SampleType::U8, &mut out)
//!     .unwrap();
//! cache.destroy_thread_info(info);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod geometry;
pub mod map;
pub mod plugin;
pub mod stats;
pub mod thread_info;
pub mod tile;

pub use cache::{reset_shared_cache, shared_cache, ImageCache};
pub use config::CacheConfig;
pub use error::CacheError;
pub use file::ImageHandle;
pub use geometry::{ChannelRange, ImageSpec, Region, SampleType};
pub use stats::CacheStats;
pub use thread_info::ThreadInfo;
pub use tile::Tile;
