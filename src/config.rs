//! Cache configuration.
//!
//! [`CacheConfig`] collects the construction-time settings of an
//! [`ImageCache`](crate::ImageCache). The resource limits (memory budget,
//! open-file cap, autotile size) can also be changed on a live cache via its
//! `set_*` methods; changes affect only future decisions, never data already
//! resident.

// =============================================================================
// Default Values
// =============================================================================

/// Default tile memory budget: 256MB.
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 256 * 1024 * 1024;

/// Default cap on simultaneously open decoder handles.
pub const DEFAULT_MAX_OPEN_FILES: usize = 100;

/// Default synthetic tile size for scanline-organized sources.
pub const DEFAULT_AUTOTILE: u32 = 64;

/// Default fill value for pixels requested outside the data window.
pub const DEFAULT_FILL_VALUE: f32 = 0.0;

/// Default shard count for the concurrent maps.
pub const DEFAULT_MAP_BINS: usize = 32;

// =============================================================================
// Cache Configuration
// =============================================================================

/// Construction-time settings for an [`ImageCache`](crate::ImageCache).
///
/// # Example
///
/// ```
/// use pixcache::CacheConfig;
///
/// let config = CacheConfig::new()
///     .with_max_memory_bytes(64 * 1024 * 1024)
///     .with_max_open_files(20)
///     .with_autotile(128);
/// assert_eq!(config.autotile, 128);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Target for total resident decoded-tile bytes. A target, not an
    /// absolute ceiling: tiles in active use are never evicted, so the
    /// total may transiently exceed it.
    pub max_memory_bytes: usize,

    /// Cap on simultaneously open decoder handles. Exceeding it closes the
    /// least-recently-used idle handle; its metadata stays cached.
    pub max_open_files: usize,

    /// Tile size synthesized for scanline-only sources.
    pub autotile: u32,

    /// Value used to fill out-of-data-window pixels in `get_pixels`.
    pub fill_value: f32,

    /// Report `RegionOutOfRange` for fully-out-of-window regions instead of
    /// filling them.
    pub strict_region: bool,

    /// Shard count for the concurrent maps (rounded up to a power of two).
    pub map_bins: usize,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count.max(1);
        self
    }

    pub fn with_autotile(mut self, tile_size: u32) -> Self {
        self.autotile = tile_size.max(1);
        self
    }

    pub fn with_fill_value(mut self, value: f32) -> Self {
        self.fill_value = value;
        self
    }

    pub fn with_strict_region(mut self, strict: bool) -> Self {
        self.strict_region = strict;
        self
    }

    pub fn with_map_bins(mut self, bins: usize) -> Self {
        self.map_bins = bins.max(1);
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            autotile: DEFAULT_AUTOTILE,
            fill_value: DEFAULT_FILL_VALUE,
            strict_region: false,
            map_bins: DEFAULT_MAP_BINS,
        }
    }
}
