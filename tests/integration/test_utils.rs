//! Shared helpers for the integration tests.
//!
//! Everything runs against in-memory images served by a counting
//! [`MemoryOpener`], so tests can assert exactly how many opens and decodes
//! the cache performed.

use std::sync::{Arc, Once};

use pixcache::plugin::{MemoryImage, MemoryOpener};
use pixcache::{CacheConfig, ImageCache, ImageSpec, SampleType};

static INIT_TRACING: Once = Once::new();

/// Install a test subscriber once per process. Honors `RUST_LOG`; silent by
/// default so assertion failures stay readable.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Gradient raster where sample (x, y, c) is `(x + y + c) mod 256`.
pub fn gradient_image(
    width: u32,
    height: u32,
    nchannels: u32,
    tile_size: u32,
) -> Arc<MemoryImage> {
    let mut spec = ImageSpec::new_2d(width, height, nchannels, SampleType::U8);
    if tile_size > 0 {
        spec = spec.with_tiles(tile_size, tile_size);
    }
    let mut pixels = Vec::with_capacity((width * height * nchannels) as usize);
    for y in 0..height {
        for x in 0..width {
            for c in 0..nchannels {
                pixels.push((x + y + c) as u8);
            }
        }
    }
    Arc::new(MemoryImage::new(spec, pixels).unwrap())
}

/// The value `gradient_image` stores at (x, y, c).
pub fn expected_sample(x: i32, y: i32, c: u32) -> u8 {
    (x + y + c as i32) as u8
}

/// A cache plus the opener behind it, so tests can register images and
/// inspect open counts.
pub struct TestCache {
    pub cache: Arc<ImageCache>,
    pub opener: Arc<MemoryOpener>,
}

pub fn build_cache(config: CacheConfig) -> TestCache {
    init_tracing();
    let opener = Arc::new(MemoryOpener::new());
    let cache = Arc::new(ImageCache::new(config, opener.clone()));
    TestCache { cache, opener }
}
