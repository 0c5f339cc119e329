//! Geometry types shared by the whole cache.
//!
//! An [`ImageSpec`] describes one (subimage, miplevel) of a resource: its
//! data window, display window, tiling parameters, channel count and sample
//! type. [`Region`] is a half-open 3-D box in image coordinates, and
//! [`ChannelRange`] a half-open channel interval. Sample-type conversion
//! between `u8`, `u16` and `f32` buffers lives here as well, since both the
//! tile store and `get_pixels` need it.

use crate::error::CacheError;

// =============================================================================
// Sample Type
// =============================================================================

/// Element type of a pixel sample as stored in a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    /// 8-bit unsigned, normalized to [0, 1].
    U8,
    /// 16-bit unsigned, normalized to [0, 1].
    U16,
    /// 32-bit IEEE float.
    F32,
}

impl SampleType {
    /// Size of one sample in bytes.
    pub fn size(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 => 2,
            SampleType::F32 => 4,
        }
    }

    /// Human-readable name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            SampleType::U8 => "u8",
            SampleType::U16 => "u16",
            SampleType::F32 => "f32",
        }
    }
}

// =============================================================================
// Channel Range
// =============================================================================

/// Half-open range of channels `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRange {
    pub begin: u32,
    pub end: u32,
}

impl ChannelRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    /// The full-channel range for an image with `nchannels` channels.
    pub fn all(nchannels: u32) -> Self {
        Self {
            begin: 0,
            end: nchannels,
        }
    }

    pub fn count(&self) -> u32 {
        self.end.saturating_sub(self.begin)
    }

    /// Validate against an image's channel count.
    pub fn validate(&self, nchannels: u32) -> Result<(), CacheError> {
        if self.begin >= self.end || self.end > nchannels {
            return Err(CacheError::InvalidParameter(format!(
                "channel range [{}, {}) invalid for {} channels",
                self.begin, self.end, nchannels
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Region
// =============================================================================

/// Half-open 3-D box `[xbegin, xend) x [ybegin, yend) x [zbegin, zend)` in
/// image coordinates. 2-D images use a unit z extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub xbegin: i32,
    pub xend: i32,
    pub ybegin: i32,
    pub yend: i32,
    pub zbegin: i32,
    pub zend: i32,
}

impl Region {
    /// A 2-D region with unit depth.
    pub fn new_2d(xbegin: i32, xend: i32, ybegin: i32, yend: i32) -> Self {
        Self {
            xbegin,
            xend,
            ybegin,
            yend,
            zbegin: 0,
            zend: 1,
        }
    }

    pub fn new_3d(
        xbegin: i32,
        xend: i32,
        ybegin: i32,
        yend: i32,
        zbegin: i32,
        zend: i32,
    ) -> Self {
        Self {
            xbegin,
            xend,
            ybegin,
            yend,
            zbegin,
            zend,
        }
    }

    pub fn width(&self) -> u32 {
        (self.xend - self.xbegin).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.yend - self.ybegin).max(0) as u32
    }

    pub fn depth(&self) -> u32 {
        (self.zend - self.zbegin).max(0) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.xbegin >= self.xend || self.ybegin >= self.yend || self.zbegin >= self.zend
    }

    /// Number of pixels covered; zero for empty regions.
    pub fn pixels(&self) -> u64 {
        self.width() as u64 * self.height() as u64 * self.depth() as u64
    }

    /// Intersection with `other`; may be empty.
    pub fn intersect(&self, other: &Region) -> Region {
        Region {
            xbegin: self.xbegin.max(other.xbegin),
            xend: self.xend.min(other.xend),
            ybegin: self.ybegin.max(other.ybegin),
            yend: self.yend.min(other.yend),
            zbegin: self.zbegin.max(other.zbegin),
            zend: self.zend.min(other.zend),
        }
    }

    pub fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        x >= self.xbegin
            && x < self.xend
            && y >= self.ybegin
            && y < self.yend
            && z >= self.zbegin
            && z < self.zend
    }
}

// =============================================================================
// Image Spec
// =============================================================================

/// Geometry of one (subimage, miplevel) of a resource.
///
/// The data window is the pixel region that actually exists
/// (`(x, y, z) .. (x + width, y + height, z + depth)`); the display window
/// (`full_*`) is the nominal image extent, which may differ for cropped or
/// overscanned images. `tile_width == 0` declares a scanline-only source;
/// the file registry replaces it with the cache's autotile size before the
/// spec ever reaches the tile store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    /// Data window origin.
    pub x: i32,
    pub y: i32,
    pub z: i32,

    /// Data window extent.
    pub width: u32,
    pub height: u32,
    pub depth: u32,

    /// Display window origin and extent.
    pub full_x: i32,
    pub full_y: i32,
    pub full_z: i32,
    pub full_width: u32,
    pub full_height: u32,
    pub full_depth: u32,

    /// Native tile dimensions; zero width means scanline-organized.
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_depth: u32,

    pub nchannels: u32,
    pub format: SampleType,
}

impl ImageSpec {
    /// A 2-D spec with the data and display windows coincident at the origin.
    pub fn new_2d(width: u32, height: u32, nchannels: u32, format: SampleType) -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            width,
            height,
            depth: 1,
            full_x: 0,
            full_y: 0,
            full_z: 0,
            full_width: width,
            full_height: height,
            full_depth: 1,
            tile_width: 0,
            tile_height: 0,
            tile_depth: 1,
            nchannels,
            format,
        }
    }

    /// Set native tile dimensions (builder style).
    pub fn with_tiles(mut self, tile_width: u32, tile_height: u32) -> Self {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self.tile_depth = 1;
        self
    }

    pub fn is_tiled(&self) -> bool {
        self.tile_width > 0 && self.tile_height > 0
    }

    /// The data window as a region.
    pub fn data_window(&self) -> Region {
        Region {
            xbegin: self.x,
            xend: self.x + self.width as i32,
            ybegin: self.y,
            yend: self.y + self.height as i32,
            zbegin: self.z,
            zend: self.z + self.depth as i32,
        }
    }

    /// Bytes per pixel for `nchannels` channels of this spec's sample type.
    pub fn pixel_bytes(&self, nchannels: u32) -> usize {
        nchannels as usize * self.format.size()
    }

    /// Bytes in one full tile for the given channel count.
    ///
    /// Requires a tiled spec (the registry guarantees this for cached specs).
    pub fn tile_bytes(&self, nchannels: u32) -> usize {
        self.tile_width as usize
            * self.tile_height as usize
            * self.tile_depth.max(1) as usize
            * self.pixel_bytes(nchannels)
    }

    /// Floor the given coordinates to the tile grid anchored at the data
    /// window origin.
    pub fn tile_align(&self, x: i32, y: i32, z: i32) -> (i32, i32, i32) {
        let tw = self.tile_width.max(1) as i32;
        let th = self.tile_height.max(1) as i32;
        let td = self.tile_depth.max(1) as i32;
        (
            (x - self.x).div_euclid(tw) * tw + self.x,
            (y - self.y).div_euclid(th) * th + self.y,
            (z - self.z).div_euclid(td) * td + self.z,
        )
    }

    /// Is `(x, y, z)` a valid tile origin within the data window?
    pub fn is_tile_origin(&self, x: i32, y: i32, z: i32) -> bool {
        self.tile_align(x, y, z) == (x, y, z) && self.data_window().contains(x, y, z)
    }

    /// The full (unclipped) region of the tile whose origin is `(x, y, z)`.
    /// Edge tiles may extend past the data window.
    pub fn tile_region(&self, x: i32, y: i32, z: i32) -> Region {
        Region {
            xbegin: x,
            xend: x + self.tile_width.max(1) as i32,
            ybegin: y,
            yend: y + self.tile_height.max(1) as i32,
            zbegin: z,
            zend: z + self.tile_depth.max(1) as i32,
        }
    }
}

// =============================================================================
// Sample Conversion
// =============================================================================

fn sample_to_f32(ty: SampleType, bytes: &[u8]) -> f32 {
    match ty {
        SampleType::U8 => bytes[0] as f32 / u8::MAX as f32,
        SampleType::U16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as f32 / u16::MAX as f32,
        SampleType::F32 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn f32_to_sample(value: f32, ty: SampleType, out: &mut [u8]) {
    match ty {
        SampleType::U8 => {
            out[0] = (value.clamp(0.0, 1.0) * u8::MAX as f32 + 0.5) as u8;
        }
        SampleType::U16 => {
            let v = (value.clamp(0.0, 1.0) * u16::MAX as f32 + 0.5) as u16;
            out[..2].copy_from_slice(&v.to_ne_bytes());
        }
        SampleType::F32 => {
            out[..4].copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// Convert a run of samples from one type to another.
///
/// The sample counts implied by the two buffers must match. Same-type
/// conversion is a plain copy; cross-type conversion goes through a
/// normalized float.
pub fn convert_samples(
    src_ty: SampleType,
    src: &[u8],
    dst_ty: SampleType,
    dst: &mut [u8],
) -> Result<(), CacheError> {
    if src.len() % src_ty.size() != 0 || dst.len() % dst_ty.size() != 0 {
        return Err(CacheError::InvalidParameter(
            "conversion buffer is not a whole number of samples".to_string(),
        ));
    }
    let n_src = src.len() / src_ty.size();
    let n_dst = dst.len() / dst_ty.size();
    if n_src != n_dst {
        return Err(CacheError::InvalidParameter(format!(
            "conversion sample count mismatch: {} {} vs {} {}",
            n_src,
            src_ty.name(),
            n_dst,
            dst_ty.name()
        )));
    }
    if src_ty == dst_ty {
        dst.copy_from_slice(src);
        return Ok(());
    }
    let ss = src_ty.size();
    let ds = dst_ty.size();
    for (s, d) in src.chunks_exact(ss).zip(dst.chunks_exact_mut(ds)) {
        f32_to_sample(sample_to_f32(src_ty, s), dst_ty, d);
    }
    Ok(())
}

/// Fill a buffer with a constant value expressed in the given sample type.
pub fn fill_samples(ty: SampleType, value: f32, dst: &mut [u8]) {
    let mut one = [0u8; 4];
    f32_to_sample(value, ty, &mut one);
    let size = ty.size();
    for d in dst.chunks_exact_mut(size) {
        d.copy_from_slice(&one[..size]);
    }
}
