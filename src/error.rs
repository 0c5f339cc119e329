use thiserror::Error;

use crate::geometry::Region;

/// Errors reported by the cache and its collaborators.
///
/// No error here is fatal: every failure is returned to the immediate caller
/// and leaves the cache in a usable state. An [`OpenFailed`] marks the named
/// resource as broken so that repeated lookups fail cheaply; a
/// [`DecodeFailed`] affects only the one tile it was reported for.
///
/// [`OpenFailed`]: CacheError::OpenFailed
/// [`DecodeFailed`]: CacheError::DecodeFailed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Resource name is not known to the opener.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The decoder could not open the resource. The resource is marked
    /// broken and later attempts return this same error without re-probing.
    #[error("could not open '{name}': {reason}")]
    OpenFailed { name: String, reason: String },

    /// Requested subimage index exceeds what the resource provides.
    #[error("subimage {subimage} out of range for '{name}' ({count} subimages)")]
    SubimageOutOfRange {
        name: String,
        subimage: u32,
        count: u32,
    },

    /// Requested miplevel index exceeds what the subimage provides.
    #[error("miplevel {miplevel} out of range for '{name}' subimage {subimage} ({count} levels)")]
    MiplevelOutOfRange {
        name: String,
        subimage: u32,
        miplevel: u32,
        count: u32,
    },

    /// Tile origin is not tile-aligned or lies outside the data window.
    #[error("tile origin ({x}, {y}, {z}) out of range for '{name}'")]
    TileOutOfRange { name: String, x: i32, y: i32, z: i32 },

    /// Region lies entirely outside the data window. Only reported in
    /// strict-region mode; the default policy fills instead.
    #[error("region {region:?} outside the data window of '{name}'")]
    RegionOutOfRange { name: String, region: Region },

    /// I/O or format error while decoding one region or tile. Does not
    /// poison the file record or sibling tiles.
    #[error("decode failed for '{name}': {reason}")]
    DecodeFailed { name: String, reason: String },

    /// Operation is not meaningful for this resource.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Malformed request: mismatched buffer size, empty region, bad
    /// channel range, and the like.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
