//! File handle registry.
//!
//! Turns a resource name into a cheap, repeatedly reusable [`ImageHandle`]
//! and caches the expensive-to-reacquire geometry metadata for each
//! (subimage, miplevel) of the resource. Records are created unopened on
//! first lookup; the decoder is attached lazily and at most once, and an
//! open failure is cached as a broken state so repeated failures are cheap.
//!
//! A configurable cap bounds the number of simultaneously open decoder
//! handles. When exceeded, the least-recently-used idle record has its
//! decoder closed (geometry stays cached) and reopens silently on next use.

mod record;
mod registry;

pub use record::ImageHandle;
pub(crate) use registry::FileRegistry;
