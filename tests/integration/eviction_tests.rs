//! Memory budget, pinning, and the open-file cap under real workloads.

use pixcache::{CacheConfig, ChannelRange, SampleType};

use crate::integration::test_utils::{build_cache, expected_sample, gradient_image};

const TILE_BYTES: usize = 32 * 32;

/// With no outstanding references, residency converges to the budget.
#[test]
fn test_budget_convergence_without_references() {
    // Room for four 32x32 single-channel tiles.
    let t = build_cache(CacheConfig::new().with_max_memory_bytes(4 * TILE_BYTES));
    t.opener.register("img", gradient_image(256, 256, 1, 32));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    for ty in (0..256).step_by(32) {
        for tx in (0..256).step_by(32) {
            let tile = t
                .cache
                .get_tile(&mut info, &handle, 0, 0, tx, ty, 0, ChannelRange::all(1))
                .unwrap();
            t.cache.release_tile(tile);
        }
    }
    t.cache.destroy_thread_info(info);

    let stats = t.cache.stats();
    assert!(
        stats.resident_bytes <= 4 * TILE_BYTES,
        "resident {} exceeds budget",
        stats.resident_bytes
    );
    assert_eq!(stats.tiles_created, 64);
    assert!(stats.tiles_evicted >= 60);
}

/// Pinned tiles are never evicted; the budget overshoots instead. Releasing
/// them makes them eligible, and the next pass reclaims.
#[test]
fn test_pinned_tiles_cause_overshoot_not_eviction() {
    let t = build_cache(CacheConfig::new().with_max_memory_bytes(2 * TILE_BYTES));
    t.opener.register("img", gradient_image(256, 256, 1, 32));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    let mut pinned = Vec::new();
    for tx in (0..192).step_by(32) {
        let tile = t
            .cache
            .get_tile(&mut info, &handle, 0, 0, tx, 0, 0, ChannelRange::all(1))
            .unwrap();
        pinned.push((tx, tile));
    }
    // Six pinned tiles against a two-tile budget: transient overshoot.
    assert_eq!(t.cache.stats().resident_tiles, 6);
    assert!(t.cache.stats().resident_bytes > 2 * TILE_BYTES);
    for (tx, tile) in &pinned {
        assert_eq!(tile.pixels()[0], expected_sample(*tx, 0, 0));
    }

    // Release everything; the next insertion triggers a pass that trims.
    drop(pinned);
    info.clear();
    let tile = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 0, 32, 0, ChannelRange::all(1))
        .unwrap();
    t.cache.release_tile(tile);
    assert!(t.cache.stats().resident_bytes <= 2 * TILE_BYTES);
    t.cache.destroy_thread_info(info);
}

/// A tile that was evicted behind a thread's back is silently re-fetched;
/// the microcache never serves stale residency.
#[test]
fn test_microcache_survives_eviction() {
    let t = build_cache(CacheConfig::new().with_max_memory_bytes(2 * TILE_BYTES));
    let image = gradient_image(256, 256, 1, 32);
    t.opener.register("img", image.clone());
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    let first = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 0, 0, 0, ChannelRange::all(1))
        .unwrap();
    t.cache.release_tile(first);
    info.clear();

    // Flood the cache so tile (0, 0) is evicted.
    for tx in (32..224).step_by(32) {
        let tile = t
            .cache
            .get_tile(&mut info, &handle, 0, 0, tx, 0, 0, ChannelRange::all(1))
            .unwrap();
        t.cache.release_tile(tile);
    }
    info.clear();

    let decodes_before = image.decode_count();
    let again = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 0, 0, 0, ChannelRange::all(1))
        .unwrap();
    assert_eq!(again.pixels()[0], expected_sample(0, 0, 0));
    assert_eq!(image.decode_count(), decodes_before + 1, "tile was re-decoded");
    t.cache.destroy_thread_info(info);
}

/// The open-file cap closes idle decoders but never loses metadata or
/// correctness; capped reads still succeed through silent reopens.
#[test]
fn test_open_file_cap_under_load() {
    let t = build_cache(CacheConfig::new().with_max_open_files(2));
    for i in 0..6 {
        t.opener.register(format!("img-{i}"), gradient_image(64, 64, 1, 32));
    }
    let mut info = t.cache.create_thread_info();

    for round in 0..3 {
        for i in 0..6 {
            let handle = t.cache.get_image_handle(&mut info, &format!("img-{i}"));
            let spec = t.cache.get_geometry(&mut info, &handle, 0, 0).unwrap();
            assert_eq!(spec.width, 64);
            // Alternate origins so most rounds need the decoder.
            let tx = (round % 2) * 32;
            let tile = t
                .cache
                .get_tile(&mut info, &handle, 0, 0, tx, 32, 0, ChannelRange::all(1))
                .unwrap();
            assert_eq!(tile.pixels()[0], expected_sample(tx, 32, 0));
            t.cache.release_tile(tile);
            assert!(t.cache.stats().open_files <= 2);
        }
    }

    let stats = t.cache.stats();
    assert!(stats.open_files_peak <= 2 + 1, "cap is approximately honored");
    assert!(stats.files_closed >= 4);
    assert!(t.opener.open_count() >= 6, "reopens went through the opener");
    t.cache.destroy_thread_info(info);
}

/// Shrinking the budget at runtime trims immediately.
#[test]
fn test_runtime_budget_shrink() {
    let t = build_cache(CacheConfig::default());
    t.opener.register("img", gradient_image(256, 256, 1, 32));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    for tx in (0..256).step_by(32) {
        let tile = t
            .cache
            .get_tile(&mut info, &handle, 0, 0, tx, 0, 0, ChannelRange::all(1))
            .unwrap();
        t.cache.release_tile(tile);
    }
    t.cache.destroy_thread_info(info);
    assert_eq!(t.cache.stats().resident_bytes, 8 * TILE_BYTES);

    t.cache.set_max_memory_bytes(3 * TILE_BYTES);
    assert!(t.cache.stats().resident_bytes <= 3 * TILE_BYTES);
}
