//! Multi-threaded behavior: single-flight decoding and shared residency.

use std::sync::Arc;
use std::thread;

use pixcache::{CacheConfig, ChannelRange, Region, SampleType};

use crate::integration::test_utils::{build_cache, expected_sample, gradient_image};

/// Eight threads each fetch the same 2x2-tile region of a 256x256 image
/// with 64-pixel tiles. Every thread gets correct pixels, and the four
/// tiles are decoded exactly four times in total.
#[test]
fn test_eight_threads_four_tiles_four_decodes() {
    let t = build_cache(CacheConfig::default());
    let image = gradient_image(256, 256, 1, 64);
    t.opener.register("img", image.clone());

    let region = Region::new_2d(64, 192, 64, 192);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = t.cache.clone();
            thread::spawn(move || {
                let mut info = cache.create_thread_info();
                let handle = cache.get_image_handle(&mut info, "img");
                let mut out = vec![0u8; region.pixels() as usize];
                cache
                    .get_pixels(
                        &mut info,
                        &handle,
                        0,
                        0,
                        region,
                        ChannelRange::all(1),
                        SampleType::U8,
                        &mut out,
                    )
                    .unwrap();
                cache.destroy_thread_info(info);
                out
            })
        })
        .collect();

    let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for out in &results {
        assert_eq!(out[0], expected_sample(64, 64, 0));
        assert_eq!(out, &results[0]);
    }

    assert_eq!(image.decode_count(), 4, "each tile decoded exactly once");
    assert_eq!(t.opener.open_count(), 1, "file opened exactly once");
    let stats = t.cache.stats();
    assert_eq!(stats.tiles_created, 4);
    assert_eq!(stats.tile_queries, 8 * 4);
    assert_eq!(stats.tile_hits, 8 * 4 - 4);
}

/// Threads working on disjoint files and tiles never interfere: every read
/// is correct and every tile is decoded once.
#[test]
fn test_disjoint_files_in_parallel() {
    let t = build_cache(CacheConfig::default());
    let images: Vec<_> = (0..4)
        .map(|i| {
            let image = gradient_image(128, 128, 1, 32);
            t.opener.register(format!("img-{i}"), image.clone());
            image
        })
        .collect();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let cache = t.cache.clone();
            thread::spawn(move || {
                let mut info = cache.create_thread_info();
                let handle = cache.get_image_handle(&mut info, &format!("img-{i}"));
                // Walk every tile of the file twice.
                for _ in 0..2 {
                    for ty in (0..128).step_by(32) {
                        for tx in (0..128).step_by(32) {
                            let tile = cache
                                .get_tile(
                                    &mut info,
                                    &handle,
                                    0,
                                    0,
                                    tx,
                                    ty,
                                    0,
                                    ChannelRange::all(1),
                                )
                                .unwrap();
                            assert_eq!(tile.pixels()[0], expected_sample(tx, ty, 0));
                            cache.release_tile(tile);
                        }
                    }
                }
                cache.destroy_thread_info(info);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for image in &images {
        assert_eq!(image.decode_count(), 16);
    }
    assert_eq!(t.cache.stats().resident_tiles, 4 * 16);
}

/// Invalidation racing readers: reads stay correct (the image content is
/// unchanged), and afterwards the resource is still fully usable.
#[test]
fn test_invalidate_races_readers() {
    let t = build_cache(CacheConfig::default());
    t.opener.register("img", gradient_image(128, 128, 1, 32));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = t.cache.clone();
            thread::spawn(move || {
                let mut info = cache.create_thread_info();
                let handle = cache.get_image_handle(&mut info, "img");
                for round in 0..50 {
                    let x = (round % 4) * 32;
                    let tile = cache
                        .get_tile(&mut info, &handle, 0, 0, x, 0, 0, ChannelRange::all(1))
                        .unwrap();
                    assert_eq!(tile.pixels()[0], expected_sample(x, 0, 0));
                    cache.release_tile(tile);
                }
                cache.destroy_thread_info(info);
            })
        })
        .collect();

    let invalidator = {
        let cache = t.cache.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                cache.invalidate("img");
                thread::yield_now();
            }
        })
    };

    for h in readers {
        h.join().unwrap();
    }
    invalidator.join().unwrap();

    // Still healthy after the dust settles.
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");
    let tile = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 96, 96, 0, ChannelRange::all(1))
        .unwrap();
    assert_eq!(tile.pixels()[0], expected_sample(96, 96, 0));
    t.cache.destroy_thread_info(info);
}
