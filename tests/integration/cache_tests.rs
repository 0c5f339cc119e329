//! End-to-end behavior of the public cache surface.

use std::sync::Arc;

use pixcache::plugin::{MemoryImage, MemoryReader};
use pixcache::{CacheConfig, CacheError, ChannelRange, ImageSpec, Region, SampleType};

use crate::integration::test_utils::{build_cache, expected_sample, gradient_image};

#[test]
fn test_region_round_trip_matches_source() {
    let t = build_cache(CacheConfig::default());
    t.opener.register("img", gradient_image(256, 256, 3, 64));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    // An awkward region: unaligned, spanning tile boundaries.
    let region = Region::new_2d(17, 211, 45, 133);
    let channels = ChannelRange::all(3);
    let mut out = vec![0u8; region.pixels() as usize * 3];
    t.cache
        .get_pixels(&mut info, &handle, 0, 0, region, channels, SampleType::U8, &mut out)
        .unwrap();

    let width = region.width() as usize;
    for y in region.ybegin..region.yend {
        for x in region.xbegin..region.xend {
            for c in 0..3u32 {
                let off = ((y - region.ybegin) as usize * width
                    + (x - region.xbegin) as usize)
                    * 3
                    + c as usize;
                assert_eq!(out[off], expected_sample(x, y, c), "at ({x}, {y}, {c})");
            }
        }
    }
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_channel_subsets_are_distinct_tiles() {
    let t = build_cache(CacheConfig::default());
    let image = gradient_image(128, 128, 3, 64);
    t.opener.register("img", image.clone());
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");

    let all = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 0, 0, 0, ChannelRange::all(3))
        .unwrap();
    let green = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 0, 0, 0, ChannelRange::new(1, 2))
        .unwrap();

    assert_eq!(all.pixels().len(), 64 * 64 * 3);
    assert_eq!(green.pixels().len(), 64 * 64);
    assert_eq!(green.pixels()[0], expected_sample(0, 0, 1));
    // Two distinct cache entries, two decodes.
    assert_eq!(image.decode_count(), 2);
    assert_eq!(t.cache.stats().resident_tiles, 2);
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_subimages_and_miplevels() {
    let t = build_cache(CacheConfig::default());

    // Subimage 0 with two miplevels, subimage 1 with one.
    let spec0 = ImageSpec::new_2d(64, 64, 1, SampleType::U8).with_tiles(32, 32);
    let mut image = MemoryImage::new(spec0, vec![1u8; 64 * 64]).unwrap();
    let mip = ImageSpec::new_2d(32, 32, 1, SampleType::U8).with_tiles(32, 32);
    image.push_miplevel(0, mip, vec![2u8; 32 * 32]).unwrap();
    let sub = image.push_subimage();
    let spec1 = ImageSpec::new_2d(16, 16, 1, SampleType::U8).with_tiles(16, 16);
    image.push_miplevel(sub, spec1, vec![3u8; 16 * 16]).unwrap();
    t.opener.register("multi", Arc::new(image));

    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "multi");

    assert_eq!(t.cache.get_geometry(&mut info, &handle, 0, 0).unwrap().width, 64);
    assert_eq!(t.cache.get_geometry(&mut info, &handle, 0, 1).unwrap().width, 32);
    assert_eq!(t.cache.get_geometry(&mut info, &handle, 1, 0).unwrap().width, 16);
    assert!(matches!(
        t.cache.get_geometry(&mut info, &handle, 0, 2),
        Err(CacheError::MiplevelOutOfRange { .. })
    ));
    assert!(matches!(
        t.cache.get_geometry(&mut info, &handle, 2, 0),
        Err(CacheError::SubimageOutOfRange { .. })
    ));

    let mut out = vec![0u8; 16 * 16];
    t.cache
        .get_pixels(
            &mut info,
            &handle,
            1,
            0,
            Region::new_2d(0, 16, 0, 16),
            ChannelRange::all(1),
            SampleType::U8,
            &mut out,
        )
        .unwrap();
    assert!(out.iter().all(|&b| b == 3));
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_unknown_name_is_notfound_and_cached() {
    let t = build_cache(CacheConfig::default());
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "ghost.exr");

    let err = t.cache.get_geometry(&mut info, &handle, 0, 0).unwrap_err();
    assert!(matches!(err, CacheError::NotFound(_)));
    let message = t.cache.last_error().unwrap();
    assert!(message.contains("ghost.exr"));

    // Registering the image now does not help until invalidation: the
    // record is settled broken.
    t.opener.register("ghost.exr", gradient_image(32, 32, 1, 32));
    assert!(t.cache.get_geometry(&mut info, &handle, 0, 0).is_err());
    assert_eq!(t.opener.open_count(), 0);

    t.cache.invalidate("ghost.exr");
    assert!(t.cache.get_geometry(&mut info, &handle, 0, 0).is_ok());
    assert_eq!(t.opener.open_count(), 1);
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_conversion_to_wider_types() {
    let t = build_cache(CacheConfig::default());
    t.opener.register("img", gradient_image(64, 64, 1, 32));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "img");
    let region = Region::new_2d(0, 4, 0, 1);

    let mut f32_out = vec![0u8; 4 * 4];
    t.cache
        .get_pixels(
            &mut info, &handle, 0, 0, region, ChannelRange::all(1), SampleType::F32, &mut f32_out,
        )
        .unwrap();
    let v = f32::from_ne_bytes([f32_out[8], f32_out[9], f32_out[10], f32_out[11]]);
    assert!((v - 2.0 / 255.0).abs() < 1e-6);

    let mut u16_out = vec![0u8; 4 * 2];
    t.cache
        .get_pixels(
            &mut info, &handle, 0, 0, region, ChannelRange::all(1), SampleType::U16, &mut u16_out,
        )
        .unwrap();
    let v = u16::from_ne_bytes([u16_out[2], u16_out[3]]);
    // 1/255 scaled to the u16 range.
    assert_eq!(v, (1.0 / 255.0 * u16::MAX as f32 + 0.5) as u16);
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_autotile_synthesized_for_scanline_source() {
    let t = build_cache(CacheConfig::new().with_autotile(16));
    // tile_size 0: scanline-organized source.
    t.opener.register("scan", gradient_image(100, 40, 1, 0));
    let mut info = t.cache.create_thread_info();
    let handle = t.cache.get_image_handle(&mut info, "scan");

    let spec = t.cache.get_geometry(&mut info, &handle, 0, 0).unwrap();
    assert_eq!((spec.tile_width, spec.tile_height), (16, 16));

    // Reads work across the synthesized grid, including the ragged edge.
    let region = Region::new_2d(90, 100, 30, 40);
    let mut out = vec![0u8; region.pixels() as usize];
    t.cache
        .get_pixels(
            &mut info, &handle, 0, 0, region, ChannelRange::all(1), SampleType::U8, &mut out,
        )
        .unwrap();
    assert_eq!(out[0], expected_sample(90, 30, 0));
    t.cache.destroy_thread_info(info);
}

#[test]
fn test_add_file_replacement_purges_stale_tiles() {
    let t = build_cache(CacheConfig::default());
    let mut info = t.cache.create_thread_info();

    let first = gradient_image(64, 64, 1, 32);
    t.cache
        .add_file("mem://buf", Box::new(MemoryReader::new(first)))
        .unwrap();
    let handle = t.cache.get_image_handle(&mut info, "mem://buf");
    let tile = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 32, 32, 0, ChannelRange::all(1))
        .unwrap();
    assert_eq!(tile.pixels()[0], expected_sample(32, 32, 0));
    drop(tile);
    assert_eq!(t.cache.stats().resident_tiles, 1);

    // Replace with a flat image; the gradient tiles must be gone.
    let spec = ImageSpec::new_2d(64, 64, 1, SampleType::U8).with_tiles(32, 32);
    let flat = MemoryImage::new(spec, vec![200u8; 64 * 64]).unwrap();
    t.cache
        .add_file("mem://buf", Box::new(MemoryReader::new(Arc::new(flat))))
        .unwrap();
    assert_eq!(t.cache.stats().resident_tiles, 0);

    let handle = t.cache.get_image_handle(&mut info, "mem://buf");
    let tile = t
        .cache
        .get_tile(&mut info, &handle, 0, 0, 32, 32, 0, ChannelRange::all(1))
        .unwrap();
    assert!(tile.pixels().iter().all(|&b| b == 200));
    t.cache.destroy_thread_info(info);
}
