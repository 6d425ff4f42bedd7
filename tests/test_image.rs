// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_isp::{
    error::StatusCode,
    image::{
        self, DmaHeapAllocator, FourCC, Image, ImageAllocator, ImageSpec, SystemAllocator,
    },
};
use serial_test::serial;
use std::error::Error;

#[test]
#[serial]
fn test_formats() -> Result<(), Box<dyn Error>> {
    let mut spec = ImageSpec::new(1920, 1080, image::NV12)?;
    println!("{}", spec);
    assert_eq!(spec.size(), 3110400);

    spec = ImageSpec::new(1920, 1080, image::YUYV)?;
    println!("{}", spec);
    assert_eq!(spec.size(), 4147200);

    spec = ImageSpec::new(1920, 1080, image::RGB3)?;
    println!("{}", spec);
    assert_eq!(spec.size(), 6220800);

    spec = ImageSpec::new(1920, 1080, image::RGBA)?;
    println!("{}", spec);
    assert_eq!(spec.size(), 8294400);

    spec = ImageSpec::new(3840, 2160, image::RAW10)?;
    println!("{}", spec);
    assert_eq!(spec.size(), 16588800);

    Ok(())
}

#[test]
#[serial]
fn test_aligned_stride() -> Result<(), Box<dyn Error>> {
    let spec = ImageSpec::aligned(1000, 100, image::NV12, 64)?;
    assert_eq!(spec.stride, 1024);
    assert_eq!(spec.size(), 1024 * 150);

    // already aligned widths keep their natural stride
    let spec = ImageSpec::aligned(1920, 1080, image::NV12, 64)?;
    assert_eq!(spec.stride, 1920);
    assert_eq!(spec, ImageSpec::new(1920, 1080, image::NV12)?);

    Ok(())
}

#[test]
#[serial]
fn test_bad_specs() -> Result<(), Box<dyn Error>> {
    let err = ImageSpec::new(0, 1080, image::NV12).unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);

    let err = ImageSpec::new(1920, 1080, FourCC(*b"XXXX")).unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);

    let spec = ImageSpec::new(64, 64, image::RGBA)?;
    let err = Image::from_vec(vec![0; 100], spec).unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);

    Ok(())
}

#[test]
#[serial]
fn test_system_image() -> Result<(), Box<dyn Error>> {
    let spec = ImageSpec::new(640, 480, image::YUYV)?;
    let img = SystemAllocator.allocate(&spec)?;
    println!("{}", img);
    assert!(!img.is_dma());
    assert!(img.fd().is_none());
    assert_eq!(img.size(), 614400);

    img.write_with(|data| data[..4].copy_from_slice(b"EDGE"))?;
    let head = img.write_with(|data| data[..4].to_vec())?;
    assert_eq!(head, b"EDGE");

    Ok(())
}

/// This test verifies that image buffers are properly cleaned up when the
/// image is dropped. If images are not cleaned up it will eventually fail
/// as 100 1080p images would require ~800MB of CMA memory.
#[test]
#[serial]
#[ignore = "dma heap test is disabled by default (run with --include-ignored to enable)"]
fn test_dma_cleanup() -> Result<(), Box<dyn Error>> {
    let alloc = DmaHeapAllocator::new()?;
    let spec = ImageSpec::new(1920, 1080, image::RGBA)?;
    for _ in 0..100 {
        let img = alloc.allocate(&spec)?;
        assert!(img.is_dma());
        assert_eq!(img.size(), 8294400);
    }

    Ok(())
}
