// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use core::fmt;
use dma_heap::{Heap, HeapKind};
use std::{
    ffi::c_void,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    ptr::null_mut,
    slice::from_raw_parts_mut,
    sync::{Mutex, PoisonError},
};
use tracing::{debug, warn};

/// Four character pixel format code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.0 {
            write!(f, "{}", c as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({self})")
    }
}

/// RGB 24-bit pixel format (8 bits per channel, no alpha)
pub const RGB3: FourCC = FourCC(*b"RGB3");

/// RGBA 32-bit pixel format (8 bits per channel, with alpha)
pub const RGBA: FourCC = FourCC(*b"RGBA");

/// YUYV 4:2:2 YUV packed format (common camera output format)
pub const YUYV: FourCC = FourCC(*b"YUYV");

/// NV12 4:2:0 YUV semi-planar format (efficient for video encoding)
pub const NV12: FourCC = FourCC(*b"NV12");

/// 10-bit Bayer RGGB, one sample per 16-bit container
pub const RAW10: FourCC = FourCC(*b"RG10");

/// 12-bit Bayer RGGB, one sample per 16-bit container
pub const RAW12: FourCC = FourCC(*b"RG12");

/// Compressed still image blob, sized for the worst case NV12 payload
pub const JPEG: FourCC = FourCC(*b"JPEG");

pub const fn is_raw(format: FourCC) -> bool {
    matches!(format, RAW10 | RAW12)
}

/// Bytes in one line of the first plane, before any hardware alignment.
pub const fn format_row_stride(format: FourCC, width: u32) -> Option<usize> {
    let width = width as usize;
    match format {
        RGB3 => Some(3 * width),
        RGBA => Some(4 * width),
        YUYV | RAW10 | RAW12 => Some(2 * width),
        NV12 | JPEG => Some(width),
        _ => None,
    }
}

/// Number of first-plane lines needed for `height` rows, including any
/// chroma planes stored below the luma plane.
const fn plane_lines(format: FourCC, height: u32) -> usize {
    match format {
        NV12 | JPEG => height as usize + height as usize / 2,
        _ => height as usize,
    }
}

pub const fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Rectangle specification for crop operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    /// X coordinate of top-left corner
    pub x: i32,
    /// Y coordinate of top-left corner
    pub y: i32,
    /// Width of the rectangle in pixels
    pub width: i32,
    /// Height of the rectangle in pixels
    pub height: i32,
}

/// Geometry of an image buffer: dimensions, format and line stride.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageSpec {
    pub width: u32,
    pub height: u32,
    pub format: FourCC,
    pub stride: usize,
}

impl ImageSpec {
    /// Describes a tightly packed image.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` for zero dimensions or an unknown format.
    pub fn new(width: u32, height: u32, format: FourCC) -> Result<Self> {
        Self::aligned(width, height, format, 1)
    }

    /// Describes an image whose line stride is rounded up to `alignment`
    /// bytes, as required by DMA engines that write whole bursts per line.
    pub fn aligned(width: u32, height: u32, format: FourCC, alignment: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::bad_value(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let stride = format_row_stride(format, width)
            .ok_or_else(|| Error::bad_value(format!("unsupported pixel format {format}")))?;
        Ok(Self {
            width,
            height,
            format,
            stride: align_up(stride, alignment),
        })
    }

    pub fn size(&self) -> usize {
        self.stride * plane_lines(self.format, self.height)
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}x{} {} stride:{}",
            self.width, self.height, self.format, self.stride
        )
    }
}

#[derive(Debug)]
enum Storage {
    Dma(OwnedFd),
    System(Mutex<Vec<u8>>),
}

/// Image buffer backed either by a DMA heap allocation, shareable with
/// hardware blocks and other processes, or by plain system memory.
///
/// The backing memory is freed when the `Image` is dropped.
#[derive(Debug)]
pub struct Image {
    storage: Storage,
    spec: ImageSpec,
}

impl Image {
    pub fn from_fd(fd: OwnedFd, spec: ImageSpec) -> Self {
        Self {
            storage: Storage::Dma(fd),
            spec,
        }
    }

    pub fn from_vec(data: Vec<u8>, spec: ImageSpec) -> Result<Self> {
        if data.len() < spec.size() {
            return Err(Error::bad_value(format!(
                "buffer of {} bytes is too small for {}",
                data.len(),
                spec
            )));
        }
        Ok(Self {
            storage: Storage::System(Mutex::new(data)),
            spec,
        })
    }

    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    pub fn width(&self) -> u32 {
        self.spec.width
    }

    pub fn height(&self) -> u32 {
        self.spec.height
    }

    pub fn format(&self) -> FourCC {
        self.spec.format
    }

    pub fn size(&self) -> usize {
        self.spec.size()
    }

    /// DMA file descriptor, `None` for system memory images.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.storage {
            Storage::Dma(fd) => Some(fd.as_fd()),
            Storage::System(_) => None,
        }
    }

    pub fn is_dma(&self) -> bool {
        matches!(self.storage, Storage::Dma(_))
    }

    /// Runs `f` with CPU write access to the image memory.
    ///
    /// DMA images are mapped for the duration of the call. Hardware must be
    /// finished with the buffer before the CPU touches it.
    pub fn write_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        match &self.storage {
            Storage::System(data) => {
                let mut data = data.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(f(&mut data[..]))
            }
            Storage::Dma(fd) => {
                let mut mapped = MappedImage::new(fd.as_raw_fd(), self.size())?;
                Ok(f(mapped.as_slice_mut()))
            }
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.storage {
            Storage::Dma(fd) => write!(f, "{} fd:{:?}", self.spec, fd),
            Storage::System(_) => write!(f, "{} sysmem", self.spec),
        }
    }
}

struct MappedImage {
    mmap: *mut u8,
    len: usize,
}

impl MappedImage {
    fn new(fd: i32, len: usize) -> Result<Self> {
        let mmap = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mmap == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            mmap: mmap as *mut u8,
            len,
        })
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.mmap, self.len) }
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed!");
        }
    }
}

/// Width/height/format aware image allocator used by the buffer pool.
pub trait ImageAllocator: Send + Sync {
    /// Allocates one image.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` when the backing memory cannot be obtained.
    fn allocate(&self, spec: &ImageSpec) -> Result<Image>;
}

/// Allocates images from the CMA DMA heap so they can be handed to the ISP
/// and other hardware blocks without copies.
pub struct DmaHeapAllocator {
    heap: Heap,
}

impl DmaHeapAllocator {
    /// Opens the CMA heap.
    ///
    /// # Errors
    ///
    /// Returns an error if the DMA heap device is not accessible.
    pub fn new() -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma)
            .map_err(|e| Error::Unknown(format!("failed to open CMA heap: {e}")))?;
        Ok(Self { heap })
    }
}

impl ImageAllocator for DmaHeapAllocator {
    fn allocate(&self, spec: &ImageSpec) -> Result<Image> {
        let fd = self
            .heap
            .allocate(spec.size())
            .map_err(|e| Error::no_memory(format!("dma heap allocation of {spec}: {e}")))?;
        debug!(%spec, "dma image allocated");
        Ok(Image::from_fd(fd, *spec))
    }
}

/// Allocates images in ordinary process memory, for hosts without a DMA
/// heap and for tests.
#[derive(Default, Debug, Clone, Copy)]
pub struct SystemAllocator;

impl ImageAllocator for SystemAllocator {
    fn allocate(&self, spec: &ImageSpec) -> Result<Image> {
        let mut data = Vec::new();
        data.try_reserve_exact(spec.size())
            .map_err(|e| Error::no_memory(format!("system allocation of {spec}: {e}")))?;
        data.resize(spec.size(), 0);
        Image::from_vec(data, *spec)
    }
}
