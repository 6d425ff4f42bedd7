// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst ISP Pipeline Library
//!
//! This library provides the frame-processing core of the EdgeFirst ISP
//! pipeline host. It routes per-request image buffers through a graph of
//! processing nodes, negotiates hardware resources through a layered policy
//! chain, and manages buffers and device events safely across the threads
//! the pipeline runs on.
//!
//! ## Features
//!
//! - **Pipeline Graph**: One thread per processing node, frames forwarded
//!   along statically registered edges with a completion callback fired
//!   exactly once per frame.
//! - **Buffer Pools**: Bounded pools of DMA or system memory images with
//!   background construction and FIFO wake-up of blocked callers.
//! - **Poller**: A reactor thread multiplexing device readiness with a
//!   self-pipe so any blocking wait can be cancelled.
//! - **Policy Chain**: Feature, sensor, geometry, DMA and descriptor stages
//!   resolved in strict order, plus per-request routing.
//! - **Metadata Store**: A bounded, timestamp-indexed store for side
//!   metadata shared between nodes.
//!
//! ## Example
//!
//! ```
//! use edgefirst_isp::{
//!     image::{SystemAllocator, NV12},
//!     policy::{ConfigInput, PlatformCaps, PolicyChain, Size, StreamDesc, Usage},
//!     pool::BufferPool,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chain = PolicyChain::new(PlatformCaps::default());
//! let config = chain.evaluate_configuration(&ConfigInput {
//!     streams: vec![StreamDesc::output(0, Size::new(1280, 720), NV12, Usage::COMPOSER)],
//!     ..Default::default()
//! })?;
//!
//! // One pool per stream descriptor
//! for info in &config.streams {
//!     let pool = BufferPool::new(info.name.as_str(), info.spec, Arc::new(SystemAllocator));
//!     pool.init(info.max_buffers, info.min_buffers)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with DMA heap support for DMA-backed images
//!   (system memory images work everywhere)
//!
//! ## Safety
//!
//! This library uses `unsafe` code for `poll(2)`, pipe and `mmap(2)` calls.
//! All unsafe operations are isolated to the [`poller`] and [`image`]
//! modules and wrapped with safe APIs.

pub mod error;
pub mod image;
pub mod pipeline;
pub mod policy;
pub mod poller;
pub mod pool;
pub mod store;

pub use error::{Error, Result, StatusCode};

/// Current `CLOCK_MONOTONIC` time in nanoseconds, the timebase of frame
/// timestamps and metadata store keys.
pub fn timestamp_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec; CLOCK_MONOTONIC is always
    // available on Linux.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
