// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_isp::policy::Size;
use std::path::PathBuf;

/// Command-line arguments for the EdgeFirst ISP pipeline host.
///
/// This structure defines the stream configuration the host negotiates
/// with the policy chain, the buffer and metadata sizing, and debugging
/// options. Arguments can be specified via command line or environment
/// variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-isp --preview-size 1280 720 --still-size 3840 2160 --zsl
///
/// # Via environment variables
/// export PREVIEW_SIZE="1280 720"
/// export FRAMES=300
/// edgefirst-isp
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Physical sensor id to configure
    #[arg(short, long, env = "SENSOR", default_value = "0")]
    pub sensor: u32,

    /// Platform capability JSON file; the built-in OS08A20 description is
    /// used when omitted
    #[arg(long, env = "CAPS_PATH")]
    pub caps_path: Option<PathBuf>,

    /// Preview stream resolution in pixels (width height)
    #[arg(
        short,
        long,
        env = "PREVIEW_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub preview_size: Vec<u32>,

    /// Video recording stream resolution in pixels (width height)
    #[arg(long, env = "VIDEO_SIZE", value_delimiter = ' ', num_args = 2)]
    pub video_size: Option<Vec<u32>>,

    /// Still capture stream resolution in pixels (width height)
    #[arg(long, env = "STILL_SIZE", value_delimiter = ' ', num_args = 2)]
    pub still_size: Option<Vec<u32>>,

    /// Request a still capture every N frames
    #[arg(long, env = "STILL_INTERVAL", default_value = "30")]
    pub still_interval: u64,

    /// Enable zero shutter lag still capture
    #[arg(long, env = "ZSL")]
    pub zsl: bool,

    /// Number of frames to run before exiting
    #[arg(short, long, env = "FRAMES", default_value = "120")]
    pub frames: u64,

    /// Target frame rate; 0 selects the platform default
    #[arg(long, env = "FPS", default_value = "30")]
    pub fps: u32,

    /// Buffers constructed up front per pool; 0 uses the policy minimum
    #[arg(long, env = "POOL_MIN", default_value = "0")]
    pub pool_min: usize,

    /// Buffer ceiling per pool; 0 uses the policy maximum
    #[arg(long, env = "POOL_MAX", default_value = "0")]
    pub pool_max: usize,

    /// Allocate buffers from the CMA DMA heap instead of system memory
    #[arg(long, env = "DMA")]
    pub dma: bool,

    /// Visible entries in the side metadata store
    #[arg(long, env = "STORE_CAPACITY", default_value = "16")]
    pub store_capacity: usize,

    /// Spare slots in the side metadata store
    #[arg(long, env = "STORE_BACKUP", default_value = "4")]
    pub store_backup: usize,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

fn to_size(pair: &[u32]) -> Option<Size> {
    match pair {
        [width, height] => Some(Size::new(*width, *height)),
        _ => None,
    }
}

impl Args {
    pub fn preview(&self) -> Option<Size> {
        to_size(&self.preview_size)
    }

    pub fn video(&self) -> Option<Size> {
        self.video_size.as_deref().and_then(to_size)
    }

    pub fn still(&self) -> Option<Size> {
        self.still_size.as_deref().and_then(to_size)
    }
}
