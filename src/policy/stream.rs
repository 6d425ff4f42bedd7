// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stream descriptors supplied by the camera framework.

use crate::image::{is_raw, FourCC};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::BitOr};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn fits_within(&self, other: &Size) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Consumer usage flags declared on a stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Usage(u32);

impl Usage {
    pub const NONE: Usage = Usage(0);
    /// Sampled by the GPU.
    pub const TEXTURE: Usage = Usage(1 << 0);
    /// Scanned out by the display composer.
    pub const COMPOSER: Usage = Usage(1 << 1);
    pub const VIDEO_ENCODER: Usage = Usage(1 << 2);
    pub const CPU_READ: Usage = Usage(1 << 3);
    /// Full quality still capture (JPEG blob or YUV snapshot).
    pub const STILL: Usage = Usage(1 << 4);

    pub fn contains(self, other: Usage) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Usage {
    type Output = Usage;

    fn bitor(self, rhs: Usage) -> Usage {
        Usage(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Output,
    /// Reprocessing input fed back into the pipeline.
    Input,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDesc {
    pub id: StreamId,
    pub size: Size,
    pub format: FourCC,
    pub usage: Usage,
    pub direction: Direction,
}

impl StreamDesc {
    pub fn output(id: u32, size: Size, format: FourCC, usage: Usage) -> Self {
        Self {
            id: StreamId(id),
            size,
            format,
            usage,
            direction: Direction::Output,
        }
    }

    pub fn input(id: u32, size: Size, format: FourCC) -> Self {
        Self {
            id: StreamId(id),
            size,
            format,
            usage: Usage::NONE,
            direction: Direction::Input,
        }
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    pub fn is_raw(&self) -> bool {
        is_raw(self.format)
    }

    pub fn is_still(&self) -> bool {
        self.usage.contains(Usage::STILL)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OperationMode {
    #[default]
    Normal,
    /// Constrained high frame rate recording.
    HighSpeed,
}

/// Everything a stream configuration call carries into the policy chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigInput {
    /// Physical sensors to configure; empty selects the first sensor.
    pub sensors: Vec<u32>,
    pub streams: Vec<StreamDesc>,
    pub mode: OperationMode,
    /// Requested frame rate, 0 for the platform default.
    pub target_fps: u32,
    /// Caller asks for zero shutter lag still capture.
    pub zsl_requested: bool,
}

impl ConfigInput {
    pub fn outputs(&self) -> impl Iterator<Item = &StreamDesc> {
        self.streams.iter().filter(|s| s.is_output())
    }

    pub fn input(&self) -> Option<&StreamDesc> {
        self.streams.iter().find(|s| !s.is_output())
    }

    pub fn stream(&self, id: StreamId) -> Option<&StreamDesc> {
        self.streams.iter().find(|s| s.id == id)
    }
}
