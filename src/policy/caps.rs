// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Static platform capabilities: ISP hardware limits and the sensor list.
//!
//! Capabilities are normally loaded from a JSON file shipped with the board
//! support package:
//!
//! ```json
//! {
//!   "hw": { "stride_alignment": 64, "resizer_max_width": 2304, ... },
//!   "sensors": [
//!     { "id": 0, "name": "os08a20",
//!       "modes": [ { "name": "4k30", "width": 3840, "height": 2160,
//!                    "max_fps": 30, "bit_depth": 10 } ] }
//!   ]
//! }
//! ```

use super::stream::Size;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HwLimits {
    /// DMA line stride alignment in bytes.
    pub stride_alignment: usize,
    /// Resizer output width/height must be a multiple of these.
    pub width_alignment: u32,
    pub height_alignment: u32,
    /// Widest line the resizer can produce.
    pub resizer_max_width: u32,
    /// Strongest downscale the resizer supports, as a percentage of the
    /// sensor output.
    pub resizer_min_ratio: u32,
    /// Bytes of DMA memory the ISP buffers may occupy in total.
    pub dma_budget_bytes: u64,
    /// Buffers kept per hardware path in normal streaming.
    pub base_buffers: usize,
    /// Extra full resolution buffers held back for zero shutter lag.
    pub zsl_depth: usize,
    pub supports_zsl: bool,
}

impl Default for HwLimits {
    fn default() -> Self {
        Self {
            stride_alignment: 64,
            width_alignment: 16,
            height_alignment: 2,
            resizer_max_width: 2304,
            resizer_min_ratio: 25,
            dma_budget_bytes: 512 * 1024 * 1024,
            base_buffers: 4,
            zsl_depth: 4,
            supports_zsl: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub max_fps: u32,
    pub bit_depth: u8,
}

impl SensorMode {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorCaps {
    pub id: u32,
    pub name: String,
    pub modes: Vec<SensorMode>,
}

impl SensorCaps {
    /// Largest mode, which covers the whole active array.
    pub fn active_array(&self) -> Size {
        self.modes
            .iter()
            .map(SensorMode::size)
            .max_by_key(Size::area)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlatformCaps {
    #[serde(default)]
    pub hw: HwLimits,
    pub sensors: Vec<SensorCaps>,
}

impl Default for PlatformCaps {
    /// A single OS08A20 4K sensor behind the i.MX8M Plus ISP.
    fn default() -> Self {
        Self {
            hw: HwLimits::default(),
            sensors: vec![SensorCaps {
                id: 0,
                name: "os08a20".to_string(),
                modes: vec![
                    SensorMode {
                        name: "4k30".to_string(),
                        width: 3840,
                        height: 2160,
                        max_fps: 30,
                        bit_depth: 10,
                    },
                    SensorMode {
                        name: "1080p60".to_string(),
                        width: 1920,
                        height: 1080,
                        max_fps: 60,
                        bit_depth: 10,
                    },
                    SensorMode {
                        name: "720p120".to_string(),
                        width: 1280,
                        height: 720,
                        max_fps: 120,
                        bit_depth: 10,
                    },
                ],
            }],
        }
    }
}

impl PlatformCaps {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let caps: PlatformCaps = serde_json::from_str(json)
            .map_err(|e| Error::bad_value(format!("invalid platform capabilities: {e}")))?;
        caps.validate()?;
        Ok(caps)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let caps: PlatformCaps = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::bad_value(format!("invalid platform capabilities {}: {e}", path.display()))
        })?;
        caps.validate()?;
        debug!(path = %path.display(), sensors = caps.sensors.len(), "platform capabilities loaded");
        Ok(caps)
    }

    pub fn sensor(&self, id: u32) -> Option<&SensorCaps> {
        self.sensors.iter().find(|s| s.id == id)
    }

    /// # Errors
    ///
    /// Returns `BadValue` for an empty sensor list, a sensor without modes,
    /// zero sized modes or zero alignments.
    pub fn validate(&self) -> Result<()> {
        if self.sensors.is_empty() {
            return Err(Error::bad_value("platform has no sensors"));
        }
        if self.hw.stride_alignment == 0
            || self.hw.width_alignment == 0
            || self.hw.height_alignment == 0
        {
            return Err(Error::bad_value("hardware alignments must be non-zero"));
        }
        if self.hw.resizer_min_ratio == 0 || self.hw.resizer_min_ratio > 100 {
            return Err(Error::bad_value(format!(
                "resizer_min_ratio must be within 1..=100, got {}",
                self.hw.resizer_min_ratio
            )));
        }
        for sensor in &self.sensors {
            if sensor.modes.is_empty() {
                return Err(Error::bad_value(format!("sensor {} has no modes", sensor.id)));
            }
            if let Some(mode) = sensor
                .modes
                .iter()
                .find(|m| m.size().is_empty() || m.max_fps == 0)
            {
                return Err(Error::bad_value(format!(
                    "sensor {} mode {} is degenerate",
                    sensor.id, mode.name
                )));
            }
        }
        Ok(())
    }
}
