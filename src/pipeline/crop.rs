// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    image::Rect,
    policy::Size,
};

/// Maps output sizes onto sensor crop regions.
///
/// The crop keeps the output aspect ratio, is as large as the region
/// allows and is centered in it. Offsets and sizes are even so the crop
/// stays aligned to chroma subsampling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CropCalculator {
    active_array: Size,
}

impl CropCalculator {
    pub fn new(active_array: Size) -> Self {
        Self { active_array }
    }

    pub fn active_array(&self) -> Size {
        self.active_array
    }

    /// Crop of the whole active array for `output`.
    pub fn crop_for(&self, output: Size) -> Result<Rect> {
        let full = Rect {
            x: 0,
            y: 0,
            width: self.active_array.width as i32,
            height: self.active_array.height as i32,
        };
        self.crop_within(full, output)
    }

    /// Crop of `region` (for example a digital zoom window) for `output`.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` for an empty output, an empty region, or a region
    /// that leaves the active array.
    pub fn crop_within(&self, region: Rect, output: Size) -> Result<Rect> {
        if output.is_empty() || region.width <= 0 || region.height <= 0 {
            return Err(Error::bad_value(format!(
                "cannot crop {}x{} for {output}",
                region.width, region.height
            )));
        }
        if region.x < 0
            || region.y < 0
            || (region.x + region.width) as u32 > self.active_array.width
            || (region.y + region.height) as u32 > self.active_array.height
        {
            return Err(Error::bad_value(format!(
                "region {region:?} leaves the {} active array",
                self.active_array
            )));
        }

        let (rw, rh) = (region.width as i64, region.height as i64);
        let (ow, oh) = (output.width as i64, output.height as i64);
        let (width, height) = if ow * rh > oh * rw {
            (rw, rw * oh / ow)
        } else {
            (rh * ow / oh, rh)
        };
        let width = (width & !1).max(2) as i32;
        let height = (height & !1).max(2) as i32;

        Ok(Rect {
            x: region.x + ((region.width - width) / 2 & !1),
            y: region.y + ((region.height - height) / 2 & !1),
            width,
            height,
        })
    }
}
