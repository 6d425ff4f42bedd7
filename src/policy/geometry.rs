// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stage 3: hardware buffer geometry.
//!
//! Every output is assigned to one of the ISP's two DMA paths. Raw and
//! still outputs always take the full resolution path. Other outputs take
//! the resized path when they fit the resizer, and the resized path is
//! sized for the largest of them. Outputs too large for the resizer fall
//! back to the full resolution path instead of being dropped.

use super::{
    feature::FeatureSetting,
    sensor::SensorSetting,
    stream::{Size, StreamDesc, StreamId},
    GeometryPolicy, HwPath, StageContext,
};
use crate::{
    error::{Error, Result},
    image::{align_up, ImageSpec, NV12},
};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathGeometry {
    pub path: HwPath,
    pub size: Size,
    pub spec: ImageSpec,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferGeometry {
    pub sensor_id: u32,
    pub sensor_size: Size,
    pub full: Option<PathGeometry>,
    pub resized: Option<PathGeometry>,
    /// Hardware path feeding each output stream, in declaration order.
    pub routes: Vec<(StreamId, HwPath)>,
}

impl BufferGeometry {
    pub fn route(&self, id: StreamId) -> Option<HwPath> {
        self.routes.iter().find(|(s, _)| *s == id).map(|(_, p)| *p)
    }

    pub fn path(&self, path: HwPath) -> Option<&PathGeometry> {
        match path {
            HwPath::Full => self.full.as_ref(),
            HwPath::Resized => self.resized.as_ref(),
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathGeometry> {
        self.full.iter().chain(self.resized.iter())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultGeometryPolicy;

/// Zero alignment leaves `value` unchanged.
fn align_down(value: u32, alignment: u32) -> u32 {
    value - value.checked_rem(alignment).unwrap_or(0)
}

fn choose_route(stream: &StreamDesc, limit: &Size) -> HwPath {
    if stream.is_raw() || stream.is_still() || !stream.size.fits_within(limit) {
        HwPath::Full
    } else {
        HwPath::Resized
    }
}

impl GeometryPolicy for DefaultGeometryPolicy {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        sensors: &[SensorSetting],
    ) -> Result<Vec<BufferGeometry>> {
        let hw = &ctx.caps.hw;
        let mut geometry = Vec::with_capacity(sensors.len());

        for sensor in sensors {
            let limit = Size::new(
                align_down(hw.resizer_max_width.min(sensor.size.width), hw.width_alignment),
                align_down(sensor.size.height, hw.height_alignment),
            );

            let routes: Vec<(StreamId, HwPath)> = ctx
                .input
                .outputs()
                .map(|s| (s.id, choose_route(s, &limit)))
                .collect();

            let largest = ctx
                .input
                .outputs()
                .filter(|s| choose_route(s, &limit) == HwPath::Resized)
                .map(|s| s.size)
                .max_by(|a, b| a.area().cmp(&b.area()).then(a.width.cmp(&b.width)));

            let resized = match largest {
                Some(size) => {
                    let ratio = hw.resizer_min_ratio;
                    let min_w = (sensor.size.width * ratio).div_ceil(100);
                    let min_h = (sensor.size.height * ratio).div_ceil(100);
                    let width = align_up(size.width.max(min_w) as usize, hw.width_alignment as usize)
                        as u32;
                    let height =
                        align_up(size.height.max(min_h) as usize, hw.height_alignment as usize)
                            as u32;
                    let size = Size::new(width.min(limit.width), height.min(limit.height));
                    Some(PathGeometry {
                        path: HwPath::Resized,
                        size,
                        spec: ImageSpec::aligned(
                            size.width,
                            size.height,
                            NV12,
                            hw.stride_alignment,
                        )?,
                    })
                }
                None => None,
            };

            let needs_full = feature.zsl || routes.iter().any(|(_, p)| *p == HwPath::Full);
            let full = if needs_full {
                Some(PathGeometry {
                    path: HwPath::Full,
                    size: sensor.size,
                    spec: ImageSpec::aligned(
                        sensor.size.width,
                        sensor.size.height,
                        sensor.raw_format,
                        hw.stride_alignment,
                    )?,
                })
            } else {
                None
            };

            if full.is_none() && resized.is_none() {
                return Err(Error::bad_value(format!(
                    "sensor {} has no hardware path to serve",
                    sensor.sensor_id
                )));
            }

            debug!(
                sensor = sensor.sensor_id,
                full = ?full.as_ref().map(|p| p.size),
                resized = ?resized.as_ref().map(|p| p.size),
                "buffer geometry resolved"
            );
            geometry.push(BufferGeometry {
                sensor_id: sensor.sensor_id,
                sensor_size: sensor.size,
                full,
                resized,
                routes,
            });
        }
        Ok(geometry)
    }
}
