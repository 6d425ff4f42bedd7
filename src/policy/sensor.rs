// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stage 2: sensor mode selection.

use super::{
    caps::{SensorCaps, SensorMode},
    feature::FeatureSetting,
    stream::Size,
    SensorPolicy, StageContext,
};
use crate::{
    error::{Error, Result},
    image::{FourCC, RAW10, RAW12},
};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorSetting {
    pub sensor_id: u32,
    pub mode_index: usize,
    pub mode_name: String,
    pub size: Size,
    pub fps: u32,
    pub bit_depth: u8,
    pub raw_format: FourCC,
    /// Full active array, the reference for crop regions.
    pub active_array: Size,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSensorPolicy;

/// Smallest mode that covers `required` at `fps`, or the largest mode
/// reaching `fps` when none covers it.
fn select_mode(sensor: &SensorCaps, required: Size, fps: u32) -> Option<(usize, &SensorMode)> {
    let candidates: Vec<(usize, &SensorMode)> = sensor
        .modes
        .iter()
        .enumerate()
        .filter(|(_, m)| m.max_fps >= fps)
        .collect();

    candidates
        .iter()
        .copied()
        .filter(|(_, m)| required.fits_within(&m.size()))
        .min_by(|(ia, a), (ib, b)| {
            a.size()
                .area()
                .cmp(&b.size().area())
                .then(b.max_fps.cmp(&a.max_fps))
                .then(ia.cmp(ib))
        })
        .or_else(|| {
            candidates.iter().copied().max_by(|(ia, a), (ib, b)| {
                a.size().area().cmp(&b.size().area()).then(ib.cmp(ia))
            })
        })
}

fn raw_format(bit_depth: u8) -> Result<FourCC> {
    match bit_depth {
        10 => Ok(RAW10),
        12 => Ok(RAW12),
        other => Err(Error::bad_value(format!("unsupported sensor bit depth {other}"))),
    }
}

impl SensorPolicy for DefaultSensorPolicy {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
    ) -> Result<Vec<SensorSetting>> {
        let ids = match ctx.input.sensors.as_slice() {
            [] => vec![ctx
                .caps
                .sensors
                .first()
                .map(|s| s.id)
                .ok_or_else(|| Error::bad_value("platform has no sensors"))?],
            ids => ids.to_vec(),
        };

        let required = ctx.input.streams.iter().fold(Size::default(), |acc, s| {
            Size::new(acc.width.max(s.size.width), acc.height.max(s.size.height))
        });

        let mut settings = Vec::with_capacity(ids.len());
        for id in ids {
            if settings.iter().any(|s: &SensorSetting| s.sensor_id == id) {
                return Err(Error::bad_value(format!("sensor {id} selected twice")));
            }
            let sensor = ctx
                .caps
                .sensor(id)
                .ok_or_else(|| Error::bad_value(format!("unknown sensor {id}")))?;
            let (mode_index, mode) =
                select_mode(sensor, required, feature.target_fps).ok_or_else(|| {
                    Error::bad_value(format!(
                        "sensor {id} has no mode reaching {} fps",
                        feature.target_fps
                    ))
                })?;

            debug!(sensor = id, mode = %mode.name, %required, "sensor mode selected");
            settings.push(SensorSetting {
                sensor_id: id,
                mode_index,
                mode_name: mode.name.clone(),
                size: mode.size(),
                fps: feature.target_fps,
                bit_depth: mode.bit_depth,
                raw_format: raw_format(mode.bit_depth)?,
                active_array: sensor.active_array(),
            });
        }
        Ok(settings)
    }
}
