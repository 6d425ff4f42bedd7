// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stage 4: DMA ports and buffer budget.

use super::{feature::FeatureSetting, geometry::BufferGeometry, DmaPolicy, HwPath, StageContext};
use crate::{
    error::{Error, Result},
    image::ImageSpec,
};
use tracing::debug;

/// Buffers an ISP path keeps queued before the pool may block.
const MIN_QUEUED: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaPort {
    pub path: HwPath,
    pub spec: ImageSpec,
    pub min_buffers: usize,
    pub max_buffers: usize,
}

impl DmaPort {
    pub fn bytes(&self) -> u64 {
        (self.spec.size() * self.max_buffers) as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DmaSetting {
    pub sensor_id: u32,
    pub ports: Vec<DmaPort>,
    /// 3A statistics output; disabled in high speed mode.
    pub statistics: bool,
    pub total_bytes: u64,
}

impl DmaSetting {
    pub fn port(&self, path: HwPath) -> Option<&DmaPort> {
        self.ports.iter().find(|p| p.path == path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDmaPolicy;

impl DmaPolicy for DefaultDmaPolicy {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        geometry: &[BufferGeometry],
    ) -> Result<Vec<DmaSetting>> {
        let hw = &ctx.caps.hw;
        if hw.base_buffers == 0 {
            return Err(Error::bad_value("base_buffers must be non-zero"));
        }

        let mut settings = Vec::with_capacity(geometry.len());
        let mut budget_used = 0u64;

        for geom in geometry {
            let ports: Vec<DmaPort> = geom
                .paths()
                .map(|p| {
                    let max_buffers = match p.path {
                        HwPath::Full if feature.zsl => hw.base_buffers + hw.zsl_depth,
                        _ => hw.base_buffers,
                    };
                    DmaPort {
                        path: p.path,
                        spec: p.spec,
                        min_buffers: MIN_QUEUED.min(max_buffers),
                        max_buffers,
                    }
                })
                .collect();

            let total_bytes = ports.iter().map(DmaPort::bytes).sum();
            budget_used += total_bytes;
            debug!(sensor = geom.sensor_id, ports = ports.len(), total_bytes, "dma ports resolved");

            settings.push(DmaSetting {
                sensor_id: geom.sensor_id,
                ports,
                statistics: !feature.high_speed,
                total_bytes,
            });
        }

        if budget_used > hw.dma_budget_bytes {
            return Err(Error::no_memory(format!(
                "ISP buffers need {budget_used} bytes, budget is {}",
                hw.dma_budget_bytes
            )));
        }
        Ok(settings)
    }
}
