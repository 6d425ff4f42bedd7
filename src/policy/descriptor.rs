// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stage 5: stream descriptors.
//!
//! Produces one [`StreamInfo`] per buffer pool the pipeline needs: one for
//! each hardware DMA port and one for each application output stream.

use super::{
    dma::DmaSetting, feature::FeatureSetting, geometry::BufferGeometry, stream::StreamId,
    DescriptorPolicy, HwPath, NodeClass, StageContext,
};
use crate::{
    error::{Error, Result},
    image::ImageSpec,
};
use std::fmt;

/// Buffers kept for a still stream; captures are serialized.
const STILL_BUFFERS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamSource {
    /// Written by the ISP into one of its DMA paths.
    Hardware { sensor_id: u32, path: HwPath },
    /// Handed to the application for one of its output streams.
    App { stream_id: StreamId },
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamSource::Hardware { sensor_id, path } => write!(f, "sensor{sensor_id}/{path}"),
            StreamSource::App { stream_id } => write!(f, "{stream_id}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Unique name, used for the buffer pool of this stream.
    pub name: String,
    pub source: StreamSource,
    pub spec: ImageSpec,
    pub min_buffers: usize,
    pub max_buffers: usize,
    pub producer: NodeClass,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDescriptorPolicy;

impl DescriptorPolicy for DefaultDescriptorPolicy {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        _feature: &FeatureSetting,
        geometry: &[BufferGeometry],
        dma: &[DmaSetting],
    ) -> Result<Vec<StreamInfo>> {
        let hw = &ctx.caps.hw;
        let mut streams = Vec::new();

        for geom in geometry {
            let setting = dma
                .iter()
                .find(|d| d.sensor_id == geom.sensor_id)
                .ok_or_else(|| {
                    Error::bad_value(format!("sensor {} has no DMA setting", geom.sensor_id))
                })?;
            for port in &setting.ports {
                let source = StreamSource::Hardware {
                    sensor_id: geom.sensor_id,
                    path: port.path,
                };
                streams.push(StreamInfo {
                    name: source.to_string(),
                    source,
                    spec: port.spec,
                    min_buffers: port.min_buffers,
                    max_buffers: port.max_buffers,
                    producer: NodeClass::Isp,
                });
            }
        }

        for stream in ctx.input.outputs() {
            let max_buffers = if stream.is_still() {
                STILL_BUFFERS
            } else {
                hw.base_buffers
            };
            let source = StreamSource::App {
                stream_id: stream.id,
            };
            streams.push(StreamInfo {
                name: source.to_string(),
                source,
                spec: ImageSpec::aligned(
                    stream.size.width,
                    stream.size.height,
                    stream.format,
                    hw.stride_alignment,
                )?,
                min_buffers: 1,
                max_buffers,
                producer: NodeClass::for_stream(stream),
            });
        }
        Ok(streams)
    }
}
