// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Layered hardware and routing policy.
//!
//! A configuration is resolved by five stages run in a fixed order, each
//! consuming the results of the stages before it:
//!
//! 1. [`feature`]: ZSL and optional graph nodes
//! 2. [`sensor`]: sensor mode and frame rate per physical sensor
//! 3. [`geometry`]: full resolution / resized hardware paths and their sizes
//! 4. [`dma`]: DMA ports, buffer counts and the memory budget
//! 5. [`descriptor`]: stream descriptors used to size buffer pools
//!
//! The first failing stage aborts the evaluation; its error is returned
//! together with the stage that produced it and later stages never run.
//! Each request is then routed by the [`request`] stage against the
//! resulting [`ConfigResult`].
//!
//! Every stage is a trait object so a platform can replace one layer
//! without touching the others.

pub mod caps;
pub mod descriptor;
pub mod dma;
pub mod feature;
pub mod geometry;
pub mod request;
pub mod sensor;
pub mod stream;

pub use caps::{HwLimits, PlatformCaps, SensorCaps, SensorMode};
pub use descriptor::{DefaultDescriptorPolicy, StreamInfo, StreamSource};
pub use dma::{DefaultDmaPolicy, DmaPort, DmaSetting};
pub use feature::{DefaultFeaturePolicy, FeatureSetting, NodeNeeds};
pub use geometry::{BufferGeometry, DefaultGeometryPolicy, PathGeometry};
pub use request::{DefaultRequestPolicy, RequestInput, RequestRouting};
pub use sensor::{DefaultSensorPolicy, SensorSetting};
pub use stream::{ConfigInput, Direction, OperationMode, Size, StreamDesc, StreamId, Usage};

use crate::error::{Error, StatusCode};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{debug, debug_span, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyStage {
    Feature,
    Sensor,
    Geometry,
    Dma,
    Descriptor,
    Request,
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PolicyStage::Feature => "feature",
            PolicyStage::Sensor => "sensor",
            PolicyStage::Geometry => "geometry",
            PolicyStage::Dma => "dma",
            PolicyStage::Descriptor => "descriptor",
            PolicyStage::Request => "request",
        };
        f.write_str(name)
    }
}

/// Failure of one policy stage.
#[derive(Error, Debug)]
#[error("{stage} policy failed: {source}")]
pub struct PolicyError {
    pub stage: PolicyStage,
    #[source]
    pub source: Error,
}

impl PolicyError {
    pub fn stage(&self) -> PolicyStage {
        self.stage
    }

    pub fn code(&self) -> StatusCode {
        self.source.code()
    }
}

/// ISP hardware output path.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HwPath {
    /// Unscaled sensor output.
    Full,
    /// Output of the ISP resizer.
    Resized,
}

impl fmt::Display for HwPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HwPath::Full => f.write_str("full"),
            HwPath::Resized => f.write_str("resized"),
        }
    }
}

/// Class of graph node that can produce a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeClass {
    /// Root node driving the sensor and ISP hardware paths.
    Isp,
    /// Light per-frame post processing for preview and video.
    Streaming,
    /// Heavy still capture and reprocessing.
    Capture,
    /// Passes raw sensor buffers straight to the application.
    RawDump,
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            NodeClass::Isp => "isp",
            NodeClass::Streaming => "streaming",
            NodeClass::Capture => "capture",
            NodeClass::RawDump => "raw",
        };
        f.write_str(name)
    }
}

impl NodeClass {
    /// Node that produces an output stream when no reprocess input is
    /// involved.
    pub fn for_stream(stream: &StreamDesc) -> Self {
        if stream.is_raw() {
            NodeClass::RawDump
        } else if stream.is_still() {
            NodeClass::Capture
        } else {
            NodeClass::Streaming
        }
    }
}

/// Inputs shared by every configuration stage.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub caps: &'a PlatformCaps,
    pub input: &'a ConfigInput,
}

pub trait FeaturePolicy: Send + Sync {
    fn evaluate(&self, ctx: StageContext<'_>) -> crate::Result<FeatureSetting>;
}

pub trait SensorPolicy: Send + Sync {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
    ) -> crate::Result<Vec<SensorSetting>>;
}

pub trait GeometryPolicy: Send + Sync {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        sensors: &[SensorSetting],
    ) -> crate::Result<Vec<BufferGeometry>>;
}

pub trait DmaPolicy: Send + Sync {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        geometry: &[BufferGeometry],
    ) -> crate::Result<Vec<DmaSetting>>;
}

pub trait DescriptorPolicy: Send + Sync {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        geometry: &[BufferGeometry],
        dma: &[DmaSetting],
    ) -> crate::Result<Vec<StreamInfo>>;
}

pub trait RequestPolicy: Send + Sync {
    fn evaluate(
        &self,
        config: &ConfigResult,
        request: &RequestInput,
    ) -> crate::Result<RequestRouting>;
}

/// Everything resolved for one stream configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigResult {
    pub input: ConfigInput,
    pub feature: FeatureSetting,
    pub sensors: Vec<SensorSetting>,
    pub geometry: Vec<BufferGeometry>,
    pub dma: Vec<DmaSetting>,
    pub streams: Vec<StreamInfo>,
}

impl ConfigResult {
    pub fn stream_info(&self, name: &str) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.name == name)
    }
}

fn run_stage<T>(stage: PolicyStage, f: impl FnOnce() -> crate::Result<T>) -> Result<T, PolicyError> {
    let _span = debug_span!("policy", %stage).entered();
    f().map_err(|source| {
        warn!(%stage, "policy stage failed: {source}");
        PolicyError { stage, source }
    })
}

/// Ordered chain of policy stages.
///
/// # Example
///
/// ```
/// use edgefirst_isp::{
///     image::NV12,
///     policy::{ConfigInput, PlatformCaps, PolicyChain, RequestInput, Size, StreamDesc, Usage},
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let chain = PolicyChain::new(PlatformCaps::default());
/// let input = ConfigInput {
///     streams: vec![StreamDesc::output(0, Size::new(1920, 1080), NV12, Usage::COMPOSER)],
///     ..Default::default()
/// };
/// let config = chain.evaluate_configuration(&input)?;
/// let routing = chain.evaluate_request(&config, &RequestInput::new(1, [0]))?;
/// assert_eq!(routing.targets.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct PolicyChain {
    caps: Arc<PlatformCaps>,
    feature: Box<dyn FeaturePolicy>,
    sensor: Box<dyn SensorPolicy>,
    geometry: Box<dyn GeometryPolicy>,
    dma: Box<dyn DmaPolicy>,
    descriptor: Box<dyn DescriptorPolicy>,
    request: Box<dyn RequestPolicy>,
}

impl PolicyChain {
    pub fn new(caps: PlatformCaps) -> Self {
        Self {
            caps: Arc::new(caps),
            feature: Box::new(DefaultFeaturePolicy),
            sensor: Box::new(DefaultSensorPolicy),
            geometry: Box::new(DefaultGeometryPolicy),
            dma: Box::new(DefaultDmaPolicy),
            descriptor: Box::new(DefaultDescriptorPolicy),
            request: Box::new(DefaultRequestPolicy),
        }
    }

    pub fn with_feature_policy(mut self, policy: impl FeaturePolicy + 'static) -> Self {
        self.feature = Box::new(policy);
        self
    }

    pub fn with_sensor_policy(mut self, policy: impl SensorPolicy + 'static) -> Self {
        self.sensor = Box::new(policy);
        self
    }

    pub fn with_geometry_policy(mut self, policy: impl GeometryPolicy + 'static) -> Self {
        self.geometry = Box::new(policy);
        self
    }

    pub fn with_dma_policy(mut self, policy: impl DmaPolicy + 'static) -> Self {
        self.dma = Box::new(policy);
        self
    }

    pub fn with_descriptor_policy(mut self, policy: impl DescriptorPolicy + 'static) -> Self {
        self.descriptor = Box::new(policy);
        self
    }

    pub fn with_request_policy(mut self, policy: impl RequestPolicy + 'static) -> Self {
        self.request = Box::new(policy);
        self
    }

    pub fn caps(&self) -> &PlatformCaps {
        &self.caps
    }

    /// Resolves a stream configuration through all five stages.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage; no later stage runs.
    /// Platform caps that fail [`PlatformCaps::validate`] are reported as
    /// a feature stage `BadValue`.
    pub fn evaluate_configuration(&self, input: &ConfigInput) -> Result<ConfigResult, PolicyError> {
        let ctx = StageContext {
            caps: &self.caps,
            input,
        };

        let feature = run_stage(PolicyStage::Feature, || {
            self.caps.validate()?;
            self.feature.evaluate(ctx)
        })?;
        let sensors = run_stage(PolicyStage::Sensor, || self.sensor.evaluate(ctx, &feature))?;
        let geometry = run_stage(PolicyStage::Geometry, || {
            self.geometry.evaluate(ctx, &feature, &sensors)
        })?;
        let dma = run_stage(PolicyStage::Dma, || {
            self.dma.evaluate(ctx, &feature, &geometry)
        })?;
        let streams = run_stage(PolicyStage::Descriptor, || {
            self.descriptor.evaluate(ctx, &feature, &geometry, &dma)
        })?;

        debug!(
            zsl = feature.zsl,
            sensors = sensors.len(),
            streams = streams.len(),
            "configuration resolved"
        );
        Ok(ConfigResult {
            input: input.clone(),
            feature,
            sensors,
            geometry,
            dma,
            streams,
        })
    }

    /// Decides which node classes must serve one request.
    pub fn evaluate_request(
        &self,
        config: &ConfigResult,
        request: &RequestInput,
    ) -> Result<RequestRouting, PolicyError> {
        run_stage(PolicyStage::Request, || self.request.evaluate(config, request))
    }
}
