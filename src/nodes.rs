// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Demonstration nodes for the host binary. They do no image processing;
//! they move buffers and side metadata around the way the real ISP,
//! streaming and capture stages do.

use edgefirst_isp::{
    error::{Error, Result},
    pipeline::{Frame, Node, NodeContext},
    policy::Size,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Nanoseconds of history a ZSL capture may reach back into.
const ZSL_WINDOW_NS: u64 = 200_000_000;

/// Acquires a buffer from the pool named `key`, stamps it with the frame
/// sequence number and stores it in the frame.
fn produce(frame: &Frame, ctx: &NodeContext, key: &str) -> Result<()> {
    let handle = ctx.pool(key)?.acquire_handle(ACQUIRE_TIMEOUT)?;
    handle.write_with(|data| {
        if let Some(head) = data.get_mut(..8) {
            head.copy_from_slice(&frame.seq().to_le_bytes());
        }
    })?;
    frame.insert_buffer(key, handle);
    Ok(())
}

/// Root node: fills the hardware path buffers and publishes the frame's
/// exposure metadata.
pub struct IspNode {
    paths: Vec<String>,
    exposure_us: u64,
}

impl IspNode {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            paths,
            exposure_us: 10_000,
        }
    }
}

impl Node for IspNode {
    fn name(&self) -> &str {
        "isp"
    }

    fn configure(&mut self, ctx: &NodeContext) -> Result<()> {
        for path in &self.paths {
            ctx.pool(path)?;
        }
        debug!(paths = ?self.paths, "isp configured");
        Ok(())
    }

    fn process(&mut self, frame: &Frame, ctx: &NodeContext) -> Result<()> {
        for path in self.paths.iter().filter(|p| frame.wants(p)) {
            produce(frame, ctx, path)?;
        }

        // crude auto exposure so consumers see changing metadata
        self.exposure_us = 8_000 + (frame.seq() % 8) * 500;
        if let Some(store) = ctx.store() {
            let mut slot = store.edit(frame.timestamp())?;
            slot.seq = frame.seq();
            slot.source = self.name().to_string();
            slot.set("exposure_us", self.exposure_us);
            slot.set("analog_gain", 1.0 + (frame.seq() % 4) as f64 * 0.25);
            slot.publish();
        }
        Ok(())
    }

    fn teardown(&mut self) {
        debug!("isp stopped");
    }
}

/// Produces the application streams of one node class with a light
/// per-frame crop and scale.
pub struct StreamNode {
    name: String,
    outputs: Vec<(String, Size)>,
    frames: u64,
}

impl StreamNode {
    pub fn new(name: impl Into<String>, outputs: Vec<(String, Size)>) -> Self {
        Self {
            name: name.into(),
            outputs,
            frames: 0,
        }
    }
}

impl Node for StreamNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, ctx: &NodeContext) -> Result<()> {
        for (key, _) in &self.outputs {
            ctx.pool(key)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: &Frame, ctx: &NodeContext) -> Result<()> {
        let exposure = ctx
            .store()
            .and_then(|s| s.query_nearest(frame.timestamp()))
            .and_then(|e| e.value.get("exposure_us").and_then(|v| v.as_u64()));

        for (key, size) in self.outputs.iter().filter(|(k, _)| frame.wants(k)) {
            if let Some(crop) = ctx.crop() {
                let rect = crop.crop_for(*size)?;
                trace!(node = %self.name, %key, ?rect, ?exposure, "crop");
            }
            produce(frame, ctx, key)?;
        }
        self.frames += 1;
        Ok(())
    }

    fn teardown(&mut self) {
        debug!(node = %self.name, frames = self.frames, "stream node stopped");
    }
}

/// Still capture. With ZSL enabled it picks the sharpest (lowest gain)
/// frame from the metadata history preceding the request.
pub struct CaptureNode {
    outputs: Vec<String>,
    zsl: bool,
    captures: u64,
}

impl CaptureNode {
    pub fn new(outputs: Vec<String>, zsl: bool) -> Self {
        Self {
            outputs,
            zsl,
            captures: 0,
        }
    }

    fn pick_zsl(&self, frame: &Frame, ctx: &NodeContext) -> Option<u64> {
        let store = ctx.store()?;
        let start = frame.timestamp().saturating_sub(ZSL_WINDOW_NS);
        let snapshots = store.lock_range(start..=frame.timestamp());
        let best = snapshots
            .iter()
            .filter_map(|s| Some((s.get("analog_gain")?.as_f64()?, s.seq)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, seq)| seq);
        for snapshot in snapshots {
            store.return_info(snapshot);
        }
        best
    }
}

impl Node for CaptureNode {
    fn name(&self) -> &str {
        "capture"
    }

    fn configure(&mut self, ctx: &NodeContext) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(Error::BadValue("capture node has no outputs".to_string()));
        }
        for key in &self.outputs {
            ctx.pool(key)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: &Frame, ctx: &NodeContext) -> Result<()> {
        let source = if self.zsl {
            self.pick_zsl(frame, ctx)
        } else {
            None
        };
        match source {
            Some(seq) => debug!(seq = frame.seq(), zsl_source = seq, "zsl capture"),
            None if self.zsl => warn!(seq = frame.seq(), "no zsl history, capturing live frame"),
            None => {}
        }

        for key in self.outputs.iter().filter(|k| frame.wants(k)) {
            produce(frame, ctx, key)?;
        }
        self.captures += 1;
        Ok(())
    }

    fn teardown(&mut self) {
        debug!(captures = self.captures, "capture node stopped");
    }
}

/// Summary a finished frame reports back to the host loop.
#[derive(Debug, Clone)]
pub struct Completion {
    pub seq: u64,
    pub buffers: usize,
    pub errored: bool,
    pub flushed: bool,
}

impl Completion {
    pub fn of(frame: &Frame) -> Self {
        Self {
            seq: frame.seq(),
            buffers: frame.buffer_keys().len(),
            errored: frame.is_errored(),
            flushed: frame.is_flushed(),
        }
    }
}
