// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stage 1: feature negotiation.

use super::{stream::OperationMode, FeaturePolicy, StageContext};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Default frame rate when the configuration does not ask for one.
pub const DEFAULT_FPS: u32 = 30;

/// Optional graph nodes a configuration needs besides the ISP root.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeNeeds {
    pub streaming: bool,
    pub capture: bool,
    pub raw_dump: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureSetting {
    /// Zero shutter lag: full resolution frames are kept in a ring so a
    /// still request can pick one captured before the request arrived.
    pub zsl: bool,
    pub nodes: NodeNeeds,
    pub target_fps: u32,
    pub high_speed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFeaturePolicy;

impl FeaturePolicy for DefaultFeaturePolicy {
    fn evaluate(&self, ctx: StageContext<'_>) -> Result<FeatureSetting> {
        let input = ctx.input;

        if input.outputs().next().is_none() {
            return Err(Error::bad_value("configuration has no output streams"));
        }
        if input.streams.iter().filter(|s| !s.is_output()).count() > 1 {
            return Err(Error::bad_value("at most one input stream is supported"));
        }
        let mut ids = BTreeSet::new();
        for stream in &input.streams {
            if stream.size.is_empty() {
                return Err(Error::bad_value(format!("{} has an empty size", stream.id)));
            }
            if !ids.insert(stream.id) {
                return Err(Error::bad_value(format!("{} is declared twice", stream.id)));
            }
        }

        let high_speed = input.mode == OperationMode::HighSpeed;
        let has_input = input.input().is_some();
        let has_still = input.outputs().any(|s| s.is_still());
        if high_speed && (has_still || has_input) {
            return Err(Error::bad_value(
                "still capture and reprocessing are unavailable in high speed mode",
            ));
        }

        let nodes = NodeNeeds {
            streaming: input.outputs().any(|s| !s.is_still() && !s.is_raw()),
            capture: has_still || has_input,
            raw_dump: input.outputs().any(|s| s.is_raw()),
        };

        let zsl = ctx.caps.hw.supports_zsl
            && nodes.capture
            && (input.zsl_requested || has_input);

        let target_fps = match input.target_fps {
            0 => DEFAULT_FPS,
            fps => fps,
        };

        Ok(FeatureSetting {
            zsl,
            nodes,
            target_fps,
            high_speed,
        })
    }
}
