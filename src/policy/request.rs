// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Request time routing.
//!
//! Decides which node class produces each output of a single request.
//! Requests carrying a reprocess input are served entirely by the capture
//! node; otherwise each output is routed by its format and usage flags.

use super::{stream::{Size, StreamId}, ConfigResult, HwPath, NodeClass, RequestPolicy};
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInput {
    pub frame_number: u64,
    pub outputs: Vec<StreamId>,
    /// Reprocess input stream, when the request feeds a buffer back.
    pub input: Option<StreamId>,
}

impl RequestInput {
    pub fn new(frame_number: u64, outputs: impl IntoIterator<Item = u32>) -> Self {
        Self {
            frame_number,
            outputs: outputs.into_iter().map(StreamId).collect(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: u32) -> Self {
        self.input = Some(StreamId(input));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestRouting {
    pub frame_number: u64,
    /// Producing node class per requested output, in request order.
    pub targets: Vec<(StreamId, NodeClass)>,
    /// Graph nodes the frame must visit.
    pub nodes: BTreeSet<NodeClass>,
    /// Largest output each node class must produce for this request.
    pub max_sizes: BTreeMap<NodeClass, Size>,
    pub reprocess: bool,
    /// Hardware paths the ISP must fill, per sensor.
    pub paths: BTreeSet<(u32, HwPath)>,
}

impl RequestRouting {
    pub fn target(&self, id: StreamId) -> Option<NodeClass> {
        self.targets.iter().find(|(s, _)| *s == id).map(|(_, c)| *c)
    }

    pub fn outputs_for(&self, class: NodeClass) -> impl Iterator<Item = StreamId> + '_ {
        self.targets
            .iter()
            .filter(move |(_, c)| *c == class)
            .map(|(s, _)| *s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRequestPolicy;

impl RequestPolicy for DefaultRequestPolicy {
    fn evaluate(&self, config: &ConfigResult, request: &RequestInput) -> Result<RequestRouting> {
        if request.outputs.is_empty() {
            return Err(Error::bad_value(format!(
                "request {} has no outputs",
                request.frame_number
            )));
        }

        let reprocess = match request.input {
            Some(id) => match config.input.stream(id) {
                Some(s) if !s.is_output() => true,
                _ => {
                    return Err(Error::bad_value(format!(
                        "request {}: {id} is not a configured input stream",
                        request.frame_number
                    )))
                }
            },
            None => false,
        };

        let mut routing = RequestRouting {
            frame_number: request.frame_number,
            reprocess,
            ..Default::default()
        };
        let mut seen = BTreeSet::new();

        for &id in &request.outputs {
            if !seen.insert(id) {
                return Err(Error::bad_value(format!(
                    "request {}: {id} requested twice",
                    request.frame_number
                )));
            }
            let stream = config
                .input
                .stream(id)
                .filter(|s| s.is_output())
                .ok_or_else(|| {
                    Error::bad_value(format!(
                        "request {}: {id} is not a configured output",
                        request.frame_number
                    ))
                })?;

            let class = if reprocess {
                NodeClass::Capture
            } else {
                NodeClass::for_stream(stream)
            };
            routing.targets.push((id, class));
            routing.nodes.insert(class);
            routing
                .max_sizes
                .entry(class)
                .and_modify(|max| {
                    if stream.size.area() > max.area() {
                        *max = stream.size;
                    }
                })
                .or_insert(stream.size);

            if !reprocess {
                for geom in &config.geometry {
                    if let Some(path) = geom.route(id) {
                        routing.paths.insert((geom.sensor_id, path));
                    }
                }
            }
        }

        if !reprocess {
            routing.nodes.insert(NodeClass::Isp);
        }

        trace!(
            frame = request.frame_number,
            nodes = ?routing.nodes,
            reprocess,
            "request routed"
        );
        Ok(routing)
    }
}
