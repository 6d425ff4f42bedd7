// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame routing between node threads.
//!
//! The dispatcher makes no routing decisions of its own. After a node is
//! done with a frame it forwards the frame along every outbound edge of
//! that node, in declaration order, skipping destinations the frame's
//! route excludes and nodes that already claimed it. Each frame counts the
//! nodes still holding it; the node that drops the count to zero runs the
//! completion callback.

use super::{
    frame::{Frame, FrameStatus},
    graph::{Graph, NodeId},
    node::{Node, NodeContext, NodeSignal},
};
use crate::error::{Error, Result};
use kanal::{Receiver, Sender};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc, Condvar, Mutex, MutexGuard, PoisonError},
};
use tracing::{error, trace, trace_span};

pub(crate) enum Message {
    Frame(Arc<Frame>),
    Stop,
}

pub struct Dispatcher {
    graph: Graph,
    senders: Vec<Sender<Message>>,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl Dispatcher {
    pub(crate) fn new(graph: Graph, senders: Vec<Sender<Message>>) -> Self {
        Self {
            graph,
            senders,
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Frames submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        *self.lock()
    }

    /// Hands a new frame to the root node.
    pub(crate) fn submit(&self, frame: Arc<Frame>) -> Result<()> {
        let root = self.graph.root();
        frame.claim(root);
        frame.pending.store(1, Ordering::Release);
        *self.lock() += 1;

        if self.send(root, Arc::clone(&frame)) {
            Ok(())
        } else {
            self.finish(&frame);
            Err(Error::invalid_operation(format!(
                "root node of frame {} is not running",
                frame.seq()
            )))
        }
    }

    fn send(&self, node: NodeId, frame: Arc<Frame>) -> bool {
        self.senders
            .get(node.index())
            .is_some_and(|tx| tx.send(Message::Frame(frame)).is_ok())
    }

    /// Forwards `frame` out of `from` and releases `from`'s hold on it.
    pub fn dispatch(&self, frame: &Arc<Frame>, from: NodeId) {
        for edge in self.graph.outbound(from) {
            if !frame.allows(edge.to) || !frame.claim(edge.to) {
                continue;
            }
            frame.mark_traversed(edge.path);
            frame.pending.fetch_add(1, Ordering::AcqRel);
            if self.send(edge.to, Arc::clone(frame)) {
                trace!(seq = frame.seq(), %from, to = %edge.to, path = %edge.path, "frame forwarded");
            } else {
                frame.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if frame.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(frame);
        }
    }

    fn finish(&self, frame: &Frame) {
        trace!(seq = frame.seq(), status = ?frame.status(), "frame complete");
        frame.complete();
        let mut in_flight = self.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks until every submitted frame has completed.
    pub(crate) fn wait_idle(&self) {
        let mut in_flight = self.lock();
        while *in_flight > 0 {
            in_flight = self
                .idle
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn stop_all(&self) {
        for tx in &self.senders {
            let _ = tx.send(Message::Stop);
        }
    }
}

/// Body of a node thread.
pub(crate) fn run_node(
    mut node: Box<dyn Node>,
    ctx: NodeContext,
    rx: Receiver<Message>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Ok(message) = rx.recv() {
        let frame = match message {
            Message::Frame(frame) => frame,
            Message::Stop => break,
        };

        frame.record_visit(ctx.id());
        if ctx.signal().contains(NodeSignal::FLUSHING) {
            frame.set_status(FrameStatus::FLUSHED);
        } else {
            let _span = trace_span!("process", node = ctx.name(), seq = frame.seq()).entered();
            // a panicking node still hands the frame on so it completes
            match panic::catch_unwind(AssertUnwindSafe(|| node.process(&frame, &ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(node = ctx.name(), seq = frame.seq(), "process failed: {e}");
                    frame.set_status(FrameStatus::ERROR);
                }
                Err(_) => {
                    error!(node = ctx.name(), seq = frame.seq(), "process panicked");
                    frame.set_status(FrameStatus::ERROR);
                }
            }
        }
        dispatcher.dispatch(&frame, ctx.id());
    }
    node.teardown();
}
