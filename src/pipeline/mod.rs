// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Graph of processing nodes and the frames travelling through it.
//!
//! A [`PipelineBuilder`] collects nodes and edges, validates the topology
//! and starts one thread per node. Frames enter at the root with
//! [`Pipeline::enqueue`] and are forwarded along the registered edges until
//! no node holds them, at which point their completion callback runs.
//!
//! # Example
//!
//! ```
//! use edgefirst_isp::pipeline::{Frame, Node, NodeContext, PipelineBuilder};
//! use std::sync::mpsc;
//!
//! struct Pass(&'static str);
//!
//! impl Node for Pass {
//!     fn name(&self) -> &str {
//!         self.0
//!     }
//!
//!     fn process(&mut self, _frame: &Frame, _ctx: &NodeContext) -> edgefirst_isp::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = PipelineBuilder::new();
//! let isp = builder.add_node(Pass("isp"));
//! let preview = builder.add_node(Pass("preview"));
//! builder.set_root(isp);
//! builder.add_edge(isp, preview);
//! let pipeline = builder.build()?;
//!
//! let (tx, rx) = mpsc::channel();
//! pipeline.enqueue(Frame::new(1, ["preview"]).on_complete(move |f| {
//!     let _ = tx.send(f.visits().len());
//! }))?;
//! assert_eq!(rx.recv()?, 2);
//! pipeline.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod crop;
pub mod dispatcher;
pub mod frame;
pub mod graph;
pub mod node;

pub use crop::CropCalculator;
pub use dispatcher::Dispatcher;
pub use frame::{CompletionFn, Frame, FrameStatus};
pub use graph::{Edge, Graph, NodeId, PathId};
pub use node::{Node, NodeContext, NodeSignal, SideInfo};

use crate::{
    error::{Error, Result},
    pool::BufferPool,
    store::StoreContext,
};
use dispatcher::{run_node, Message};
use node::SignalCell;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, warn};

#[derive(Default)]
pub struct PipelineBuilder {
    nodes: Vec<Box<dyn Node>>,
    edges: Vec<Edge>,
    root: Option<NodeId>,
    pools: BTreeMap<String, Arc<BufferPool>>,
    store: Option<Arc<StoreContext<SideInfo>>>,
    crop: Option<CropCalculator>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Node + 'static) -> NodeId {
        self.nodes.push(Box::new(node));
        NodeId(self.nodes.len() as u32 - 1)
    }

    /// Designates the node every frame enters at. Defaults to the first
    /// node added.
    pub fn set_root(&mut self, node: NodeId) -> &mut Self {
        self.root = Some(node);
        self
    }

    /// Registers an edge; frames are forwarded along a node's edges in the
    /// order they were added.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> PathId {
        let path = PathId(self.edges.len() as u32);
        self.edges.push(Edge { path, from, to });
        path
    }

    /// Shares `pool` with every node under its name.
    pub fn add_pool(&mut self, pool: Arc<BufferPool>) -> &mut Self {
        self.pools.insert(pool.name().to_string(), pool);
        self
    }

    /// Attaches every node to the metadata store under its node name.
    pub fn set_store(&mut self, store: Arc<StoreContext<SideInfo>>) -> &mut Self {
        self.store = Some(store);
        self
    }

    pub fn set_crop(&mut self, crop: CropCalculator) -> &mut Self {
        self.crop = Some(crop);
        self
    }

    /// Validates the graph, configures every node and starts the node
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` for an empty or invalid graph, the error of the
    /// first node whose `configure` fails, or `Io` if a thread cannot be
    /// spawned.
    pub fn build(self) -> Result<Pipeline> {
        if self.nodes.is_empty() {
            return Err(Error::bad_value("pipeline has no nodes"));
        }
        let names: Vec<String> = self.nodes.iter().map(|n| n.name().to_string()).collect();
        if let Some(dup) = names
            .iter()
            .enumerate()
            .find_map(|(i, n)| names[..i].contains(n).then_some(n))
        {
            return Err(Error::bad_value(format!("node name {dup} is used twice")));
        }
        let graph = Graph::new(names, self.root.unwrap_or(NodeId(0)), &self.edges)?;

        let pools = Arc::new(self.pools);
        let mut contexts = Vec::with_capacity(self.nodes.len());
        let mut nodes = self.nodes;
        for i in 0..nodes.len() {
            let id = NodeId(i as u32);
            let configured = self
                .store
                .as_ref()
                .map(|store| store.attach(nodes[i].name()))
                .transpose()
                .and_then(|store| {
                    let ctx = NodeContext::new(
                        id,
                        nodes[i].name().to_string(),
                        Arc::clone(&pools),
                        store,
                        self.crop,
                        Arc::new(SignalCell::default()),
                    );
                    nodes[i].configure(&ctx).map(|_| ctx)
                });
            match configured {
                Ok(ctx) => {
                    debug!(node = nodes[i].name(), %id, "node configured");
                    contexts.push(ctx);
                }
                Err(e) => {
                    warn!(node = nodes[i].name(), "configure failed: {e}");
                    nodes[..i].iter_mut().for_each(|n| n.teardown());
                    return Err(e);
                }
            }
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..nodes.len()).map(|_| kanal::unbounded::<Message>()).unzip();
        let signals: Vec<Arc<SignalCell>> = contexts.iter().map(|c| c.signal_cell()).collect();
        let dispatcher = Arc::new(Dispatcher::new(graph, senders));

        let mut threads = Vec::with_capacity(nodes.len());
        for ((node, ctx), rx) in nodes.into_iter().zip(contexts).zip(receivers) {
            let dispatcher_ = Arc::clone(&dispatcher);
            let spawned = thread::Builder::new()
                .name(format!("node-{}", ctx.name()))
                .spawn(move || run_node(node, ctx, rx, dispatcher_));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    dispatcher.stop_all();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        debug!(nodes = threads.len(), "pipeline started");
        Ok(Pipeline {
            dispatcher,
            signals,
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Running pipeline.
pub struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    signals: Vec<Arc<SignalCell>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Pipeline {
    /// Submits `frame` at the root node.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` for a frame that requests no outputs and
    /// `InvalidOperation` once the pipeline is shut down.
    pub fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::invalid_operation("pipeline is shut down"));
        }
        if frame.outputs().is_empty() {
            return Err(Error::bad_value(format!("frame {} requests no outputs", frame.seq())));
        }
        self.dispatcher.submit(Arc::new(frame))
    }

    /// Passes every in-flight frame through without processing and waits
    /// for all of them to complete.
    pub fn flush(&self) {
        for signal in &self.signals {
            signal.raise(NodeSignal::FLUSHING);
        }
        self.dispatcher.wait_idle();
        for signal in &self.signals {
            signal.clear(NodeSignal::FLUSHING);
        }
        debug!("pipeline flushed");
    }

    /// Waits for in-flight frames, stops every node thread and runs each
    /// node's teardown. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.wait_idle();
        self.dispatcher.stop_all();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            if handle.join().is_err() {
                warn!("node thread panicked");
            }
        }
        debug!("pipeline stopped");
    }

    pub fn graph(&self) -> &Graph {
        self.dispatcher.graph()
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.graph().find(name)
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
