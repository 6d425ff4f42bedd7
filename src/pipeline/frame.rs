// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! One request travelling through the pipeline graph.

use super::graph::{NodeId, PathId};
use crate::pool::BufferHandle;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::BitOr,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// Status flags accumulated while a frame is processed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStatus(u32);

impl FrameStatus {
    pub const OK: FrameStatus = FrameStatus(0);
    /// A node failed to process the frame.
    pub const ERROR: FrameStatus = FrameStatus(1 << 0);
    /// The frame passed through while the pipeline was flushing.
    pub const FLUSHED: FrameStatus = FrameStatus(1 << 1);

    pub fn contains(self, other: FrameStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FrameStatus {
    type Output = FrameStatus;

    fn bitor(self, rhs: FrameStatus) -> FrameStatus {
        FrameStatus(self.0 | rhs.0)
    }
}

pub type CompletionFn = Box<dyn FnOnce(&Frame) + Send>;

#[derive(Default)]
struct Progress {
    /// Nodes that claimed the frame, in visit order.
    visits: Vec<NodeId>,
    claimed: BTreeSet<NodeId>,
    traversed: Vec<PathId>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request and the buffers produced for it.
///
/// Frames are shared between node threads once submitted; every field a
/// node may change is behind its own lock.
pub struct Frame {
    seq: u64,
    timestamp: u64,
    outputs: Vec<String>,
    route: Option<BTreeSet<NodeId>>,
    buffers: Mutex<BTreeMap<String, BufferHandle>>,
    progress: Mutex<Progress>,
    status: AtomicU32,
    pub(crate) pending: AtomicUsize,
    on_complete: Mutex<Option<CompletionFn>>,
}

impl Frame {
    /// Creates a frame requesting the buffers named by `outputs`.
    pub fn new<I, S>(seq: u64, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seq,
            timestamp: 0,
            outputs: outputs.into_iter().map(Into::into).collect(),
            route: None,
            buffers: Mutex::new(BTreeMap::new()),
            progress: Mutex::new(Progress::default()),
            status: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            on_complete: Mutex::new(None),
        }
    }

    /// Sensor timestamp in nanoseconds, used to key side metadata.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Restricts the nodes this frame is forwarded to. The root always
    /// runs.
    pub fn with_route(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.route = Some(nodes.into_iter().collect());
        self
    }

    /// Called exactly once, after the last node has handled the frame.
    pub fn on_complete(self, f: impl FnOnce(&Frame) + Send + 'static) -> Self {
        *lock(&self.on_complete) = Some(Box::new(f));
        self
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn wants(&self, key: &str) -> bool {
        self.outputs.iter().any(|o| o == key)
    }

    pub fn allows(&self, node: NodeId) -> bool {
        self.route.as_ref().map_or(true, |r| r.contains(&node))
    }

    /// Stores a buffer under `key`, returning any buffer it replaces.
    pub fn insert_buffer(&self, key: impl Into<String>, buffer: BufferHandle) -> Option<BufferHandle> {
        lock(&self.buffers).insert(key.into(), buffer)
    }

    pub fn take_buffer(&self, key: &str) -> Option<BufferHandle> {
        lock(&self.buffers).remove(key)
    }

    pub fn has_buffer(&self, key: &str) -> bool {
        lock(&self.buffers).contains_key(key)
    }

    /// Runs `f` on the buffer stored under `key`.
    pub fn with_buffer<R>(&self, key: &str, f: impl FnOnce(&BufferHandle) -> R) -> Option<R> {
        lock(&self.buffers).get(key).map(f)
    }

    pub fn buffer_keys(&self) -> Vec<String> {
        lock(&self.buffers).keys().cloned().collect()
    }

    pub fn status(&self) -> FrameStatus {
        FrameStatus(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: FrameStatus) {
        self.status.fetch_or(status.0, Ordering::AcqRel);
    }

    pub fn is_errored(&self) -> bool {
        self.status().contains(FrameStatus::ERROR)
    }

    pub fn is_flushed(&self) -> bool {
        self.status().contains(FrameStatus::FLUSHED)
    }

    /// Nodes that handled the frame, in the order they claimed it.
    pub fn visits(&self) -> Vec<NodeId> {
        lock(&self.progress).visits.clone()
    }

    /// Paths the frame was forwarded along, in dispatch order.
    pub fn traversed(&self) -> Vec<PathId> {
        lock(&self.progress).traversed.clone()
    }

    pub fn has_traversed(&self, path: PathId) -> bool {
        lock(&self.progress).traversed.contains(&path)
    }

    /// Claims the frame for `node`; false if the node already has it.
    pub(crate) fn claim(&self, node: NodeId) -> bool {
        lock(&self.progress).claimed.insert(node)
    }

    pub(crate) fn record_visit(&self, node: NodeId) {
        lock(&self.progress).visits.push(node);
    }

    pub(crate) fn mark_traversed(&self, path: PathId) {
        lock(&self.progress).traversed.push(path);
    }

    pub(crate) fn complete(&self) {
        let callback = lock(&self.on_complete).take();
        if let Some(f) = callback {
            f(self);
        }
        // buffers the callback did not take go back to their pools
        let buffers = std::mem::take(&mut *lock(&self.buffers));
        drop(buffers);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("timestamp", &self.timestamp)
            .field("outputs", &self.outputs)
            .field("status", &self.status())
            .finish()
    }
}
