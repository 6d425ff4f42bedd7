// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Processing node interface and the collaborators shared with nodes.

use super::{crop::CropCalculator, frame::Frame, graph::NodeId};
use crate::{
    error::{Error, Result},
    pool::BufferPool,
    store::{StoreHandle, TimeWindowedStore},
};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    ops::BitOr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// Signal bits the pipeline raises on every node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeSignal(u32);

impl NodeSignal {
    pub const NONE: NodeSignal = NodeSignal(0);
    /// Frames must be passed through without processing.
    pub const FLUSHING: NodeSignal = NodeSignal(1 << 0);

    pub fn contains(self, other: NodeSignal) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NodeSignal {
    type Output = NodeSignal;

    fn bitor(self, rhs: NodeSignal) -> NodeSignal {
        NodeSignal(self.0 | rhs.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SignalCell(AtomicU32);

impl SignalCell {
    pub(crate) fn get(&self) -> NodeSignal {
        NodeSignal(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn raise(&self, signal: NodeSignal) {
        self.0.fetch_or(signal.0, Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, signal: NodeSignal) {
        self.0.fetch_and(!signal.0, Ordering::AcqRel);
    }
}

/// Transient per-frame metadata nodes publish for their siblings, keyed
/// by frame timestamp in the shared metadata store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SideInfo {
    pub seq: u64,
    /// Name of the node that published the entry.
    pub source: String,
    pub values: Map<String, Value>,
}

impl SideInfo {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Resources a node reaches while configuring and processing.
pub struct NodeContext {
    id: NodeId,
    name: String,
    pools: Arc<BTreeMap<String, Arc<BufferPool>>>,
    store: Option<StoreHandle<SideInfo>>,
    crop: Option<CropCalculator>,
    signal: Arc<SignalCell>,
}

impl NodeContext {
    pub(crate) fn new(
        id: NodeId,
        name: String,
        pools: Arc<BTreeMap<String, Arc<BufferPool>>>,
        store: Option<StoreHandle<SideInfo>>,
        crop: Option<CropCalculator>,
        signal: Arc<SignalCell>,
    ) -> Self {
        Self {
            id,
            name,
            pools,
            store,
            crop,
            signal,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// # Errors
    ///
    /// Returns `BadValue` if no pool named `name` was registered.
    pub fn pool(&self, name: &str) -> Result<&Arc<BufferPool>> {
        self.pools
            .get(name)
            .ok_or_else(|| Error::bad_value(format!("{}: no buffer pool {name}", self.name)))
    }

    pub fn pools(&self) -> impl Iterator<Item = (&str, &Arc<BufferPool>)> {
        self.pools.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn store(&self) -> Option<&TimeWindowedStore<SideInfo>> {
        self.store.as_deref()
    }

    pub fn crop(&self) -> Option<&CropCalculator> {
        self.crop.as_ref()
    }

    pub fn signal(&self) -> NodeSignal {
        self.signal.get()
    }

    pub fn is_flushing(&self) -> bool {
        self.signal().contains(NodeSignal::FLUSHING)
    }

    pub(crate) fn signal_cell(&self) -> Arc<SignalCell> {
        Arc::clone(&self.signal)
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("store", &self.store.is_some())
            .field("signal", &self.signal())
            .finish()
    }
}

/// One stage of the processing graph.
///
/// Each node runs on its own thread and sees frames one at a time, so
/// `process` may keep mutable state without further locking.
pub trait Node: Send {
    fn name(&self) -> &str;

    /// Called once while the pipeline is built, before any frame arrives.
    fn configure(&mut self, _ctx: &NodeContext) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, frame: &Frame, ctx: &NodeContext) -> Result<()>;

    /// Called on the node thread when the pipeline shuts down.
    fn teardown(&mut self) {}
}
