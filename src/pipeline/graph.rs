// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Static pipeline topology.
//!
//! Node and path ids are plain indices. A validated [`Graph`] is acyclic,
//! has one root and every node is reachable from that root.

use crate::error::{Error, Result};
use std::{collections::VecDeque, fmt};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Identifies one registered edge; frames record the paths they took.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathId(pub u32);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "path{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub path: PathId,
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Clone, Debug)]
pub struct Graph {
    names: Vec<String>,
    root: NodeId,
    /// Outbound edges per node, in declaration order.
    outbound: Vec<Vec<Edge>>,
}

impl Graph {
    /// # Errors
    ///
    /// Returns `BadValue` when an edge names an unknown node, an edge or
    /// path id is declared twice, the edges form a cycle, or a node cannot
    /// be reached from `root`.
    pub fn new(names: Vec<String>, root: NodeId, edges: &[Edge]) -> Result<Self> {
        let count = names.len();
        if root.index() >= count {
            return Err(Error::bad_value(format!("root {root} is not a node")));
        }

        let mut outbound: Vec<Vec<Edge>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        for (i, edge) in edges.iter().enumerate() {
            if edge.from.index() >= count || edge.to.index() >= count {
                return Err(Error::bad_value(format!(
                    "edge {} -> {} names an unknown node",
                    edge.from, edge.to
                )));
            }
            if edge.from == edge.to {
                return Err(Error::bad_value(format!("{} has an edge to itself", edge.from)));
            }
            if edges[..i]
                .iter()
                .any(|e| e.path == edge.path || (e.from == edge.from && e.to == edge.to))
            {
                return Err(Error::bad_value(format!(
                    "edge {} -> {} ({}) declared twice",
                    edge.from, edge.to, edge.path
                )));
            }
            outbound[edge.from.index()].push(*edge);
            in_degree[edge.to.index()] += 1;
        }

        // Kahn's algorithm; nodes left over sit on a cycle.
        let mut queue: VecDeque<usize> = (0..count).filter(|&n| in_degree[n] == 0).collect();
        let mut sorted = 0;
        while let Some(n) = queue.pop_front() {
            sorted += 1;
            for edge in &outbound[n] {
                in_degree[edge.to.index()] -= 1;
                if in_degree[edge.to.index()] == 0 {
                    queue.push_back(edge.to.index());
                }
            }
        }
        if sorted != count {
            return Err(Error::bad_value("pipeline graph contains a cycle"));
        }

        let graph = Self {
            names,
            root,
            outbound,
        };
        let reachable = graph.reachable();
        if reachable.len() != count {
            let orphan = (0..count)
                .find(|n| !reachable.iter().any(|r| r.index() == *n))
                .unwrap_or_default();
            return Err(Error::bad_value(format!(
                "{} is not reachable from the root",
                graph.names[orphan]
            )));
        }
        Ok(graph)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.names.get(node.index()).map(String::as_str)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| NodeId(i as u32))
    }

    /// Outbound edges of `node`; empty for leaves and unknown ids.
    pub fn outbound(&self, node: NodeId) -> &[Edge] {
        self.outbound
            .get(node.index())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.outbound.iter().flatten()
    }

    /// Nodes reachable from the root in breadth first, edge declaration
    /// order, root first.
    pub fn reachable(&self) -> Vec<NodeId> {
        let mut seen = vec![false; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());
        let mut queue = VecDeque::from([self.root]);
        seen[self.root.index()] = true;
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for edge in self.outbound(node) {
                if !seen[edge.to.index()] {
                    seen[edge.to.index()] = true;
                    queue.push_back(edge.to);
                }
            }
        }
        order
    }
}
