// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_isp::{
    error::{Error, Result as IspResult, StatusCode},
    image::{ImageSpec, SystemAllocator, NV12},
    pipeline::{Edge, Frame, Graph, Node, NodeContext, NodeId, PathId, PipelineBuilder, SideInfo},
    pool::BufferPool,
    store::StoreContext,
};
use serial_test::serial;
use std::{
    error::Error as StdError,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

const WAIT: Duration = Duration::from_secs(2);

/// Test node with configurable failure, delay and teardown tracking.
#[derive(Default)]
struct TestNode {
    name: String,
    fail_seq: Option<u64>,
    panic_seq: Option<u64>,
    fail_configure: bool,
    delay: Duration,
    produce: Option<String>,
    processed: Arc<AtomicUsize>,
    torn_down: Arc<AtomicBool>,
}

impl TestNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl Node for TestNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, ctx: &NodeContext) -> IspResult<()> {
        if self.fail_configure {
            return Err(Error::BadValue(format!("{} refuses to start", self.name)));
        }
        if let Some(key) = &self.produce {
            ctx.pool(key)?;
        }
        Ok(())
    }

    fn process(&mut self, frame: &Frame, ctx: &NodeContext) -> IspResult<()> {
        thread::sleep(self.delay);
        self.processed.fetch_add(1, Ordering::SeqCst);
        if self.panic_seq == Some(frame.seq()) {
            panic!("{} crashed on frame {}", self.name, frame.seq());
        }
        if self.fail_seq == Some(frame.seq()) {
            return Err(Error::Unknown(format!("{} failed", self.name)));
        }
        if let Some(key) = self.produce.as_ref().filter(|k| frame.wants(k)) {
            let handle = ctx.pool(key)?.acquire_handle(Duration::from_millis(100))?;
            frame.insert_buffer(key.as_str(), handle);
        }
        if let Some(store) = ctx.store() {
            let mut slot = store.edit(frame.timestamp())?;
            slot.seq = frame.seq();
            slot.source = self.name.clone();
            slot.publish();
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Done {
    seq: u64,
    visits: Vec<NodeId>,
    traversed: Vec<PathId>,
    errored: bool,
    flushed: bool,
    buffers: Vec<String>,
}

fn report(tx: &mpsc::Sender<Done>) -> impl FnOnce(&Frame) + Send + 'static {
    let tx = tx.clone();
    move |frame: &Frame| {
        let _ = tx.send(Done {
            seq: frame.seq(),
            visits: frame.visits(),
            traversed: frame.traversed(),
            errored: frame.is_errored(),
            flushed: frame.is_flushed(),
            buffers: frame.buffer_keys(),
        });
    }
}

#[test]
#[serial]
fn test_chain_visit_order() -> Result<(), Box<dyn StdError>> {
    let mut builder = PipelineBuilder::new();
    let isp = builder.add_node(TestNode::new("isp"));
    let preview = builder.add_node(TestNode::new("preview"));
    let encoder = builder.add_node(TestNode::new("encoder"));
    builder.set_root(isp);
    let first = builder.add_edge(isp, preview);
    let second = builder.add_edge(preview, encoder);
    let pipeline = builder.build()?;
    assert_eq!(pipeline.node_id("encoder"), Some(encoder));
    assert_eq!(pipeline.graph().len(), 3);

    let (tx, rx) = mpsc::channel();
    pipeline.enqueue(Frame::new(1, ["preview"]).on_complete(report(&tx)))?;
    let done = rx.recv_timeout(WAIT)?;
    assert_eq!(done.seq, 1);
    assert_eq!(done.visits, vec![isp, preview, encoder]);
    assert_eq!(done.traversed, vec![first, second]);
    assert!(!done.errored && !done.flushed);

    pipeline.shutdown();
    assert_eq!(pipeline.in_flight(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_fan_out_completes_once() -> Result<(), Box<dyn StdError>> {
    let sink = TestNode::new("sink");
    let sink_count = Arc::clone(&sink.processed);

    let mut builder = PipelineBuilder::new();
    let isp = builder.add_node(TestNode::new("isp"));
    let a = builder.add_node(TestNode::new("a"));
    let b = builder.add_node(TestNode::new("b"));
    let sink = builder.add_node(sink);
    builder.add_edge(isp, a);
    builder.add_edge(isp, b);
    builder.add_edge(a, sink);
    builder.add_edge(b, sink);
    let pipeline = builder.build()?;

    let (tx, rx) = mpsc::channel();
    for seq in 0..20 {
        pipeline.enqueue(Frame::new(seq, ["out"]).on_complete(report(&tx)))?;
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Ok(done) = rx.recv_timeout(WAIT) {
        assert_eq!(done.visits.len(), 4);
        assert_eq!(done.visits[0], isp);
        assert_eq!(done.visits.iter().filter(|n| **n == sink).count(), 1);
        assert_eq!(done.traversed.len(), 3);
        seen.push(done.seq);
    }
    pipeline.shutdown();

    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    assert_eq!(sink_count.load(Ordering::SeqCst), 20);
    Ok(())
}

#[test]
#[serial]
fn test_route_restriction() -> Result<(), Box<dyn StdError>> {
    let preview_node = TestNode::new("preview");
    let preview_count = Arc::clone(&preview_node.processed);

    let mut builder = PipelineBuilder::new();
    let isp = builder.add_node(TestNode::new("isp"));
    let preview = builder.add_node(preview_node);
    let capture = builder.add_node(TestNode::new("capture"));
    builder.add_edge(isp, preview);
    let to_capture = builder.add_edge(isp, capture);
    let pipeline = builder.build()?;

    let (tx, rx) = mpsc::channel();
    pipeline.enqueue(
        Frame::new(9, ["still"])
            .with_route([capture])
            .on_complete(report(&tx)),
    )?;
    let done = rx.recv_timeout(WAIT)?;
    assert_eq!(done.visits, vec![isp, capture]);
    assert_eq!(done.traversed, vec![to_capture]);
    pipeline.shutdown();
    assert_eq!(preview_count.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
#[serial]
fn test_process_error_marks_frame() -> Result<(), Box<dyn StdError>> {
    let mut bad = TestNode::new("bad");
    bad.fail_seq = Some(2);

    let mut builder = PipelineBuilder::new();
    let isp = builder.add_node(TestNode::new("isp"));
    let bad = builder.add_node(bad);
    let sink = builder.add_node(TestNode::new("sink"));
    builder.add_edge(isp, bad);
    builder.add_edge(bad, sink);
    let pipeline = builder.build()?;

    let (tx, rx) = mpsc::channel();
    for seq in 1..=3 {
        pipeline.enqueue(Frame::new(seq, ["out"]).on_complete(report(&tx)))?;
    }
    let mut results: Vec<Done> = (0..3)
        .map(|_| rx.recv_timeout(WAIT))
        .collect::<Result<_, _>>()?;
    results.sort_by_key(|d| d.seq);

    assert!(!results[0].errored);
    assert!(results[1].errored);
    // errored frames still reach the rest of the graph
    assert_eq!(results[1].visits, vec![isp, bad, sink]);
    assert!(!results[2].errored);
    Ok(())
}

#[test]
#[serial]
fn test_flush_passes_frames_through() -> Result<(), Box<dyn StdError>> {
    let mut slow = TestNode::new("slow");
    slow.delay = Duration::from_millis(30);
    let processed = Arc::clone(&slow.processed);

    let mut builder = PipelineBuilder::new();
    builder.add_node(slow);
    let pipeline = builder.build()?;

    let (tx, rx) = mpsc::channel();
    for seq in 0..5 {
        pipeline.enqueue(Frame::new(seq, ["out"]).on_complete(report(&tx)))?;
    }
    pipeline.flush();
    assert_eq!(pipeline.in_flight(), 0);

    let results: Vec<Done> = (0..5)
        .map(|_| rx.recv_timeout(WAIT))
        .collect::<Result<_, _>>()?;
    let flushed = results.iter().filter(|d| d.flushed).count();
    assert!(flushed >= 4, "only {flushed} frames flushed");
    assert!(processed.load(Ordering::SeqCst) <= 1);

    // flushing is over, frames are processed again
    pipeline.enqueue(Frame::new(10, ["out"]).on_complete(report(&tx)))?;
    let done = rx.recv_timeout(WAIT)?;
    assert_eq!(done.seq, 10);
    assert!(!done.flushed);
    Ok(())
}

#[test]
#[serial]
fn test_enqueue_rejections() -> Result<(), Box<dyn StdError>> {
    let mut builder = PipelineBuilder::new();
    builder.add_node(TestNode::new("isp"));
    let pipeline = builder.build()?;

    let err = pipeline
        .enqueue(Frame::new(1, Vec::<String>::new()))
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);

    pipeline.shutdown();
    pipeline.shutdown();
    let err = pipeline.enqueue(Frame::new(2, ["out"])).unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidOperation);
    Ok(())
}

#[test]
#[serial]
fn test_teardown_on_shutdown_and_failed_build() -> Result<(), Box<dyn StdError>> {
    let isp = TestNode::new("isp");
    let torn_down = Arc::clone(&isp.torn_down);
    let mut builder = PipelineBuilder::new();
    builder.add_node(isp);
    let pipeline = builder.build()?;
    assert!(!torn_down.load(Ordering::SeqCst));
    drop(pipeline);
    assert!(torn_down.load(Ordering::SeqCst));

    let first = TestNode::new("first");
    let first_down = Arc::clone(&first.torn_down);
    let mut broken = TestNode::new("broken");
    broken.fail_configure = true;
    let mut builder = PipelineBuilder::new();
    let a = builder.add_node(first);
    let b = builder.add_node(broken);
    builder.add_edge(a, b);
    let err = builder.build().err().map(|e| e.code());
    assert_eq!(err, Some(StatusCode::BadValue));
    assert!(first_down.load(Ordering::SeqCst));
    Ok(())
}

#[test]
#[serial]
fn test_build_rejects_bad_graphs() -> Result<(), Box<dyn StdError>> {
    assert!(PipelineBuilder::new().build().is_err());

    // duplicate names
    let mut builder = PipelineBuilder::new();
    let a = builder.add_node(TestNode::new("isp"));
    let b = builder.add_node(TestNode::new("isp"));
    builder.add_edge(a, b);
    assert_eq!(builder.build().err().map(|e| e.code()), Some(StatusCode::BadValue));

    // duplicate edge
    let mut builder = PipelineBuilder::new();
    let a = builder.add_node(TestNode::new("isp"));
    let b = builder.add_node(TestNode::new("preview"));
    builder.add_edge(a, b);
    builder.add_edge(a, b);
    assert_eq!(builder.build().err().map(|e| e.code()), Some(StatusCode::BadValue));

    // unreachable node
    let mut builder = PipelineBuilder::new();
    builder.add_node(TestNode::new("isp"));
    builder.add_node(TestNode::new("orphan"));
    assert_eq!(builder.build().err().map(|e| e.code()), Some(StatusCode::BadValue));
    Ok(())
}

#[test]
#[serial]
fn test_graph_validation() -> Result<(), Box<dyn StdError>> {
    let names = || vec!["isp".to_string(), "a".to_string(), "b".to_string()];
    let edge = |path, from, to| Edge {
        path: PathId(path),
        from: NodeId(from),
        to: NodeId(to),
    };

    let graph = Graph::new(names(), NodeId(0), &[edge(0, 0, 1), edge(1, 0, 2), edge(2, 1, 2)])?;
    assert_eq!(graph.reachable(), vec![NodeId(0), NodeId(1), NodeId(2)]);
    assert_eq!(graph.outbound(NodeId(0)).len(), 2);
    assert_eq!(graph.find("b"), Some(NodeId(2)));
    assert_eq!(graph.name(NodeId(1)), Some("a"));

    let bad: [&[Edge]; 5] = [
        // cycle
        &[edge(0, 0, 1), edge(1, 1, 2), edge(2, 2, 1)],
        // self edge
        &[edge(0, 0, 1), edge(1, 1, 2), edge(2, 2, 2)],
        // unknown endpoint
        &[edge(0, 0, 1), edge(1, 1, 7)],
        // repeated path id
        &[edge(0, 0, 1), edge(0, 0, 2)],
        // unreachable node
        &[edge(0, 0, 1)],
    ];
    for edges in bad {
        let err = Graph::new(names(), NodeId(0), edges).unwrap_err();
        assert_eq!(err.code(), StatusCode::BadValue);
    }
    assert!(Graph::new(names(), NodeId(3), &[edge(0, 0, 1), edge(1, 0, 2)]).is_err());
    Ok(())
}

#[test]
#[serial]
fn test_buffers_and_metadata() -> Result<(), Box<dyn StdError>> {
    let spec = ImageSpec::new(320, 240, NV12)?;
    let pool = Arc::new(BufferPool::new("preview", spec, Arc::new(SystemAllocator)));
    pool.init(2, 2)?;
    let store = StoreContext::<SideInfo>::new(8, 2)?;

    let mut isp = TestNode::new("isp");
    isp.produce = Some("preview".to_string());
    let mut builder = PipelineBuilder::new();
    builder.add_node(isp);
    builder.add_pool(Arc::clone(&pool));
    builder.set_store(Arc::clone(&store));
    let pipeline = builder.build()?;
    assert_eq!(store.users(), 1);

    let (tx, rx) = mpsc::channel();
    for seq in 0..4 {
        let frame = Frame::new(seq, ["preview"])
            .with_timestamp(1000 * (seq + 1))
            .on_complete(report(&tx));
        pipeline.enqueue(frame)?;
    }
    for _ in 0..4 {
        let done = rx.recv_timeout(WAIT)?;
        assert_eq!(done.buffers, vec!["preview".to_string()]);
        assert!(!done.errored);
    }
    pipeline.shutdown();

    // completed frames hand their buffers back
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 2);
    assert_eq!(store.users(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_panicking_node_does_not_stall() -> Result<(), Box<dyn StdError>> {
    let mut preview = TestNode::new("preview");
    preview.panic_seq = Some(1);
    let processed = Arc::clone(&preview.processed);

    let mut builder = PipelineBuilder::new();
    let isp = builder.add_node(TestNode::new("isp"));
    let preview = builder.add_node(preview);
    builder.set_root(isp);
    builder.add_edge(isp, preview);
    let pipeline = builder.build()?;

    let (tx, rx) = mpsc::channel();
    pipeline.enqueue(Frame::new(1, ["preview"]).on_complete(report(&tx)))?;
    let done = rx.recv_timeout(WAIT)?;
    assert_eq!(done.seq, 1);
    assert!(done.errored);
    assert_eq!(done.visits, vec![isp, preview]);

    // the node thread survives and keeps serving frames
    pipeline.enqueue(Frame::new(2, ["preview"]).on_complete(report(&tx)))?;
    let done = rx.recv_timeout(WAIT)?;
    assert_eq!(done.seq, 2);
    assert!(!done.errored);
    assert_eq!(processed.load(Ordering::SeqCst), 2);

    pipeline.flush();
    assert_eq!(pipeline.in_flight(), 0);
    pipeline.shutdown();
    Ok(())
}
