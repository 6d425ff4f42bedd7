// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;
mod nodes;

use args::Args;
use clap::Parser;
use edgefirst_isp::{
    image::{DmaHeapAllocator, ImageAllocator, SystemAllocator, JPEG, NV12},
    pipeline::{CropCalculator, Frame, NodeId, PipelineBuilder, SideInfo},
    policy::{
        ConfigInput, ConfigResult, NodeClass, PlatformCaps, PolicyChain, RequestInput, Size,
        StreamDesc, StreamSource, Usage,
    },
    poller::{Device, DeviceRef, EventMask, PollAction, PollKind, PollOutcome, Poller},
    pool::BufferPool,
    store::StoreContext,
    timestamp_ns,
};
use nodes::{CaptureNode, Completion, IspNode, StreamNode};
use std::{
    collections::BTreeMap,
    error::Error,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

const PREVIEW_STREAM: u32 = 0;
const VIDEO_STREAM: u32 = 1;
const STILL_STREAM: u32 = 2;

/// Read end of the pipe the synthetic sensor writes start-of-frame ticks
/// into, watched by the poller like a V4L2 capture node.
struct SensorEvents {
    name: String,
    fd: OwnedFd,
}

impl Device for SensorEvents {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl SensorEvents {
    fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut ticks = 0;
        loop {
            // SAFETY: buf is valid for writes of its length; the fd is
            // non-blocking so an empty pipe returns EAGAIN.
            let n = unsafe { libc::read(self.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                return ticks;
            }
            ticks += n as usize;
        }
    }
}

fn sensor_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for the two descriptors pipe2 returns.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Writes one byte per frame interval until `running` clears.
fn synthetic_sensor(tx: OwnedFd, fps: u32, running: Arc<AtomicBool>) {
    let interval = Duration::from_secs(1) / fps.max(1);
    let mut next = Instant::now();
    while running.load(Ordering::Acquire) {
        // SAFETY: writing one byte from a valid stack buffer to an owned fd.
        let n = unsafe { libc::write(tx.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("sensor tick write failed: {err}");
                break;
            }
        }
        next += interval;
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }
}

fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose {
            "info,edgefirst_isp=debug"
        } else {
            "info"
        })
    });

    let journald = if args.journald {
        Some(tracing_journald::layer()?)
    } else {
        None
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default())
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn config_input(args: &Args) -> Result<ConfigInput, Box<dyn Error>> {
    let mut streams = Vec::new();
    let preview = args.preview().ok_or("preview size needs width and height")?;
    streams.push(StreamDesc::output(
        PREVIEW_STREAM,
        preview,
        NV12,
        Usage::COMPOSER | Usage::TEXTURE,
    ));
    if let Some(video) = args.video() {
        streams.push(StreamDesc::output(VIDEO_STREAM, video, NV12, Usage::VIDEO_ENCODER));
    }
    if let Some(still) = args.still() {
        streams.push(StreamDesc::output(
            STILL_STREAM,
            still,
            JPEG,
            Usage::STILL | Usage::CPU_READ,
        ));
    }

    Ok(ConfigInput {
        sensors: vec![args.sensor],
        streams,
        target_fps: args.fps,
        zsl_requested: args.zsl,
        ..Default::default()
    })
}

fn create_pools(
    args: &Args,
    config: &ConfigResult,
) -> Result<Vec<Arc<BufferPool>>, Box<dyn Error>> {
    let allocator: Arc<dyn ImageAllocator> = if args.dma {
        Arc::new(DmaHeapAllocator::new()?)
    } else {
        Arc::new(SystemAllocator)
    };

    let mut pools = Vec::with_capacity(config.streams.len());
    for info in &config.streams {
        let max = match args.pool_max {
            0 => info.max_buffers,
            n => n,
        };
        let min = match args.pool_min {
            0 => info.min_buffers,
            n => n,
        }
        .min(max);
        let pool = Arc::new(BufferPool::new(info.name.as_str(), info.spec, Arc::clone(&allocator)));
        pool.init(max, min)?;
        pool.commit()?;
        info!(pool = %info.name, spec = %info.spec, min, max, producer = %info.producer, "buffer pool ready");
        pools.push(pool);
    }
    Ok(pools)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let caps = match &args.caps_path {
        Some(path) => PlatformCaps::from_json_file(path)?,
        None => PlatformCaps::default(),
    };
    let chain = PolicyChain::new(caps);
    let config = chain.evaluate_configuration(&config_input(&args)?)?;
    let sensor_setting = config.sensors.first().ok_or("no sensor configured")?;
    info!(
        zsl = config.feature.zsl,
        fps = config.feature.target_fps,
        mode = %sensor_setting.mode_name,
        "configuration resolved"
    );

    let pools = create_pools(&args, &config)?;
    let store = StoreContext::<SideInfo>::new(args.store_capacity, args.store_backup)?;

    // Pools grouped by the node class that fills them
    let mut produced: BTreeMap<NodeClass, Vec<(String, Size)>> = BTreeMap::new();
    for info in &config.streams {
        let size = Size::new(info.spec.width, info.spec.height);
        produced
            .entry(info.producer)
            .or_default()
            .push((info.name.clone(), size));
    }
    let names = |class: NodeClass| -> Vec<String> {
        produced
            .get(&class)
            .map(|v| v.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    };

    let mut builder = PipelineBuilder::new();
    let mut node_ids: BTreeMap<NodeClass, NodeId> = BTreeMap::new();
    let isp = builder.add_node(IspNode::new(names(NodeClass::Isp)));
    builder.set_root(isp);
    node_ids.insert(NodeClass::Isp, isp);
    if config.feature.nodes.streaming {
        let id = builder.add_node(StreamNode::new(
            "streaming",
            produced.get(&NodeClass::Streaming).cloned().unwrap_or_default(),
        ));
        builder.add_edge(isp, id);
        node_ids.insert(NodeClass::Streaming, id);
    }
    if config.feature.nodes.capture {
        let id = builder.add_node(CaptureNode::new(names(NodeClass::Capture), config.feature.zsl));
        builder.add_edge(isp, id);
        node_ids.insert(NodeClass::Capture, id);
    }
    if config.feature.nodes.raw_dump {
        let id = builder.add_node(StreamNode::new(
            "raw",
            produced.get(&NodeClass::RawDump).cloned().unwrap_or_default(),
        ));
        builder.add_edge(isp, id);
        node_ids.insert(NodeClass::RawDump, id);
    }
    for pool in &pools {
        builder.add_pool(Arc::clone(pool));
    }
    builder
        .set_store(Arc::clone(&store))
        .set_crop(CropCalculator::new(sensor_setting.active_array));
    let pipeline = builder.build()?;

    let (done_tx, done_rx) = kanal::unbounded::<Completion>();
    let (tick_tx, tick_rx) = kanal::unbounded::<PollKind>();

    let (read_fd, write_fd) = sensor_pipe()?;
    let sensor: Arc<SensorEvents> = Arc::new(SensorEvents {
        name: format!("sensor{}", args.sensor),
        fd: read_fd,
    });
    let poller = Poller::new("sensor");
    let events = Arc::clone(&sensor);
    poller.init(
        vec![Arc::clone(&sensor) as DeviceRef],
        Arc::new(move |outcome: &PollOutcome| {
            if outcome.kind == PollKind::Ready && !outcome.active.is_empty() {
                events.drain();
            }
            let _ = tick_tx.send(outcome.kind);
            PollAction::Done
        }),
        EventMask::READABLE | EventMask::PRIORITY,
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let sensor_thread = {
        let running = Arc::clone(&running);
        let fps = config.feature.target_fps;
        thread::Builder::new()
            .name("sensor".to_string())
            .spawn(move || synthetic_sensor(write_fd, fps, running))?
    };

    let span = info_span!("capture", frames = args.frames);
    let _guard = span.enter();
    let frame_timeout = Duration::from_secs(1) / config.feature.target_fps.max(1) * 4;
    let started = Instant::now();
    let mut submitted = 0u64;
    let mut timeouts = 0u64;

    for seq in 1..=args.frames {
        poller.queue_request(seq, Some(frame_timeout), None)?;
        match tick_rx.recv()? {
            PollKind::Ready => {}
            PollKind::Timeout => {
                timeouts += 1;
                warn!(seq, "no start of frame within {frame_timeout:?}");
                continue;
            }
            PollKind::Flushed => break,
            PollKind::Error(errno) => {
                error!(seq, errno, "sensor poll failed");
                break;
            }
        }

        let mut outputs = vec![PREVIEW_STREAM];
        if args.video().is_some() {
            outputs.push(VIDEO_STREAM);
        }
        if args.still().is_some() && args.still_interval > 0 && seq % args.still_interval == 0 {
            outputs.push(STILL_STREAM);
        }
        let routing = match chain.evaluate_request(&config, &RequestInput::new(seq, outputs)) {
            Ok(routing) => routing,
            Err(e) => {
                warn!(seq, "request rejected: {e}");
                continue;
            }
        };

        let mut keys: Vec<String> = routing
            .paths
            .iter()
            .map(|(sensor_id, path)| {
                StreamSource::Hardware {
                    sensor_id: *sensor_id,
                    path: *path,
                }
                .to_string()
            })
            .collect();
        keys.extend(routing.targets.iter().map(|(id, _)| id.to_string()));
        let route = routing.nodes.iter().filter_map(|c| node_ids.get(c).copied());

        let done = done_tx.clone();
        let frame = Frame::new(seq, keys)
            .with_timestamp(timestamp_ns())
            .with_route(route)
            .on_complete(move |frame| {
                let _ = done.send(Completion::of(frame));
            });
        pipeline.enqueue(frame)?;
        submitted += 1;
    }

    pipeline.flush();
    running.store(false, Ordering::Release);
    poller.flush(true, true)?;
    if sensor_thread.join().is_err() {
        warn!("sensor thread panicked");
    }
    pipeline.shutdown();
    drop(done_tx);

    let mut completed = 0u64;
    let mut errored = 0u64;
    let mut flushed = 0u64;
    let mut buffers = 0usize;
    while let Ok(Some(done)) = done_rx.try_recv() {
        completed += 1;
        errored += done.errored as u64;
        flushed += done.flushed as u64;
        buffers += done.buffers;
        debug!(seq = done.seq, buffers = done.buffers, "frame completed");
    }

    let elapsed = started.elapsed();
    info!(
        submitted,
        completed,
        errored,
        flushed,
        timeouts,
        buffers,
        fps = completed as f64 / elapsed.as_secs_f64(),
        metadata_generations = store.generation(),
        "capture finished"
    );
    for pool in &pools {
        let stats = pool.stats();
        debug!(pool = pool.name(), available = stats.available, in_use = stats.in_use, to_alloc = stats.to_alloc, "pool state");
    }
    Ok(())
}
