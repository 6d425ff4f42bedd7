// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_isp::{
    error::{Error, StatusCode},
    image::{JPEG, NV12, RAW10},
    policy::{
        BufferGeometry, ConfigInput, DefaultDmaPolicy, DmaPolicy, DmaSetting, FeatureSetting,
        GeometryPolicy, HwPath, NodeClass, OperationMode, PlatformCaps, PolicyChain, PolicyStage,
        RequestInput, SensorSetting, Size, StageContext, StreamDesc, StreamId, StreamSource,
        Usage,
    },
};
use serial_test::serial;
use std::{
    collections::BTreeSet,
    error::Error as StdError,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const PREVIEW: u32 = 0;
const VIDEO: u32 = 1;
const STILL: u32 = 2;
const REPROCESS: u32 = 3;

fn preview_and_video() -> ConfigInput {
    ConfigInput {
        streams: vec![
            StreamDesc::output(PREVIEW, Size::new(1920, 1080), NV12, Usage::COMPOSER),
            StreamDesc::output(VIDEO, Size::new(3840, 2160), NV12, Usage::VIDEO_ENCODER),
        ],
        ..Default::default()
    }
}

fn camera_app() -> ConfigInput {
    ConfigInput {
        streams: vec![
            StreamDesc::output(PREVIEW, Size::new(1280, 720), NV12, Usage::COMPOSER),
            StreamDesc::output(
                STILL,
                Size::new(3840, 2160),
                JPEG,
                Usage::STILL | Usage::CPU_READ,
            ),
            StreamDesc::input(REPROCESS, Size::new(3840, 2160), NV12),
        ],
        ..Default::default()
    }
}

struct FailingGeometry;

impl GeometryPolicy for FailingGeometry {
    fn evaluate(
        &self,
        _ctx: StageContext<'_>,
        _feature: &FeatureSetting,
        _sensors: &[SensorSetting],
    ) -> edgefirst_isp::Result<Vec<BufferGeometry>> {
        Err(Error::BadValue("no usable path".to_string()))
    }
}

struct CountingDma(Arc<AtomicUsize>);

impl DmaPolicy for CountingDma {
    fn evaluate(
        &self,
        ctx: StageContext<'_>,
        feature: &FeatureSetting,
        geometry: &[BufferGeometry],
    ) -> edgefirst_isp::Result<Vec<DmaSetting>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        DefaultDmaPolicy.evaluate(ctx, feature, geometry)
    }
}

#[test]
#[serial]
fn test_preview_and_video_geometry() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let config = chain.evaluate_configuration(&preview_and_video())?;

    assert!(!config.feature.zsl);
    assert!(config.feature.nodes.streaming);
    assert!(!config.feature.nodes.capture);
    assert_eq!(config.sensors.len(), 1);
    assert_eq!(config.sensors[0].mode_name, "4k30");
    assert_eq!(config.sensors[0].raw_format, RAW10);

    let geom = &config.geometry[0];
    assert_eq!(geom.route(StreamId(PREVIEW)), Some(HwPath::Resized));
    // too wide for the resizer
    assert_eq!(geom.route(StreamId(VIDEO)), Some(HwPath::Full));
    assert_eq!(geom.resized.as_ref().map(|p| p.size), Some(Size::new(1920, 1080)));
    assert_eq!(geom.full.as_ref().map(|p| p.size), Some(Size::new(3840, 2160)));

    let dma = &config.dma[0];
    assert!(dma.statistics);
    let full = dma.port(HwPath::Full).ok_or("no full port")?;
    assert_eq!(full.max_buffers, 4);
    assert_eq!(full.min_buffers, 2);
    assert_eq!(full.bytes(), 7680 * 2160 * 4);
    assert_eq!(dma.total_bytes, 7680 * 2160 * 4 + 3110400 * 4);

    let names: Vec<&str> = config.streams.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["sensor0/full", "sensor0/resized", "stream0", "stream1"]);
    let preview = config.stream_info("stream0").ok_or("no preview info")?;
    assert_eq!(preview.producer, NodeClass::Streaming);
    assert_eq!(
        preview.source,
        StreamSource::App {
            stream_id: StreamId(PREVIEW)
        }
    );
    Ok(())
}

#[test]
#[serial]
fn test_small_preview_uses_resizer_minimum() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let input = ConfigInput {
        streams: vec![
            StreamDesc::output(PREVIEW, Size::new(320, 240), NV12, Usage::TEXTURE),
            StreamDesc::output(VIDEO, Size::new(3840, 2160), NV12, Usage::VIDEO_ENCODER),
        ],
        ..Default::default()
    };
    let config = chain.evaluate_configuration(&input)?;
    // 25% of the 4K sensor output
    let resized = config.geometry[0].resized.as_ref().ok_or("no resized path")?;
    assert_eq!(resized.size, Size::new(960, 540));
    Ok(())
}

#[test]
#[serial]
fn test_configuration_is_deterministic() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let first = chain.evaluate_configuration(&camera_app())?;
    let second = chain.evaluate_configuration(&camera_app())?;
    assert_eq!(first, second);

    let other = PolicyChain::new(PlatformCaps::default());
    assert_eq!(other.evaluate_configuration(&camera_app())?, first);
    Ok(())
}

#[test]
#[serial]
fn test_failing_stage_stops_chain() -> Result<(), Box<dyn StdError>> {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = PolicyChain::new(PlatformCaps::default())
        .with_geometry_policy(FailingGeometry)
        .with_dma_policy(CountingDma(Arc::clone(&calls)));

    let err = chain.evaluate_configuration(&preview_and_video()).unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Geometry);
    assert_eq!(err.code(), StatusCode::BadValue);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(err.to_string().starts_with("geometry policy failed"));

    let chain = PolicyChain::new(PlatformCaps::default())
        .with_dma_policy(CountingDma(Arc::clone(&calls)));
    chain.evaluate_configuration(&preview_and_video())?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
#[serial]
fn test_feature_rejections() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());

    let err = chain
        .evaluate_configuration(&ConfigInput::default())
        .unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Feature);

    let mut input = camera_app();
    input.mode = OperationMode::HighSpeed;
    let err = chain.evaluate_configuration(&input).unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Feature);
    assert_eq!(err.code(), StatusCode::BadValue);

    let mut input = preview_and_video();
    input.streams[1].id = StreamId(PREVIEW);
    let err = chain.evaluate_configuration(&input).unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Feature);

    let mut input = preview_and_video();
    input.sensors = vec![9];
    let err = chain.evaluate_configuration(&input).unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Sensor);
    Ok(())
}

#[test]
#[serial]
fn test_invalid_caps_rejected() -> Result<(), Box<dyn StdError>> {
    let mut caps = PlatformCaps::default();
    caps.hw.width_alignment = 0;
    let err = PolicyChain::new(caps)
        .evaluate_configuration(&preview_and_video())
        .unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Feature);
    assert_eq!(err.code(), StatusCode::BadValue);

    let mut caps = PlatformCaps::default();
    caps.hw.resizer_min_ratio = 0;
    let err = PolicyChain::new(caps)
        .evaluate_configuration(&preview_and_video())
        .unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Feature);

    let mut caps = PlatformCaps::default();
    caps.sensors.clear();
    let err = PolicyChain::new(caps)
        .evaluate_configuration(&preview_and_video())
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);
    Ok(())
}

#[test]
#[serial]
fn test_high_speed_mode() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let input = ConfigInput {
        streams: vec![StreamDesc::output(
            VIDEO,
            Size::new(1280, 720),
            NV12,
            Usage::VIDEO_ENCODER,
        )],
        mode: OperationMode::HighSpeed,
        target_fps: 120,
        ..Default::default()
    };
    let config = chain.evaluate_configuration(&input)?;
    assert!(config.feature.high_speed);
    assert_eq!(config.sensors[0].mode_name, "720p120");
    assert_eq!(config.sensors[0].fps, 120);
    assert!(!config.dma[0].statistics);
    assert!(config.geometry[0].full.is_none());
    Ok(())
}

#[test]
#[serial]
fn test_dma_budget() -> Result<(), Box<dyn StdError>> {
    let mut caps = PlatformCaps::default();
    caps.hw.dma_budget_bytes = 32 * 1024 * 1024;
    let chain = PolicyChain::new(caps);

    let err = chain.evaluate_configuration(&preview_and_video()).unwrap_err();
    assert_eq!(err.stage(), PolicyStage::Dma);
    assert_eq!(err.code(), StatusCode::NoMemory);
    Ok(())
}

#[test]
#[serial]
fn test_zsl_buffers() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let config = chain.evaluate_configuration(&camera_app())?;

    // a reprocess input implies zero shutter lag
    assert!(config.feature.zsl);
    assert!(config.feature.nodes.capture);
    let full = config.stream_info("sensor0/full").ok_or("no full path")?;
    assert_eq!(full.max_buffers, 8);
    assert_eq!(full.producer, NodeClass::Isp);

    let still = config.stream_info("stream2").ok_or("no still info")?;
    assert_eq!(still.max_buffers, 2);
    assert_eq!(still.min_buffers, 1);
    assert_eq!(still.producer, NodeClass::Capture);
    // inputs get no pool
    assert!(config.stream_info("stream3").is_none());

    let mut caps = PlatformCaps::default();
    caps.hw.supports_zsl = false;
    let config = PolicyChain::new(caps).evaluate_configuration(&camera_app())?;
    assert!(!config.feature.zsl);
    Ok(())
}

#[test]
#[serial]
fn test_request_routing() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let config = chain.evaluate_configuration(&camera_app())?;

    let routing = chain.evaluate_request(&config, &RequestInput::new(5, [PREVIEW, STILL]))?;
    assert_eq!(routing.frame_number, 5);
    assert!(!routing.reprocess);
    assert_eq!(routing.target(StreamId(PREVIEW)), Some(NodeClass::Streaming));
    assert_eq!(routing.target(StreamId(STILL)), Some(NodeClass::Capture));
    assert_eq!(
        routing.nodes,
        BTreeSet::from([NodeClass::Isp, NodeClass::Streaming, NodeClass::Capture])
    );
    assert_eq!(
        routing.paths,
        BTreeSet::from([(0, HwPath::Full), (0, HwPath::Resized)])
    );
    assert_eq!(
        routing.max_sizes.get(&NodeClass::Capture),
        Some(&Size::new(3840, 2160))
    );

    let routing = chain.evaluate_request(&config, &RequestInput::new(6, [PREVIEW]))?;
    assert_eq!(routing.nodes, BTreeSet::from([NodeClass::Isp, NodeClass::Streaming]));
    assert_eq!(routing.paths, BTreeSet::from([(0, HwPath::Resized)]));
    Ok(())
}

#[test]
#[serial]
fn test_reprocess_routes_to_capture() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let config = chain.evaluate_configuration(&camera_app())?;

    let request = RequestInput::new(7, [PREVIEW, STILL]).with_input(REPROCESS);
    let routing = chain.evaluate_request(&config, &request)?;
    assert!(routing.reprocess);
    assert_eq!(routing.nodes, BTreeSet::from([NodeClass::Capture]));
    assert_eq!(
        routing.outputs_for(NodeClass::Capture).collect::<Vec<_>>(),
        vec![StreamId(PREVIEW), StreamId(STILL)]
    );
    assert!(routing.paths.is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_request_rejections() -> Result<(), Box<dyn StdError>> {
    let chain = PolicyChain::new(PlatformCaps::default());
    let config = chain.evaluate_configuration(&camera_app())?;

    let bad = [
        RequestInput::new(1, [0u32; 0]),
        RequestInput::new(2, [PREVIEW, PREVIEW]),
        RequestInput::new(3, [9]),
        RequestInput::new(4, [REPROCESS]),
        RequestInput::new(5, [STILL]).with_input(PREVIEW),
    ];
    for request in &bad {
        let err = chain.evaluate_request(&config, request).unwrap_err();
        assert_eq!(err.stage(), PolicyStage::Request);
        assert_eq!(err.code(), StatusCode::BadValue);
    }
    Ok(())
}

#[test]
#[serial]
fn test_caps_from_json() -> Result<(), Box<dyn StdError>> {
    let json = r#"{
        "hw": { "base_buffers": 6, "resizer_max_width": 1920 },
        "sensors": [
            { "id": 1, "name": "ar0144",
              "modes": [ { "name": "800p60", "width": 1280, "height": 800,
                           "max_fps": 60, "bit_depth": 12 } ] }
        ]
    }"#;
    let caps = PlatformCaps::from_json_str(json)?;
    assert_eq!(caps.hw.base_buffers, 6);
    assert_eq!(caps.hw.stride_alignment, 64);
    assert_eq!(caps.sensor(1).map(|s| s.active_array()), Some(Size::new(1280, 800)));
    assert!(caps.sensor(0).is_none());

    let err = PlatformCaps::from_json_str(r#"{ "sensors": [] }"#).unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);
    let err = PlatformCaps::from_json_str("{ not json").unwrap_err();
    assert_eq!(err.code(), StatusCode::BadValue);
    Ok(())
}
