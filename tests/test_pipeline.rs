// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_capture::{
    buffer::{MemorySource, PixelFormat},
    config::PipelineConfig,
    controls::{AfTrigger, ControlSet},
    encoder::Compressor,
    error::{Error, Result},
    hal::{Camera, ControlId, ControlValue, StreamId},
    pipeline::Pipeline,
    streams::StreamKind,
    virtual_camera::{Trigger, VirtualCamera, VirtualCameraManager},
};
use kanal::Receiver;
use serial_test::serial;
use std::{
    sync::Arc,
    thread::{self, ThreadId},
    time::Duration,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Encodes each frame as a single byte holding the quality it was given.
struct QualityTag;

impl Compressor for QualityTag {
    fn compress(&mut self, _: &[u8], _: u32, _: u32, quality: i32) -> Result<Vec<u8>> {
        Ok(vec![quality as u8])
    }
}

/// Fails once the gate is dropped.
struct Gated {
    gate: Receiver<()>,
}

impl Compressor for Gated {
    fn compress(&mut self, _: &[u8], _: u32, _: u32, quality: i32) -> Result<Vec<u8>> {
        self.gate
            .recv()
            .map_err(|_| Error::Codec("gate closed".to_string()))?;
        Ok(vec![quality as u8])
    }
}

struct Delivered {
    kind: StreamKind,
    sequence: u32,
    data: Vec<u8>,
    thread: ThreadId,
}

fn config() -> PipelineConfig {
    PipelineConfig::new()
        .with_stream(StreamKind::Compressed, 1280, 720)
        .with_stream(StreamKind::Direct, 640, 480)
        .with_controls(ControlSet {
            target_fps: Some(30),
            ..ControlSet::default()
        })
}

fn setup(camera: VirtualCamera) -> (Arc<VirtualCamera>, Pipeline) {
    let camera = Arc::new(camera);
    let manager = Arc::new(VirtualCameraManager::with_camera(camera.clone()));
    let pipeline = Pipeline::new(manager).with_compressor(Box::new(QualityTag));
    (camera, pipeline)
}

fn start(pipeline: &Pipeline) -> Result<(Receiver<Delivered>, Receiver<String>)> {
    let (frame_tx, frame_rx) = kanal::unbounded();
    let (error_tx, error_rx) = kanal::unbounded();
    pipeline.start(
        move |kind, frame| {
            let _ = frame_tx.send(Delivered {
                kind,
                sequence: frame.sequence,
                data: frame.bytes().to_vec(),
                thread: thread::current().id(),
            });
        },
        move |message| {
            let _ = error_tx.send(message.to_string());
        },
    )?;
    Ok((frame_rx, error_rx))
}

fn drain(rx: &Receiver<Delivered>, into: &mut Vec<Delivered>) {
    while let Ok(Some(delivered)) = rx.try_recv() {
        into.push(delivered);
    }
}

fn collect(rx: &Receiver<Delivered>, count: usize) -> Vec<Delivered> {
    (0..count)
        .map(|_| rx.recv_timeout(TIMEOUT).expect("frame"))
        .collect()
}

#[test]
fn test_end_to_end() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    pipeline.initialize(&config())?;
    let (frames, _errors) = start(&pipeline)?;
    assert!(pipeline.is_running());
    assert_eq!(camera.queued_requests(), 6);

    let mut delivered = Vec::new();
    for i in 0..10 {
        if i == 5 {
            pipeline.set_controls(&ControlSet {
                jpeg_quality: Some(60),
                ..ControlSet::default()
            })?;
        }
        assert!(camera.complete_next());

        // Direct frames are delivered before the completion returns.
        drain(&frames, &mut delivered);
        let direct = delivered
            .iter()
            .filter(|d| d.kind == StreamKind::Direct)
            .count();
        assert_eq!(direct, i + 1);
    }
    while delivered
        .iter()
        .filter(|d| d.kind == StreamKind::Compressed)
        .count()
        < 10
    {
        delivered.push(frames.recv_timeout(TIMEOUT).expect("compressed frame"));
    }
    let (direct, compressed): (Vec<_>, Vec<_>) = delivered
        .into_iter()
        .partition(|d| d.kind == StreamKind::Direct);

    let test_thread = thread::current().id();
    assert_eq!(direct.len(), 10);
    for (i, frame) in direct.iter().enumerate() {
        assert_eq!(frame.sequence, i as u32);
        assert_eq!(frame.data.len(), PixelFormat::Bgr888.frame_size(640, 480));
        assert_eq!(frame.data[0], i as u8);
        assert_eq!(frame.thread, test_thread);
    }

    assert!(compressed.iter().all(|d| d.kind == StreamKind::Compressed));
    let sequences: Vec<u32> = compressed.iter().map(|d| d.sequence).collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    for frame in &compressed {
        let expected = if frame.sequence < 5 { 85 } else { 60 };
        assert_eq!(frame.data, vec![expected]);
        assert_ne!(frame.thread, test_thread);
    }

    pipeline.stop();
    assert!(!pipeline.is_running());
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(!camera.is_acquired());
    assert!(!camera.has_event_handler());
    Ok(())
}

#[test]
fn test_stop_is_idempotent() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());

    pipeline.stop();
    pipeline.initialize(&config())?;
    pipeline.stop();
    assert!(camera.is_acquired(), "stop before start must not release");

    start(&pipeline)?;
    pipeline.stop();
    pipeline.stop();
    assert!(!camera.is_acquired());
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(matches!(pipeline.get_controls(), Err(Error::NotInitialized)));
    Ok(())
}

#[test]
fn test_merged_controls_reach_next_request() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    pipeline.initialize(&config())?;
    let _channels = start(&pipeline)?;

    pipeline.set_controls(&ControlSet {
        brightness: Some(0.5),
        contrast: Some(1.2),
        ..ControlSet::default()
    })?;
    pipeline.set_controls(&ControlSet {
        brightness: Some(0.7),
        af_trigger: Some(AfTrigger::Start),
        ..ControlSet::default()
    })?;

    // The first completion picks up the pending set and requeues behind the
    // five requests already queued.
    assert!(camera.complete_next());
    let current = pipeline.get_controls()?;
    assert_eq!(current.brightness, Some(0.7));
    assert_eq!(current.contrast, Some(1.2));
    assert_eq!(current.af_trigger, None);
    assert_eq!(current.target_fps, Some(30));
    assert_eq!(current.jpeg_quality, Some(85));

    for _ in 0..12 {
        assert!(camera.complete_next());
    }

    let history = camera.captured_controls();
    assert_eq!(history.len(), 13);
    assert_eq!(
        history[0].1.get(ControlId::FrameDurationLimits),
        Some(ControlValue::Int64Pair([33_333, 33_333]))
    );

    let (sequence, applied) = &history[6];
    assert_eq!(*sequence, 6);
    assert_eq!(applied.get(ControlId::Brightness), Some(ControlValue::Float(0.7)));
    assert_eq!(applied.get(ControlId::Contrast), Some(ControlValue::Float(1.2)));
    assert!(applied.contains(ControlId::AfTrigger));

    for (_, later) in &history[7..] {
        assert!(!later.contains(ControlId::AfTrigger));
    }
    assert_eq!(pipeline.get_controls()?.af_trigger, None);

    pipeline.stop();
    Ok(())
}

#[test]
fn test_initial_af_trigger_fires_once() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    pipeline.initialize(&config().with_controls(ControlSet {
        target_fps: Some(30),
        af_trigger: Some(AfTrigger::Start),
        ..ControlSet::default()
    }))?;
    let _channels = start(&pipeline)?;

    for _ in 0..12 {
        assert!(camera.complete_next());
    }

    let history = camera.captured_controls();
    let triggered: Vec<u32> = history
        .iter()
        .filter(|(_, applied)| applied.contains(ControlId::AfTrigger))
        .map(|(sequence, _)| *sequence)
        .collect();
    assert_eq!(triggered, vec![0]);

    // Every pooled request still carries the other initial values.
    for (_, applied) in &history[..6] {
        assert!(applied.contains(ControlId::FrameDurationLimits));
    }
    assert_eq!(pipeline.get_controls()?.af_trigger, None);

    pipeline.stop();
    Ok(())
}

#[test]
fn test_start_failure_leaves_nothing_running() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().fail_start().build());
    pipeline.initialize(&config())?;

    let err = start(&pipeline).err().expect("start fails");
    assert!(matches!(err, Error::Start(_)));
    assert!(!pipeline.is_running());
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(!camera.has_event_handler());
    assert!(!camera.is_running());

    pipeline.close();
    assert!(!camera.is_acquired());
    Ok(())
}

#[test]
fn test_allocation_failure() -> Result<()> {
    let (camera, pipeline) =
        setup(VirtualCamera::builder().fail_allocation(StreamId(2)).build());
    pipeline.initialize(&config())?;

    let err = start(&pipeline).err().expect("start fails");
    assert!(matches!(err, Error::Allocation(_)));
    assert_eq!(camera.allocated_buffers(), 0);
    assert!(!camera.has_event_handler());
    Ok(())
}

#[test]
fn test_setup_errors() {
    let camera = Arc::new(VirtualCamera::builder().build());
    camera.acquire().expect("acquire");
    let manager = Arc::new(VirtualCameraManager::with_camera(camera.clone()));
    let err = Pipeline::open(manager.clone(), &config()).err();
    assert!(matches!(err, Some(Error::CameraBusy(_))));
    camera.release();

    let mut missing = config();
    missing.camera = Some("virtual9".to_string());
    let err = Pipeline::open(manager.clone(), &missing).err();
    assert!(matches!(err, Some(Error::CameraNotFound(_))));

    let err = Pipeline::open(manager.clone(), &PipelineConfig::new()).err();
    assert!(matches!(err, Some(Error::InvalidConfiguration(_))));
    assert!(!camera.is_acquired());

    let err = Pipeline::open(Arc::new(VirtualCameraManager::default()), &config()).err();
    assert!(matches!(err, Some(Error::NoCameras)));

    let pipeline = Pipeline::open(manager, &config()).expect("open");
    assert!(matches!(
        pipeline.initialize(&config()),
        Err(Error::AlreadyInitialized)
    ));
}

#[test]
fn test_rejected_configuration_releases_camera() {
    let (camera, pipeline) = setup(VirtualCamera::builder().reject_configuration().build());
    let err = pipeline.initialize(&config()).err();
    assert!(matches!(err, Some(Error::ConfigurationRejected(_))));
    assert!(!camera.is_acquired());
    assert!(!pipeline.is_initialized());
}

#[test]
fn test_cancelled_requests_are_ignored() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    pipeline.initialize(&config())?;
    let (frames, errors) = start(&pipeline)?;

    assert!(camera.cancel_next());
    assert_eq!(camera.queued_requests(), 5);
    assert!(frames.try_recv().ok().flatten().is_none());
    assert!(errors.try_recv().ok().flatten().is_none());

    assert!(camera.complete_next());
    assert_eq!(camera.queued_requests(), 5);
    pipeline.stop();
    Ok(())
}

#[test]
fn test_disconnect_reports_error() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    pipeline.initialize(&config())?;
    let (_frames, errors) = start(&pipeline)?;

    camera.disconnect();
    let message = errors.recv_timeout(TIMEOUT).expect("error callback");
    assert!(message.contains("disconnected"));

    pipeline.stop();
    Ok(())
}

#[test]
fn test_capabilities() -> Result<()> {
    let (_camera, pipeline) = setup(
        VirtualCamera::builder()
            .without_control(ControlId::LensPosition)
            .build(),
    );
    assert!(matches!(pipeline.capabilities(), Err(Error::NotInitialized)));
    pipeline.initialize(&config())?;

    let caps = pipeline.capabilities()?;
    let exposure = caps.exposure_time.expect("exposure range");
    assert_eq!(
        (exposure.min, exposure.max, exposure.default),
        (100.0, 200_000.0, 33_333.0)
    );
    assert!(caps.lens_position.is_none());
    assert_eq!(caps.af_modes, vec!["manual", "auto", "continuous"]);
    assert_eq!(caps.awb_modes.len(), 8);

    let streams = pipeline.streams()?;
    assert_eq!(streams.len(), 3);
    assert_eq!(streams[0].kind, StreamKind::Raw);
    Ok(())
}

#[test]
fn test_free_running_capture() -> Result<()> {
    let (camera, pipeline) = setup(
        VirtualCamera::builder()
            .trigger(Trigger::FreeRunning)
            .build(),
    );
    let config = config().with_controls(ControlSet {
        target_fps: Some(120),
        ..ControlSet::default()
    });
    pipeline.initialize(&config)?;
    let (frames, errors) = start(&pipeline)?;

    let compressed: Vec<u32> = collect(&frames, 20)
        .into_iter()
        .filter(|d| d.kind == StreamKind::Compressed)
        .map(|d| d.sequence)
        .collect();
    assert!(!compressed.is_empty());
    assert!(compressed.windows(2).all(|w| w[0] < w[1]));

    pipeline.stop();
    assert!(errors.try_recv().ok().flatten().is_none());
    assert!(!camera.is_running());
    assert_eq!(camera.allocated_buffers(), 0);
    Ok(())
}

#[test]
fn test_stop_while_encoder_is_saturated() -> Result<()> {
    let camera = Arc::new(
        VirtualCamera::builder()
            .trigger(Trigger::FreeRunning)
            .build(),
    );
    let manager = Arc::new(VirtualCameraManager::with_camera(camera.clone()));
    let (gate_tx, gate_rx) = kanal::unbounded();
    let pipeline = Arc::new(Pipeline::new(manager).with_compressor(Box::new(Gated { gate: gate_rx })));
    pipeline.initialize(
        &config()
            .with_queue_size(1)
            .with_controls(ControlSet {
                target_fps: Some(200),
                ..ControlSet::default()
            }),
    )?;
    let _channels = start(&pipeline)?;

    // One job at the gate, one queued, the completion handler blocked.
    thread::sleep(Duration::from_millis(200));

    let stopper = {
        let pipeline = pipeline.clone();
        thread::spawn(move || pipeline.stop())
    };
    thread::sleep(Duration::from_millis(100));
    drop(gate_tx);
    stopper.join().expect("stop");

    assert!(!pipeline.is_running());
    assert_eq!(camera.allocated_buffers(), 0);
    Ok(())
}

/// Starts `pipeline` with a frame callback that stops it on the first frame
/// of `kind` and reports the thread it ran on.
fn start_stopping_on(pipeline: &Arc<Pipeline>, kind: StreamKind) -> Result<Receiver<ThreadId>> {
    let (tx, rx) = kanal::unbounded();
    let weak = Arc::downgrade(pipeline);
    pipeline.start(
        move |delivered, _| {
            if delivered != kind {
                return;
            }
            if let Some(pipeline) = weak.upgrade() {
                pipeline.stop();
            }
            let _ = tx.send(thread::current().id());
        },
        |_| {},
    )?;
    Ok(rx)
}

fn assert_torn_down(camera: &VirtualCamera, pipeline: &Pipeline) {
    // Waits for any teardown still running on a helper thread.
    pipeline.stop();
    assert!(!pipeline.is_initialized());
    assert!(!camera.is_running());
    assert!(!camera.is_acquired());
    assert!(!camera.has_event_handler());
    assert_eq!(camera.allocated_buffers(), 0);
}

#[test]
fn test_stop_from_direct_frame_callback() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    let pipeline = Arc::new(pipeline);
    pipeline.initialize(&config())?;
    let stopped = start_stopping_on(&pipeline, StreamKind::Direct)?;

    let completion = {
        let camera = camera.clone();
        thread::spawn(move || camera.complete_next())
    };
    let stopped_on = stopped.recv_timeout(TIMEOUT).expect("stop returned");
    assert!(completion.join().expect("completion"));
    assert_ne!(stopped_on, thread::current().id());
    assert!(!pipeline.is_running());

    assert_torn_down(&camera, &pipeline);
    assert!(!camera.complete_next());
    Ok(())
}

#[test]
fn test_stop_from_capture_thread() -> Result<()> {
    let (camera, pipeline) = setup(
        VirtualCamera::builder()
            .trigger(Trigger::FreeRunning)
            .build(),
    );
    let pipeline = Arc::new(pipeline);
    pipeline.initialize(&config().with_controls(ControlSet {
        target_fps: Some(120),
        ..ControlSet::default()
    }))?;
    let stopped = start_stopping_on(&pipeline, StreamKind::Direct)?;

    let stopped_on = stopped.recv_timeout(TIMEOUT).expect("stop returned");
    assert_ne!(stopped_on, thread::current().id());
    assert_torn_down(&camera, &pipeline);

    // The pipeline can be brought up again afterwards.
    pipeline.initialize(&config())?;
    assert!(camera.is_acquired());
    pipeline.close();
    assert!(!camera.is_acquired());
    Ok(())
}

#[test]
fn test_stop_from_encoder_callback() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    let pipeline = Arc::new(pipeline);
    pipeline.initialize(&config())?;
    let stopped = start_stopping_on(&pipeline, StreamKind::Compressed)?;

    assert!(camera.complete_next());
    let stopped_on = stopped.recv_timeout(TIMEOUT).expect("stop returned");
    assert_ne!(stopped_on, thread::current().id());

    assert_torn_down(&camera, &pipeline);
    Ok(())
}

#[test]
fn test_stop_from_error_callback() -> Result<()> {
    let (camera, pipeline) = setup(VirtualCamera::builder().build());
    let pipeline = Arc::new(pipeline);
    pipeline.initialize(&config())?;

    let (tx, rx) = kanal::unbounded();
    let weak = Arc::downgrade(&pipeline);
    pipeline.start(
        |_, _| {},
        move |message| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.stop();
            }
            let _ = tx.send(message.to_string());
        },
    )?;

    let disconnect = {
        let camera = camera.clone();
        thread::spawn(move || camera.disconnect())
    };
    let message = rx.recv_timeout(TIMEOUT).expect("error callback returned");
    assert!(message.contains("disconnected"));
    disconnect.join().expect("disconnect");

    assert_torn_down(&camera, &pipeline);
    Ok(())
}

#[test]
#[ignore = "requires /dev/dma_heap"]
#[serial]
fn test_dma_heap_capture() -> Result<()> {
    let (camera, pipeline) = setup(
        VirtualCamera::builder()
            .memory(MemorySource::DmaHeap)
            .build(),
    );
    pipeline.initialize(&config())?;
    let (frames, _errors) = start(&pipeline)?;

    for _ in 0..3 {
        assert!(camera.complete_next());
    }
    let delivered = collect(&frames, 6);
    assert_eq!(
        delivered
            .iter()
            .filter(|d| d.kind == StreamKind::Direct)
            .count(),
        3
    );

    pipeline.stop();
    assert_eq!(camera.allocated_buffers(), 0);
    Ok(())
}
