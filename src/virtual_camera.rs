// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Software sensor implementing the hardware boundary.
//!
//! `VirtualCamera` allocates real shareable buffers (memfd or CMA DMA heap),
//! writes a test pattern into them on every capture and reports completions
//! through the same event path a driver would. In [`Trigger::Manual`] mode
//! completions are injected by calling [`VirtualCamera::complete_next`], which
//! makes pipeline behaviour fully deterministic in tests.

use crate::{
    buffer::{MappedBuffer, MemorySource, PixelFormat},
    error::{Error, Result},
    hal::{
        BufferId, Camera, CameraConfiguration, CameraEvent, CameraManager, ConfigurationStatus,
        ControlId, ControlInfo, ControlList, ControlValue, EventHandler, FrameBuffer, Request,
        Size, StreamConfiguration, StreamId, StreamRole,
    },
};
use kanal::{Receiver, Sender};
use std::{
    collections::{BTreeMap, HashMap},
    os::fd::{AsFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Default sensor resolution, matching a 2304x1296 binned mode.
pub const DEFAULT_SENSOR_SIZE: Size = Size::new(2304, 1296);

const DEFAULT_FRAME_DURATION: Duration = Duration::from_micros(33_333);
const MAX_STREAMS: usize = 4;

/// How completions are produced.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Trigger {
    /// Completions are injected with [`VirtualCamera::complete_next`].
    #[default]
    Manual,
    /// A capture thread completes queued requests at the frame rate set by
    /// `FrameDurationLimits`.
    FreeRunning,
}

pub struct VirtualCameraBuilder {
    id: String,
    sensor: Size,
    memory: MemorySource,
    trigger: Trigger,
    controls: BTreeMap<ControlId, ControlInfo>,
    reject_configuration: bool,
    fail_allocation: Option<StreamId>,
    fail_start: bool,
}

impl Default for VirtualCameraBuilder {
    fn default() -> Self {
        let mut controls = BTreeMap::new();
        controls.insert(
            ControlId::ExposureTime,
            ControlInfo {
                min: ControlValue::Int32(100),
                max: ControlValue::Int32(200_000),
                def: ControlValue::Int32(33_333),
            },
        );
        controls.insert(
            ControlId::AnalogueGain,
            ControlInfo {
                min: ControlValue::Float(1.0),
                max: ControlValue::Float(16.0),
                def: ControlValue::Float(1.0),
            },
        );
        controls.insert(
            ControlId::LensPosition,
            ControlInfo {
                min: ControlValue::Float(0.0),
                max: ControlValue::Float(15.0),
                def: ControlValue::Float(1.0),
            },
        );

        Self {
            id: "virtual0".to_string(),
            sensor: DEFAULT_SENSOR_SIZE,
            memory: MemorySource::default(),
            trigger: Trigger::default(),
            controls,
            reject_configuration: false,
            fail_allocation: None,
            fail_start: false,
        }
    }
}

impl VirtualCameraBuilder {
    pub fn id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn sensor_size(mut self, width: u32, height: u32) -> Self {
        self.sensor = Size::new(width, height);
        self
    }

    pub fn memory(mut self, memory: MemorySource) -> Self {
        self.memory = memory;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn control(mut self, id: ControlId, info: ControlInfo) -> Self {
        self.controls.insert(id, info);
        self
    }

    pub fn without_control(mut self, id: ControlId) -> Self {
        self.controls.remove(&id);
        self
    }

    /// Every configuration is reported as invalid.
    pub fn reject_configuration(mut self) -> Self {
        self.reject_configuration = true;
        self
    }

    /// Allocation for the given stream fails.
    pub fn fail_allocation(mut self, stream: StreamId) -> Self {
        self.fail_allocation = Some(stream);
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn build(self) -> VirtualCamera {
        VirtualCamera {
            inner: Arc::new(Inner {
                id: self.id,
                sensor: self.sensor,
                memory: self.memory,
                trigger: self.trigger,
                controls: self.controls,
                reject_configuration: self.reject_configuration,
                fail_allocation: self.fail_allocation,
                fail_start: self.fail_start,
                acquired: AtomicBool::new(false),
                running: AtomicBool::new(false),
                state: Mutex::new(State::default()),
                handler: Mutex::new(None),
                channel: Mutex::new(None),
                capture_thread: Mutex::new(None),
                sequence: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                history: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct ConfiguredStream {
    id: StreamId,
    size: Size,
    format: PixelFormat,
    buffer_count: u32,
    buffers: Vec<BufferId>,
}

struct Slot {
    stream: StreamId,
    format: PixelFormat,
    size: Size,
    _fd: Arc<OwnedFd>,
    writer: MappedBuffer,
}

#[derive(Default)]
struct State {
    streams: Vec<ConfiguredStream>,
    slots: HashMap<BufferId, Slot>,
    next_buffer: u64,
    frame_duration: Option<Duration>,
}

struct Inner {
    id: String,
    sensor: Size,
    memory: MemorySource,
    trigger: Trigger,
    controls: BTreeMap<ControlId, ControlInfo>,
    reject_configuration: bool,
    fail_allocation: Option<StreamId>,
    fail_start: bool,

    acquired: AtomicBool,
    running: AtomicBool,
    state: Mutex<State>,
    handler: Mutex<Option<EventHandler>>,
    channel: Mutex<Option<(Sender<Request>, Receiver<Request>)>>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
    sequence: AtomicU32,
    in_flight: AtomicUsize,
    history: Mutex<Vec<(u32, ControlList)>>,
}

/// Software camera. Cloning is not supported; share it behind an `Arc`.
pub struct VirtualCamera {
    inner: Arc<Inner>,
}

impl VirtualCamera {
    pub fn builder() -> VirtualCameraBuilder {
        VirtualCameraBuilder::default()
    }

    /// Completes the oldest queued request on the calling thread. Returns
    /// `false` if nothing was queued.
    pub fn complete_next(&self) -> bool {
        match self.inner.next_queued() {
            Some(request) => {
                self.inner.capture(request);
                true
            }
            None => false,
        }
    }

    /// Cancels the oldest queued request on the calling thread.
    pub fn cancel_next(&self) -> bool {
        match self.inner.next_queued() {
            Some(mut request) => {
                request.cancel();
                self.inner.deliver(CameraEvent::RequestCompleted(request));
                true
            }
            None => false,
        }
    }

    /// Simulates the device being unplugged.
    pub fn disconnect(&self) {
        self.inner.deliver(CameraEvent::Disconnected);
    }

    pub fn is_acquired(&self) -> bool {
        self.inner.acquired.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn has_event_handler(&self) -> bool {
        self.inner.handler.lock().expect("handler poisoned").is_some()
    }

    /// Number of buffers currently allocated across all streams.
    pub fn allocated_buffers(&self) -> usize {
        self.inner.state.lock().expect("state poisoned").slots.len()
    }

    /// Number of requests queued and not yet completed.
    pub fn queued_requests(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Controls consumed by each captured request, keyed by sequence.
    pub fn captured_controls(&self) -> Vec<(u32, ControlList)> {
        self.inner.history.lock().expect("history poisoned").clone()
    }
}

impl Inner {
    fn next_queued(&self) -> Option<Request> {
        let rx = {
            let channel = self.channel.lock().expect("channel poisoned");
            channel.as_ref()?.1.clone()
        };
        match rx.try_recv() {
            Ok(Some(request)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Some(request)
            }
            _ => None,
        }
    }

    fn deliver(&self, event: CameraEvent) {
        let handler = self.handler.lock().expect("handler poisoned").clone();
        match handler {
            Some(handler) => handler(event),
            None => trace!("no event handler, dropping {:?}", event),
        }
    }

    fn capture(&self, mut request: Request) {
        let controls = request.take_controls();
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);

        {
            let mut state = self.state.lock().expect("state poisoned");
            if let Some(ControlValue::Int64Pair([min, _])) =
                controls.get(ControlId::FrameDurationLimits)
            {
                state.frame_duration = Some(Duration::from_micros(min.max(1) as u64));
            }
            for (_, buffer) in request.buffers() {
                if let Some(slot) = state.slots.get_mut(buffer) {
                    fill_pattern(slot, sequence);
                }
            }
        }

        self.history
            .lock()
            .expect("history poisoned")
            .push((sequence, controls));

        request.complete(sequence, boottime_ns());
        trace!(sequence, cookie = request.cookie(), "virtual capture complete");
        self.deliver(CameraEvent::RequestCompleted(request));
    }

    fn frame_duration(&self) -> Duration {
        self.state
            .lock()
            .expect("state poisoned")
            .frame_duration
            .unwrap_or(DEFAULT_FRAME_DURATION)
    }

    fn default_stream(&self, role: StreamRole) -> StreamConfiguration {
        let (size, pixel_format) = match role {
            StreamRole::Raw => (self.sensor, PixelFormat::Sbggr10),
            StreamRole::StillCapture => (self.sensor, PixelFormat::Yuv420),
            StreamRole::VideoRecording => (Size::new(1920, 1080), PixelFormat::Yuv420),
            StreamRole::Viewfinder => (Size::new(800, 600), PixelFormat::Bgr888),
        };
        StreamConfiguration {
            role,
            size,
            pixel_format,
            buffer_count: 4,
            stream: None,
        }
    }
}

fn fill_pattern(slot: &mut Slot, sequence: u32) {
    let luma = (sequence & 0xff) as u8;
    let data = slot.writer.as_slice_mut();
    match slot.format {
        PixelFormat::Yuv420 => {
            let luma_len = slot.size.width as usize * slot.size.height as usize;
            let (y, uv) = data.split_at_mut(luma_len.min(data.len()));
            y.fill(luma);
            uv.fill(128);
        }
        PixelFormat::Bgr888 | PixelFormat::Sbggr10 => data.fill(luma),
    }
}

fn boottime_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    if unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) } != 0 {
        return 0;
    }
    let secs = u64::try_from(ts.tv_sec).unwrap_or_default();
    let nanos = u64::try_from(ts.tv_nsec).unwrap_or_default();
    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

fn capture_loop(inner: Arc<Inner>, rx: Receiver<Request>) {
    let mut next = Instant::now();
    while inner.running.load(Ordering::Acquire) {
        next += inner.frame_duration();
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }

        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        match rx.try_recv() {
            Ok(Some(request)) => {
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                inner.capture(request);
            }
            Ok(None) => trace!("no request queued, frame dropped"),
            Err(e) => {
                debug!("capture queue closed: {e:?}");
                break;
            }
        }
    }
}

impl Camera for VirtualCamera {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn acquire(&self) -> Result<()> {
        self.inner
            .acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::CameraBusy(self.inner.id.clone()))
    }

    fn release(&self) {
        self.inner.acquired.store(false, Ordering::Release);
    }

    fn generate_configuration(&self, roles: &[StreamRole]) -> Option<CameraConfiguration> {
        let raw_roles = roles.iter().filter(|r| **r == StreamRole::Raw).count();
        if roles.is_empty() || roles.len() > MAX_STREAMS || raw_roles > 1 {
            return None;
        }
        Some(CameraConfiguration {
            streams: roles.iter().map(|r| self.inner.default_stream(*r)).collect(),
        })
    }

    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus {
        if self.inner.reject_configuration || config.is_empty() {
            return ConfigurationStatus::Invalid;
        }

        let sensor = self.inner.sensor;
        let mut status = ConfigurationStatus::Valid;
        for cfg in config.streams.iter_mut() {
            let raw = cfg.role == StreamRole::Raw;
            if raw != (cfg.pixel_format == PixelFormat::Sbggr10) {
                return ConfigurationStatus::Invalid;
            }
            if cfg.buffer_count == 0 {
                return ConfigurationStatus::Invalid;
            }

            let width = cfg.size.width.clamp(2, sensor.width) & !1;
            let height = cfg.size.height.clamp(2, sensor.height) & !1;
            if width != cfg.size.width || height != cfg.size.height {
                cfg.size = Size::new(width, height);
                status = ConfigurationStatus::Adjusted;
            }
        }
        status
    }

    fn configure(&self, config: &mut CameraConfiguration) -> Result<()> {
        if !self.is_acquired() {
            return Err(Error::ConfigurationRejected(format!(
                "camera {} is not acquired",
                self.inner.id
            )));
        }
        if self.validate(config) == ConfigurationStatus::Invalid {
            return Err(Error::ConfigurationRejected(
                "configuration is invalid after validation".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().expect("state poisoned");
        state.streams.clear();
        for (index, cfg) in config.streams.iter_mut().enumerate() {
            let id = StreamId(index as u32);
            cfg.stream = Some(id);
            state.streams.push(ConfiguredStream {
                id,
                size: cfg.size,
                format: cfg.pixel_format,
                buffer_count: cfg.buffer_count,
                buffers: Vec::new(),
            });
            info!(
                "{} stream {} {:?} {} {} x{}",
                self.inner.id, index, cfg.role, cfg.size, cfg.pixel_format, cfg.buffer_count
            );
        }
        Ok(())
    }

    fn allocate(&self, stream: StreamId) -> Result<Vec<FrameBuffer>> {
        if self.inner.fail_allocation == Some(stream) {
            return Err(Error::Allocation(format!(
                "out of memory allocating stream {}",
                stream.0
            )));
        }

        let mut state = self.inner.state.lock().expect("state poisoned");
        let State {
            streams,
            slots,
            next_buffer,
            ..
        } = &mut *state;

        let cfg = streams
            .iter_mut()
            .find(|s| s.id == stream)
            .ok_or_else(|| Error::Allocation(format!("stream {} is not configured", stream.0)))?;
        if !cfg.buffers.is_empty() {
            return Err(Error::Allocation(format!(
                "stream {} is already allocated",
                stream.0
            )));
        }

        let length = cfg.format.frame_size(cfg.size.width, cfg.size.height);
        let mut buffers = Vec::with_capacity(cfg.buffer_count as usize);
        for _ in 0..cfg.buffer_count {
            let fd = self
                .inner
                .memory
                .allocate(length)
                .map_err(|e| Error::Allocation(e.to_string()))?;
            let writer =
                MappedBuffer::map_writable(fd.as_fd(), 0, length).map_err(Error::Mapping)?;
            let fd = Arc::new(fd);

            let id = BufferId(*next_buffer);
            *next_buffer += 1;

            slots.insert(
                id,
                Slot {
                    stream,
                    format: cfg.format,
                    size: cfg.size,
                    _fd: fd.clone(),
                    writer,
                },
            );
            cfg.buffers.push(id);
            buffers.push(FrameBuffer::new(id, fd, 0, length));
        }

        debug!("allocated {} buffers for stream {}", buffers.len(), stream.0);
        Ok(buffers)
    }

    fn free(&self, stream: StreamId) {
        let mut state = self.inner.state.lock().expect("state poisoned");
        state.slots.retain(|_, slot| slot.stream != stream);
        if let Some(cfg) = state.streams.iter_mut().find(|s| s.id == stream) {
            cfg.buffers.clear();
        }
    }

    fn create_request(&self, cookie: u64) -> Option<Request> {
        let state = self.inner.state.lock().expect("state poisoned");
        if state.streams.is_empty() {
            return None;
        }
        Some(Request::new(cookie))
    }

    fn start(&self, controls: &ControlList) -> Result<()> {
        if self.inner.fail_start {
            return Err(Error::Start("sensor did not respond".to_string()));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::Start("camera is already streaming".to_string()));
        }

        if let Some(ControlValue::Int64Pair([min, _])) =
            controls.get(ControlId::FrameDurationLimits)
        {
            let mut state = self.inner.state.lock().expect("state poisoned");
            state.frame_duration = Some(Duration::from_micros(min.max(1) as u64));
        }

        let (tx, rx) = kanal::unbounded();
        *self.inner.channel.lock().expect("channel poisoned") = Some((tx, rx.clone()));

        if self.inner.trigger == Trigger::FreeRunning {
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-capture", self.inner.id))
                .spawn(move || capture_loop(inner, rx))?;
            *self.inner.capture_thread.lock().expect("thread poisoned") = Some(handle);
        }

        info!("{} streaming", self.inner.id);
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let handle = self.inner.capture_thread.lock().expect("thread poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("{} capture thread panicked", self.inner.id);
            }
        }

        // Requests still queued complete as cancelled.
        let channel = self.inner.channel.lock().expect("channel poisoned").take();
        if let Some((_tx, rx)) = channel {
            while let Ok(Some(mut request)) = rx.try_recv() {
                self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                request.cancel();
                self.inner.deliver(CameraEvent::RequestCompleted(request));
            }
        }

        info!("{} stopped", self.inner.id);
    }

    fn queue_request(&self, request: Request) -> Result<()> {
        if !self.is_running() {
            return Err(Error::Queue(format!("camera {} is not streaming", self.inner.id)));
        }
        {
            let state = self.inner.state.lock().expect("state poisoned");
            if let Some((_, buffer)) = request
                .buffers()
                .iter()
                .find(|(_, buffer)| !state.slots.contains_key(buffer))
            {
                return Err(Error::Queue(format!("unknown buffer {}", buffer.0)));
            }
        }

        let channel = self.inner.channel.lock().expect("channel poisoned");
        let (tx, _) = channel
            .as_ref()
            .ok_or_else(|| Error::Queue("capture queue closed".to_string()))?;
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        tx.send(request).map_err(|e| {
            self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            Error::Queue(format!("{e:?}"))
        })
    }

    fn set_event_handler(&self, handler: Option<EventHandler>) {
        *self.inner.handler.lock().expect("handler poisoned") = handler;
    }

    fn control_info(&self, id: ControlId) -> Option<ControlInfo> {
        self.inner.controls.get(&id).copied()
    }
}

/// Camera manager over a fixed list of virtual cameras.
#[derive(Default)]
pub struct VirtualCameraManager {
    cameras: Vec<Arc<VirtualCamera>>,
}

impl VirtualCameraManager {
    pub fn new(cameras: Vec<Arc<VirtualCamera>>) -> Self {
        Self { cameras }
    }

    pub fn with_camera(camera: Arc<VirtualCamera>) -> Self {
        Self::new(vec![camera])
    }
}

impl CameraManager for VirtualCameraManager {
    fn cameras(&self) -> Vec<Arc<dyn Camera>> {
        self.cameras
            .iter()
            .map(|camera| camera.clone() as Arc<dyn Camera>)
            .collect()
    }
}
