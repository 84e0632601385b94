// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Boundary to the capture hardware abstraction.
//!
//! The sensor/ISP driver stack is an external collaborator: it owns the DMA
//! buffers, negotiates pixel formats and runs the 3A algorithms. The pipeline
//! only talks to it through the [`CameraManager`] and [`Camera`] traits
//! defined here, passing plain values across. Capture requests are moved into
//! the hardware by [`Camera::queue_request`] and handed back by value in a
//! [`CameraEvent::RequestCompleted`] event, so an in-flight request is never
//! reachable from the application side.

use crate::{buffer::PixelFormat, error::Result};
use std::{
    collections::BTreeMap,
    fmt,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

/// Identifies a configured stream on a camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

/// Identifies a hardware buffer, unique across every stream of a camera.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

/// Role hint used by the hardware to generate a default stream
/// configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamRole {
    Raw,
    StillCapture,
    VideoRecording,
    Viewfinder,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One stream entry of a [`CameraConfiguration`].
#[derive(Clone, Debug)]
pub struct StreamConfiguration {
    pub role: StreamRole,
    pub size: Size,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
    /// Assigned by [`Camera::configure`]; `None` until the configuration has
    /// been applied.
    pub stream: Option<StreamId>,
}

/// Draft or applied stream configuration, one entry per requested role and
/// in the same order as the roles passed to
/// [`Camera::generate_configuration`].
#[derive(Clone, Debug, Default)]
pub struct CameraConfiguration {
    pub streams: Vec<StreamConfiguration>,
}

impl CameraConfiguration {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamConfiguration> {
        self.streams.iter()
    }
}

/// Outcome of [`Camera::validate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Valid,
    Adjusted,
    Invalid,
}

/// Controls understood by the capture hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlId {
    AeExposureMode,
    ExposureTime,
    AnalogueGain,
    AfMode,
    AfTrigger,
    LensPosition,
    AwbMode,
    ColourGains,
    Brightness,
    Contrast,
    Saturation,
    Sharpness,
    FrameDurationLimits,
}

/// Value carried by a control across the hardware boundary.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ControlValue {
    Int32(i32),
    Float(f32),
    FloatPair([f32; 2]),
    Int64Pair([i64; 2]),
}

impl ControlValue {
    /// Scalar view of the value, used for capability ranges.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ControlValue::Int32(v) => Some(v as f64),
            ControlValue::Float(v) => Some(v as f64),
            _ => None,
        }
    }
}

/// Sparse list of control values attached to a request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlList(BTreeMap<ControlId, ControlValue>);

impl ControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: ControlId, value: ControlValue) {
        self.0.insert(id, value);
    }

    pub fn get(&self, id: ControlId) -> Option<ControlValue> {
        self.0.get(&id).copied()
    }

    pub fn contains(&self, id: ControlId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    /// Overwrites every entry of `self` that is also present in `other`.
    pub fn merge(&mut self, other: &ControlList) {
        self.0.extend(other.0.iter().map(|(id, value)| (*id, *value)));
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControlId, ControlValue)> + '_ {
        self.0.iter().map(|(id, value)| (*id, *value))
    }
}

/// Hardware-reported limits of a numeric control.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ControlInfo {
    pub min: ControlValue,
    pub max: ControlValue,
    pub def: ControlValue,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Complete,
    Cancelled,
}

/// Metadata reported by the hardware for a completed request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Start of exposure in nanoseconds on the sensor clock.
    pub sensor_timestamp: Option<u64>,
}

/// A reusable capture request binding one buffer per configured stream.
#[derive(Debug)]
pub struct Request {
    cookie: u64,
    status: RequestStatus,
    sequence: u32,
    metadata: Metadata,
    controls: ControlList,
    buffers: Vec<(StreamId, BufferId)>,
}

impl Request {
    pub fn new(cookie: u64) -> Self {
        Self {
            cookie,
            status: RequestStatus::Pending,
            sequence: 0,
            metadata: Metadata::default(),
            controls: ControlList::new(),
            buffers: Vec::new(),
        }
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Controls staged for the next capture of this request.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    /// Binds `buffer` to `stream`, replacing any previous binding.
    pub fn add_buffer(&mut self, stream: StreamId, buffer: BufferId) {
        match self.buffers.iter_mut().find(|(s, _)| *s == stream) {
            Some(entry) => entry.1 = buffer,
            None => self.buffers.push((stream, buffer)),
        }
    }

    pub fn buffers(&self) -> &[(StreamId, BufferId)] {
        &self.buffers
    }

    pub fn buffer(&self, stream: StreamId) -> Option<BufferId> {
        self.buffers
            .iter()
            .find(|(s, _)| *s == stream)
            .map(|(_, b)| *b)
    }

    /// Prepares a completed request to be queued again with the same
    /// buffers. Controls staged after completion are kept.
    pub fn reuse(&mut self) {
        self.status = RequestStatus::Pending;
        self.sequence = 0;
        self.metadata = Metadata::default();
    }

    /// Hardware side: removes the staged controls so they are applied
    /// exactly once.
    pub fn take_controls(&mut self) -> ControlList {
        std::mem::take(&mut self.controls)
    }

    /// Hardware side: marks the request complete with its capture metadata.
    pub fn complete(&mut self, sequence: u32, sensor_timestamp: u64) {
        self.status = RequestStatus::Complete;
        self.sequence = sequence;
        self.metadata.sensor_timestamp = Some(sensor_timestamp);
    }

    /// Hardware side: marks the request cancelled without valid data.
    pub fn cancel(&mut self) {
        self.status = RequestStatus::Cancelled;
    }
}

/// Hardware buffer exported as a file descriptor, either a dma-buf or a
/// memfd. The pipeline only ever maps it read-only.
#[derive(Clone, Debug)]
pub struct FrameBuffer {
    id: BufferId,
    fd: Arc<OwnedFd>,
    offset: usize,
    length: usize,
}

impl FrameBuffer {
    pub fn new(id: BufferId, fd: Arc<OwnedFd>, offset: usize, length: usize) -> Self {
        Self {
            id,
            fd,
            offset,
            length,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// Asynchronous notifications from the hardware.
#[derive(Debug)]
pub enum CameraEvent {
    /// A request finished, either with valid data or cancelled.
    RequestCompleted(Request),
    /// The device went away; the pipeline should be stopped.
    Disconnected,
}

/// Receives [`CameraEvent`]s, potentially on a thread the application does
/// not control.
pub type EventHandler = Arc<dyn Fn(CameraEvent) + Send + Sync>;

/// Enumerates the cameras available on the system.
pub trait CameraManager: Send + Sync {
    fn cameras(&self) -> Vec<Arc<dyn Camera>>;

    fn get(&self, id: &str) -> Option<Arc<dyn Camera>> {
        self.cameras().into_iter().find(|camera| camera.id() == id)
    }
}

/// A single capture device.
pub trait Camera: Send + Sync {
    fn id(&self) -> &str;

    /// Takes exclusive ownership of the device.
    fn acquire(&self) -> Result<()>;

    fn release(&self);

    /// Builds a draft configuration with one entry per role, or `None` if
    /// the roles cannot be satisfied together.
    fn generate_configuration(&self, roles: &[StreamRole]) -> Option<CameraConfiguration>;

    /// Adjusts `config` to what the hardware can do.
    fn validate(&self, config: &mut CameraConfiguration) -> ConfigurationStatus;

    /// Applies a validated configuration and assigns stream ids.
    fn configure(&self, config: &mut CameraConfiguration) -> Result<()>;

    /// Allocates `buffer_count` buffers for a configured stream.
    fn allocate(&self, stream: StreamId) -> Result<Vec<FrameBuffer>>;

    /// Releases the buffers previously allocated for `stream`.
    fn free(&self, stream: StreamId);

    fn create_request(&self, cookie: u64) -> Option<Request>;

    fn start(&self, controls: &ControlList) -> Result<()>;

    fn stop(&self);

    fn queue_request(&self, request: Request) -> Result<()>;

    /// Installs or removes the event handler. After this returns with
    /// `None`, no new event delivery begins.
    fn set_event_handler(&self, handler: Option<EventHandler>);

    fn control_info(&self, id: ControlId) -> Option<ControlInfo>;
}
