// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Stream negotiation, buffer allocation and the capture request pool.

use crate::{
    buffer::{MappedBuffer, PixelFormat},
    error::{Error, Result},
    hal::{
        BufferId, Camera, ConfigurationStatus, FrameBuffer, Request, Size, StreamId, StreamRole,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Buffers per stream, and therefore capture requests in the pool. Six keeps
/// the sensor fed through one full encoder round-trip.
pub const BUFFER_COUNT: u32 = 6;

/// Sensor resolution used for the mandatory raw stream when the caller does
/// not declare one.
pub const DEFAULT_RAW_SIZE: Size = Size::new(2304, 1296);

/// How a stream's frames reach the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Sensor-native Bayer data. Required for sensor configuration, never
    /// delivered.
    #[serde(rename = "raw")]
    Raw,
    /// Packed RGB delivered straight from the mapped buffer.
    #[serde(rename = "rgb", alias = "direct")]
    Direct,
    /// Planar YUV compressed to JPEG before delivery.
    #[serde(rename = "jpeg", alias = "compressed")]
    Compressed,
}

impl StreamKind {
    pub fn role(&self) -> StreamRole {
        match self {
            StreamKind::Raw => StreamRole::Raw,
            StreamKind::Direct | StreamKind::Compressed => StreamRole::StillCapture,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            StreamKind::Raw => PixelFormat::Sbggr10,
            StreamKind::Direct => PixelFormat::Bgr888,
            StreamKind::Compressed => PixelFormat::Yuv420,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamKind::Raw => write!(f, "raw"),
            StreamKind::Direct => write!(f, "rgb"),
            StreamKind::Compressed => write!(f, "jpeg"),
        }
    }
}

/// Requested stream. A zero width or height keeps the hardware default.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl StreamConfig {
    pub fn new(kind: StreamKind, width: u32, height: u32) -> Self {
        Self {
            kind,
            width,
            height,
        }
    }
}

/// A configured stream. Immutable until the next `configure`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub stream: StreamId,
    pub size: Size,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
    /// Bytes of one frame, the length mapped for non-raw buffers.
    pub frame_size: usize,
}

/// Negotiates streams with the camera and owns their buffers, mappings and
/// the capture request pool.
pub struct StreamManager {
    camera: Arc<dyn Camera>,
    streams: Vec<StreamDescriptor>,
    buffers: BTreeMap<StreamId, Vec<FrameBuffer>>,
    mapped: HashMap<BufferId, MappedBuffer>,
    requests: Vec<Request>,
}

impl StreamManager {
    pub fn new(camera: Arc<dyn Camera>) -> Self {
        Self {
            camera,
            streams: Vec::new(),
            buffers: BTreeMap::new(),
            mapped: HashMap::new(),
            requests: Vec::new(),
        }
    }

    /// Configures the camera with one raw stream plus every non-raw stream
    /// in `configs`.
    ///
    /// The raw stream is `raw` when given, otherwise the first raw entry of
    /// `configs`, otherwise a default at [`DEFAULT_RAW_SIZE`]. Any further
    /// raw entries are dropped so the sensor stream appears once.
    pub fn configure(&mut self, raw: Option<StreamConfig>, configs: &[StreamConfig]) -> Result<()> {
        self.free_buffers();
        self.streams.clear();

        let raw = raw
            .or_else(|| configs.iter().find(|c| c.kind == StreamKind::Raw).copied())
            .map(|c| StreamConfig {
                kind: StreamKind::Raw,
                ..c
            })
            .unwrap_or(StreamConfig::new(
                StreamKind::Raw,
                DEFAULT_RAW_SIZE.width,
                DEFAULT_RAW_SIZE.height,
            ));

        let mut requested = vec![raw];
        for cfg in configs {
            if cfg.kind == StreamKind::Raw {
                debug!("dropping duplicate raw stream {}x{}", cfg.width, cfg.height);
                continue;
            }
            requested.push(*cfg);
        }

        let roles: Vec<StreamRole> = requested.iter().map(|c| c.kind.role()).collect();
        let mut config = self.camera.generate_configuration(&roles).ok_or_else(|| {
            Error::ConfigurationRejected("failed to generate camera configuration".to_string())
        })?;
        if config.len() != requested.len() {
            return Err(Error::ConfigurationRejected(format!(
                "expected {} streams but the camera generated {}",
                requested.len(),
                config.len()
            )));
        }

        for (cfg, app) in config.streams.iter_mut().zip(&requested) {
            if app.width > 0 {
                cfg.size.width = app.width;
            }
            if app.height > 0 {
                cfg.size.height = app.height;
            }
            cfg.buffer_count = BUFFER_COUNT;
            cfg.pixel_format = app.kind.pixel_format();
        }

        match self.camera.validate(&mut config) {
            ConfigurationStatus::Invalid => {
                return Err(Error::ConfigurationRejected(
                    "invalid camera configuration after validation".to_string(),
                ))
            }
            ConfigurationStatus::Adjusted => {
                for (cfg, app) in config.streams.iter().zip(&requested) {
                    if (app.width > 0 && cfg.size.width != app.width)
                        || (app.height > 0 && cfg.size.height != app.height)
                    {
                        warn!(
                            "requested {} stream {}x{} but camera set {}",
                            app.kind, app.width, app.height, cfg.size
                        );
                    }
                }
            }
            ConfigurationStatus::Valid => {}
        }

        self.camera.configure(&mut config)?;

        let mut streams = Vec::with_capacity(requested.len());
        for (cfg, app) in config.streams.iter().zip(&requested) {
            let stream = cfg.stream.ok_or_else(|| {
                Error::ConfigurationRejected("camera did not assign a stream".to_string())
            })?;
            streams.push(StreamDescriptor {
                kind: app.kind,
                stream,
                size: cfg.size,
                pixel_format: cfg.pixel_format,
                buffer_count: cfg.buffer_count,
                frame_size: cfg.pixel_format.frame_size(cfg.size.width, cfg.size.height),
            });
            info!("{} stream {} {}", app.kind, cfg.size, cfg.pixel_format);
        }
        self.streams = streams;

        Ok(())
    }

    /// Allocates buffers for every stream, maps the non-raw ones and builds
    /// the request pool. On failure nothing stays allocated.
    pub fn allocate_buffers(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::InvalidConfiguration(
                "streams are not configured".to_string(),
            ));
        }
        if self.is_allocated() {
            return Err(Error::Allocation("buffers are already allocated".to_string()));
        }

        let result = self.try_allocate();
        if let Err(e) = &result {
            warn!("buffer allocation failed: {e}");
            self.free_buffers();
        }
        result
    }

    fn try_allocate(&mut self) -> Result<()> {
        for desc in &self.streams {
            let buffers = self.camera.allocate(desc.stream)?;
            let allocated = buffers.len();
            self.buffers.insert(desc.stream, buffers);
            if allocated == 0 {
                return Err(Error::Allocation(format!(
                    "no buffers allocated for {} stream",
                    desc.kind
                )));
            }

            // Raw buffers are never delivered, so they stay unmapped.
            if desc.kind == StreamKind::Raw {
                continue;
            }

            for buffer in &self.buffers[&desc.stream] {
                let len = desc.frame_size.min(buffer.length());
                let view = MappedBuffer::map(buffer.fd(), buffer.offset(), len)
                    .map_err(Error::Mapping)?;
                self.mapped.insert(buffer.id(), view);
            }
        }

        let count = self.buffers.values().map(Vec::len).min().unwrap_or(0);
        for index in 0..count {
            let mut request = self.camera.create_request(index as u64).ok_or_else(|| {
                Error::Allocation("failed to create capture request".to_string())
            })?;
            for (stream, buffers) in &self.buffers {
                request.add_buffer(*stream, buffers[index].id());
            }
            self.requests.push(request);
        }

        debug!(
            "allocated {} requests, {} mapped buffers",
            self.requests.len(),
            self.mapped.len()
        );
        Ok(())
    }

    /// Unmaps every buffer, releases the allocations and clears the request
    /// pool. Safe to call any number of times.
    pub fn free_buffers(&mut self) {
        self.mapped.clear();
        for stream in self.buffers.keys() {
            self.camera.free(*stream);
        }
        self.buffers.clear();
        self.requests.clear();
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn stream(&self, stream: StreamId) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.stream == stream)
    }

    /// Kind of a configured stream. Unknown streams are treated as raw so
    /// they are never delivered.
    pub fn kind(&self, stream: StreamId) -> StreamKind {
        self.stream(stream).map_or(StreamKind::Raw, |s| s.kind)
    }

    /// Mapped contents of a buffer, `None` for raw or unknown buffers.
    pub fn mapped(&self, buffer: BufferId) -> Option<&[u8]> {
        self.mapped.get(&buffer).map(MappedBuffer::as_slice)
    }

    pub fn mapped_count(&self) -> usize {
        self.mapped.len()
    }

    pub fn requests_mut(&mut self) -> &mut [Request] {
        &mut self.requests
    }

    /// Hands the pooled requests to the caller for queueing.
    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.free_buffers();
    }
}
