// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    controls::ControlSet,
    encoder::DEFAULT_QUEUE_SIZE,
    error::{Error, Result},
    streams::{StreamConfig, StreamKind, DEFAULT_RAW_SIZE},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

fn default_raw_width() -> u32 {
    DEFAULT_RAW_SIZE.width
}

fn default_raw_height() -> u32 {
    DEFAULT_RAW_SIZE.height
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

/// Sensor-side raw stream. Missing dimensions use the default sensor mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStreamConfig {
    #[serde(default = "default_raw_width")]
    pub width: u32,
    #[serde(default = "default_raw_height")]
    pub height: u32,
}

impl Default for RawStreamConfig {
    fn default() -> Self {
        Self {
            width: default_raw_width(),
            height: default_raw_height(),
        }
    }
}

impl From<RawStreamConfig> for StreamConfig {
    fn from(raw: RawStreamConfig) -> Self {
        StreamConfig::new(StreamKind::Raw, raw.width, raw.height)
    }
}

/// Everything `Pipeline::initialize` needs.
///
/// ```json
/// {
///   "rawStream": { "width": 2304, "height": 1296 },
///   "streams": [
///     { "type": "jpeg", "width": 1280, "height": 720 },
///     { "type": "rgb", "width": 640, "height": 480 }
///   ],
///   "controls": { "targetFps": 30, "jpegQuality": 85 },
///   "jpegEncoderQueueSize": 33
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Camera id, the first enumerated camera when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_stream: Option<RawStreamConfig>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub controls: ControlSet,
    #[serde(default = "default_queue_size")]
    pub jpeg_encoder_queue_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera: None,
            raw_stream: None,
            streams: Vec::new(),
            controls: ControlSet::default(),
            jpeg_encoder_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, kind: StreamKind, width: u32, height: u32) -> Self {
        self.streams.push(StreamConfig::new(kind, width, height));
        self
    }

    pub fn with_raw_stream(mut self, width: u32, height: u32) -> Self {
        self.raw_stream = Some(RawStreamConfig { width, height });
        self
    }

    pub fn with_controls(mut self, controls: ControlSet) -> Self {
        self.controls = controls;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.jpeg_encoder_queue_size = size;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks the constraints `initialize` relies on.
    pub fn validate(&self) -> Result<()> {
        if !self.streams.iter().any(|s| s.kind != StreamKind::Raw) {
            return Err(Error::InvalidConfiguration(
                "at least one jpeg or rgb stream is required".to_string(),
            ));
        }
        if self.jpeg_encoder_queue_size == 0 {
            return Err(Error::InvalidConfiguration(
                "jpegEncoderQueueSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The explicitly declared raw stream, if any.
    pub fn raw(&self) -> Option<StreamConfig> {
        self.raw_stream.map(StreamConfig::from)
    }
}
