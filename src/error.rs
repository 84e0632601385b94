// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::io;
use thiserror::Error;

/// Result alias used throughout the capture pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the capture pipeline and the hardware boundary.
///
/// Setup failures are returned synchronously from `initialize`, `start`,
/// `configure` and `allocate_buffers`. Runtime hardware errors are delivered
/// through the pipeline's error callback instead and never appear here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no cameras found, verify the camera is connected and drivers are loaded")]
    NoCameras,

    #[error("camera {0} not found")]
    CameraNotFound(String),

    #[error("camera {0} is in use by another process")]
    CameraBusy(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("stream configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("failed to map buffer: {0}")]
    Mapping(#[source] io::Error),

    #[error("failed to start capture: {0}")]
    Start(String),

    #[error("failed to queue request: {0}")]
    Queue(String),

    #[error("pipeline is not initialized")]
    NotInitialized,

    #[error("pipeline is already initialized")]
    AlreadyInitialized,

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("jpeg encoding failed: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<turbojpeg::Error> for Error {
    fn from(err: turbojpeg::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
