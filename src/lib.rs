// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Capture Pipeline Library
//!
//! This library drives an image sensor through a capture hardware
//! abstraction, applies capture controls while streaming and delivers each
//! frame either as raw pixels or as a JPEG compressed off the capture path.
//!
//! ## Features
//!
//! - **Request Recycling**: A fixed pool of capture requests, one buffer per
//!   stream each, cycles between the hardware and the completion handler.
//! - **Zero-Copy Delivery**: Non-raw buffers are memory-mapped once at
//!   allocation and RGB frames are handed to callers straight from the
//!   mapping.
//! - **Live Controls**: Exposure, focus, white balance, tone and frame rate
//!   changes are merged and applied on the next completed request.
//! - **Back-Pressured JPEG Encoding**: A bounded queue in front of a single
//!   libjpeg-turbo worker throttles capture instead of dropping frames.
//! - **Virtual Camera**: A software sensor for tests, benchmarks and demos
//!   without hardware.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_capture::{
//!     config::PipelineConfig,
//!     controls::ControlSet,
//!     pipeline::Pipeline,
//!     streams::StreamKind,
//!     virtual_camera::{Trigger, VirtualCamera, VirtualCameraManager},
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let camera = Arc::new(VirtualCamera::builder().trigger(Trigger::FreeRunning).build());
//! let manager = Arc::new(VirtualCameraManager::with_camera(camera));
//!
//! let config = PipelineConfig::new()
//!     .with_stream(StreamKind::Compressed, 1280, 720)
//!     .with_stream(StreamKind::Direct, 640, 480);
//! let pipeline = Pipeline::open(manager, &config)?;
//!
//! pipeline.start(
//!     |kind, frame| println!("{kind} frame {} {} bytes", frame.sequence, frame.len()),
//!     |message| eprintln!("camera error: {message}"),
//! )?;
//!
//! pipeline.set_controls(&ControlSet {
//!     jpeg_quality: Some(60),
//!     ..ControlSet::default()
//! })?;
//!
//! pipeline.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: `memfd_create` for buffer memory, or `/dev/dma_heap` for
//!   contiguous DMA buffers
//! - **libjpeg-turbo**: Linked through the `turbojpeg` crate
//!
//! ## Safety
//!
//! This library uses `unsafe` code for `mmap` and file descriptor handling.
//! Those operations are isolated in the [`buffer`] module and wrapped with
//! safe APIs. The only other `unsafe` call is the `clock_gettime` read of
//! `CLOCK_BOOTTIME` in [`virtual_camera`] for sensor timestamps.

pub mod buffer;
pub mod config;
pub mod controls;
pub mod encoder;
pub mod error;
pub mod hal;
pub mod pipeline;
pub mod streams;
pub mod virtual_camera;

pub use config::PipelineConfig;
pub use controls::{Capabilities, ControlSet};
pub use error::{Error, Result};
pub use pipeline::{Frame, Pipeline};
pub use streams::StreamKind;
