// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_capture::{
    buffer::MemorySource,
    config::PipelineConfig,
    controls::ControlSet,
    encoder::DEFAULT_QUEUE_SIZE,
    error::Result,
    streams::StreamKind,
};
use std::path::PathBuf;

/// Buffer memory backing the virtual camera.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Memory {
    /// Anonymous shared memory
    Memfd,
    /// Contiguous memory from the CMA DMA heap
    DmaHeap,
}

impl From<Memory> for MemorySource {
    fn from(memory: Memory) -> Self {
        match memory {
            Memory::Memfd => MemorySource::Memfd,
            Memory::DmaHeap => MemorySource::DmaHeap,
        }
    }
}

/// Command-line arguments for the EdgeFirst capture pipeline demo.
///
/// Streams the virtual camera through the capture pipeline and reports
/// per-stream throughput. Arguments can be given on the command line or as
/// environment variables.
///
/// # Example
///
/// ```bash
/// edgefirst-capture --jpeg --jpeg-size "1280 720" --rgb --fps 30
///
/// export CONFIG=pipeline.json
/// edgefirst-capture
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Pipeline configuration JSON file, overrides the stream options
    #[arg(long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable the JPEG stream
    #[arg(long, env = "JPEG")]
    pub jpeg: bool,

    /// JPEG stream resolution in pixels (width height)
    #[arg(
        long,
        env = "JPEG_SIZE",
        default_value = "1280 720",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub jpeg_size: Vec<u32>,

    /// Enable the RGB stream
    #[arg(long, env = "RGB")]
    pub rgb: bool,

    /// RGB stream resolution in pixels (width height)
    #[arg(
        long,
        env = "RGB_SIZE",
        default_value = "640 480",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub rgb_size: Vec<u32>,

    /// Raw sensor stream resolution in pixels (width height)
    #[arg(
        long,
        env = "RAW_SIZE",
        default_value = "2304 1296",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub raw_size: Vec<u32>,

    /// Target capture frame rate
    #[arg(long, env = "FPS", default_value = "30")]
    pub fps: i32,

    /// JPEG quality applied one second after streaming starts
    #[arg(long, env = "JPEG_QUALITY")]
    pub jpeg_quality: Option<i32>,

    /// JPEG encoder queue size
    #[arg(long, env = "QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    pub queue_size: usize,

    /// Stop after this many JPEG frames
    #[arg(long, env = "FRAMES")]
    pub frames: Option<u64>,

    /// Buffer memory for the virtual camera
    #[arg(long, env = "MEMORY", default_value = "memfd", value_enum)]
    pub memory: Memory,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Builds the pipeline configuration from `--config` or the stream
    /// options.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        if let Some(path) = &self.config {
            return PipelineConfig::from_json_file(path);
        }

        let mut config = PipelineConfig::new()
            .with_raw_stream(self.raw_size[0], self.raw_size[1])
            .with_queue_size(self.queue_size)
            .with_controls(ControlSet {
                target_fps: Some(self.fps),
                ..ControlSet::default()
            });

        // Without an explicit choice stream JPEG, matching the camera node.
        if self.jpeg || !self.rgb {
            config = config.with_stream(StreamKind::Compressed, self.jpeg_size[0], self.jpeg_size[1]);
        }
        if self.rgb {
            config = config.with_stream(StreamKind::Direct, self.rgb_size[0], self.rgb_size[1]);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() -> Result<()> {
        let args = Args::parse_from(["edgefirst-capture"]);
        let config = args.pipeline_config()?;
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].kind, StreamKind::Compressed);
        assert_eq!(config.controls.target_fps, Some(30));
        assert_eq!(config.jpeg_encoder_queue_size, DEFAULT_QUEUE_SIZE);
        config.validate()
    }

    #[test]
    fn test_stream_options() -> Result<()> {
        let args = Args::parse_from([
            "edgefirst-capture",
            "--jpeg",
            "--rgb",
            "--rgb-size",
            "320",
            "240",
            "--fps",
            "15",
            "--memory",
            "dma-heap",
        ]);
        let config = args.pipeline_config()?;
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[1].kind, StreamKind::Direct);
        assert_eq!((config.streams[1].width, config.streams[1].height), (320, 240));
        assert_eq!(config.controls.target_fps, Some(15));
        assert_eq!(MemorySource::from(args.memory), MemorySource::DmaHeap);
        Ok(())
    }
}
