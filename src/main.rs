// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_capture::{
    controls::ControlSet,
    pipeline::Pipeline,
    streams::StreamKind,
    virtual_camera::{Trigger, VirtualCamera, VirtualCameraManager},
};
use std::{collections::BTreeMap, error::Error, sync::Arc, time::Duration};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

#[derive(Debug)]
struct Delivered {
    kind: StreamKind,
    sequence: u32,
    bytes: usize,
}

fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let stdout_log = tracing_subscriber::fmt::layer().with_filter(env_filter(args.verbose));

    let journald = match tracing_journald::layer() {
        Ok(layer) => Some(layer.with_filter(env_filter(args.verbose))),
        Err(_) => None,
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        let layer = tracing_tracy::TracyLayer::new(tracing_tracy::DefaultConfig::default());
        Some(layer.with_filter(env_filter(args.verbose)))
    } else {
        None
    };

    let console = args.tokio_console.then(console_subscriber::spawn);

    let subscriber = Registry::default()
        .with(console)
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = args.pipeline_config()?;
    let camera = Arc::new(
        VirtualCamera::builder()
            .memory(args.memory.into())
            .trigger(Trigger::FreeRunning)
            .build(),
    );
    let manager = Arc::new(VirtualCameraManager::with_camera(camera));
    let pipeline = Arc::new(Pipeline::open(manager, &config)?);

    for stream in pipeline.streams()? {
        info!(
            "{} stream {} {} x{}",
            stream.kind, stream.size, stream.pixel_format, stream.buffer_count
        );
    }
    info!("capabilities {:?}", pipeline.capabilities()?);

    let (frame_tx, frame_rx) = kanal::unbounded::<Delivered>();
    let (error_tx, error_rx) = kanal::unbounded::<String>();
    pipeline.start(
        move |kind, frame| {
            let _ = frame_tx.send(Delivered {
                kind,
                sequence: frame.sequence,
                bytes: frame.len(),
            });
        },
        move |message| {
            let _ = error_tx.send(message.to_string());
        },
    )?;

    if let Some(quality) = args.jpeg_quality {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            let controls = ControlSet {
                jpeg_quality: Some(quality),
                ..ControlSet::default()
            };
            match pipeline.set_controls(&controls) {
                Ok(()) => info!("jpeg quality set to {quality}"),
                Err(e) => warn!("failed to set jpeg quality: {e}"),
            }
        });
    }

    let frames = args.frames;
    let frame_rx = frame_rx.to_async();
    let mut counter = tokio::spawn(async move {
        let mut stats: BTreeMap<String, (u64, usize, u32)> = BTreeMap::new();
        let mut jpeg_frames = 0u64;
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                delivered = frame_rx.recv() => {
                    let Ok(delivered) = delivered else {
                        break;
                    };
                    let entry = stats.entry(delivered.kind.to_string()).or_default();
                    entry.0 += 1;
                    entry.1 += delivered.bytes;
                    entry.2 = delivered.sequence;

                    if delivered.kind == StreamKind::Compressed {
                        jpeg_frames += 1;
                        if frames.is_some_and(|limit| jpeg_frames >= limit) {
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    for (kind, (count, bytes, sequence)) in stats.iter_mut() {
                        info!(
                            "{kind}: {count} fps {} KiB/s last sequence {sequence}",
                            *bytes / 1024
                        );
                        *count = 0;
                        *bytes = 0;
                    }
                }
            }
        }
        jpeg_frames
    });

    let error_rx = error_rx.to_async();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        count = &mut counter => info!("received {} jpeg frames", count?),
        message = error_rx.recv() => {
            if let Ok(message) = message {
                error!("pipeline error: {message}");
            }
        }
    }

    tokio::task::spawn_blocking(move || pipeline.close()).await?;
    counter.abort();
    Ok(())
}
