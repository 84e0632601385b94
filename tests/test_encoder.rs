// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_capture::{
    buffer::PixelFormat,
    encoder::{AsyncEncoder, Compressor, DEFAULT_QUEUE_SIZE},
    error::{Error, Result},
    pipeline::Frame,
};
use kanal::{Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Returns the input unchanged.
struct Echo;

impl Compressor for Echo {
    fn compress(&mut self, yuv: &[u8], _: u32, _: u32, _: i32) -> Result<Vec<u8>> {
        Ok(yuv.to_vec())
    }
}

/// Waits for a token before each frame. Fails once the gate is dropped.
struct Gated {
    gate: Receiver<()>,
}

impl Compressor for Gated {
    fn compress(&mut self, yuv: &[u8], _: u32, _: u32, _: i32) -> Result<Vec<u8>> {
        self.gate
            .recv()
            .map_err(|_| Error::Codec("gate closed".to_string()))?;
        Ok(yuv.to_vec())
    }
}

/// Rejects frames starting with 0xff.
struct Picky;

impl Compressor for Picky {
    fn compress(&mut self, yuv: &[u8], _: u32, _: u32, _: i32) -> Result<Vec<u8>> {
        match yuv.first() {
            Some(0xff) => Err(Error::Codec("corrupt frame".to_string())),
            _ => Ok(yuv.to_vec()),
        }
    }
}

fn submit(encoder: &AsyncEncoder, sequence: u32, tx: &Sender<u32>) -> bool {
    let tx = tx.clone();
    encoder.encode(
        &[sequence as u8],
        1,
        1,
        85,
        u64::from(sequence) * 1000,
        sequence,
        move |frame: Frame<'static>| {
            let _ = tx.send(frame.sequence);
        },
    )
}

fn wait_until(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(1));
    }
}

fn received(rx: &Receiver<u32>, count: usize) -> Vec<u32> {
    (0..count)
        .map(|_| rx.recv_timeout(TIMEOUT).expect("encoded frame"))
        .collect()
}

#[test]
fn test_fifo_order() -> Result<()> {
    let encoder = AsyncEncoder::new(4, Box::new(Echo))?;
    encoder.start()?;

    let (tx, rx) = kanal::unbounded();
    for sequence in 1..=50 {
        assert!(submit(&encoder, sequence, &tx));
    }

    assert_eq!(received(&rx, 50), (1..=50).collect::<Vec<_>>());
    encoder.stop();
    Ok(())
}

#[test]
fn test_back_pressure_blocks_without_loss() -> Result<()> {
    let (gate_tx, gate_rx) = kanal::unbounded();
    let encoder = Arc::new(AsyncEncoder::new(2, Box::new(Gated { gate: gate_rx }))?);
    encoder.start()?;

    let (tx, rx) = kanal::unbounded();
    assert!(submit(&encoder, 1, &tx));
    // The worker holds job 1 at the gate.
    wait_until(|| encoder.is_empty());

    assert!(submit(&encoder, 2, &tx));
    assert!(submit(&encoder, 3, &tx));
    assert_eq!(encoder.len(), 2);

    let returned = Arc::new(AtomicBool::new(false));
    let blocked = {
        let encoder = encoder.clone();
        let returned = returned.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let queued = submit(&encoder, 4, &tx);
            returned.store(true, Ordering::Release);
            queued
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!returned.load(Ordering::Acquire), "submission did not block");

    gate_tx.send(()).expect("gate");
    wait_until(|| returned.load(Ordering::Acquire));
    assert!(blocked.join().expect("submitter"));

    for _ in 0..3 {
        gate_tx.send(()).expect("gate");
    }
    assert_eq!(received(&rx, 4), vec![1, 2, 3, 4]);

    encoder.stop();
    Ok(())
}

#[test]
fn test_stop_discards_queued_jobs() -> Result<()> {
    let (gate_tx, gate_rx) = kanal::unbounded();
    let encoder = AsyncEncoder::new(4, Box::new(Gated { gate: gate_rx }))?;
    encoder.start()?;

    let (tx, rx) = kanal::unbounded();
    assert!(submit(&encoder, 1, &tx));
    wait_until(|| encoder.is_empty());
    assert!(submit(&encoder, 2, &tx));
    assert!(submit(&encoder, 3, &tx));

    encoder.close();
    assert!(encoder.is_empty());
    assert!(!submit(&encoder, 4, &tx));

    // The in-flight job still completes.
    gate_tx.send(()).expect("gate");
    encoder.stop();

    assert_eq!(rx.recv_timeout(TIMEOUT).ok(), Some(1));
    assert_eq!(rx.try_recv().ok().flatten(), None);
    Ok(())
}

#[test]
fn test_blocked_submitter_released_by_stop() -> Result<()> {
    let (gate_tx, gate_rx) = kanal::unbounded();
    let encoder = Arc::new(AsyncEncoder::new(1, Box::new(Gated { gate: gate_rx }))?);
    encoder.start()?;

    let (tx, rx) = kanal::unbounded();
    assert!(submit(&encoder, 1, &tx));
    wait_until(|| encoder.is_empty());
    assert!(submit(&encoder, 2, &tx));

    let blocked = {
        let encoder = encoder.clone();
        let tx = tx.clone();
        thread::spawn(move || submit(&encoder, 3, &tx))
    };
    thread::sleep(Duration::from_millis(50));

    encoder.close();
    assert!(!blocked.join().expect("submitter"));

    drop(gate_tx);
    encoder.stop();
    assert_eq!(rx.try_recv().ok().flatten(), None);
    Ok(())
}

#[test]
fn test_codec_failure_drops_frame() -> Result<()> {
    let encoder = AsyncEncoder::new(DEFAULT_QUEUE_SIZE, Box::new(Picky))?;
    encoder.start()?;

    let (tx, rx) = kanal::unbounded();
    assert!(submit(&encoder, 1, &tx));
    assert!(submit(&encoder, 0xff, &tx));
    assert!(submit(&encoder, 3, &tx));

    assert_eq!(received(&rx, 2), vec![1, 3]);
    assert!(encoder.is_running());
    encoder.stop();
    Ok(())
}

fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn encode_jpeg(encoder: &AsyncEncoder, yuv: &[u8], quality: i32) -> Frame<'static> {
    let (tx, rx) = kanal::unbounded();
    assert!(encoder.encode(yuv, 320, 240, quality, 42, 7, move |frame| {
        let _ = tx.send(frame);
    }));
    rx.recv_timeout(TIMEOUT).expect("jpeg frame")
}

#[test]
fn test_turbojpeg_output() -> Result<()> {
    let encoder = AsyncEncoder::with_turbojpeg(DEFAULT_QUEUE_SIZE)?;
    encoder.start()?;

    let yuv = noise(PixelFormat::Yuv420.frame_size(320, 240));
    let high = encode_jpeg(&encoder, &yuv, 95);
    let low = encode_jpeg(&encoder, &yuv, 20);

    assert_eq!(&high.bytes()[..2], &[0xff, 0xd8]);
    assert_eq!(&high.bytes()[high.len() - 2..], &[0xff, 0xd9]);
    assert_eq!((high.timestamp, high.sequence), (42, 7));
    assert!(high.len() > low.len());

    encoder.stop();
    Ok(())
}
