// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded asynchronous JPEG encoding.
//!
//! [`AsyncEncoder`] owns a FIFO of [`EncodeJob`]s and a single worker thread.
//! Submitting with [`AsyncEncoder::encode`] blocks while the queue is at
//! capacity, which is how a slow encoder throttles the capture loop: the
//! camera completion handler is the submitter, and a blocked handler stops
//! requests from being recycled.

use crate::{
    buffer::PixelFormat,
    error::{Error, Result},
    pipeline::Frame,
};
use std::{
    borrow::Cow,
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};
use tracing::{debug, info_span, warn};
use turbojpeg::{OutputBuf, Subsamp, YuvImage};

/// Roughly one second of frames at typical streaming rates.
pub const DEFAULT_QUEUE_SIZE: usize = 33;

/// Codec boundary: compresses a planar YUV 4:2:0 frame.
///
/// Implementations return a buffer sized to the exact compressed length.
pub trait Compressor: Send {
    fn compress(&mut self, yuv: &[u8], width: u32, height: u32, quality: i32) -> Result<Vec<u8>>;
}

/// libjpeg-turbo compressor for I420 input.
pub struct TurboJpeg {
    compressor: turbojpeg::Compressor,
}

impl TurboJpeg {
    pub fn new() -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new()?;
        compressor.set_subsamp(Subsamp::Sub2x2)?;
        Ok(Self { compressor })
    }
}

impl Compressor for TurboJpeg {
    fn compress(&mut self, yuv: &[u8], width: u32, height: u32, quality: i32) -> Result<Vec<u8>> {
        let expected = PixelFormat::Yuv420.frame_size(width, height);
        if yuv.len() < expected {
            return Err(Error::Codec(format!(
                "{}x{} I420 needs {} bytes, got {}",
                width,
                height,
                expected,
                yuv.len()
            )));
        }

        self.compressor.set_quality(quality.clamp(1, 100))?;
        let image = YuvImage {
            pixels: &yuv[..expected],
            width: width as usize,
            align: 1,
            height: height as usize,
            subsamp: Subsamp::Sub2x2,
        };

        // The working buffer is sized for the worst case; copy out only the
        // compressed bytes.
        let mut output = OutputBuf::new_owned();
        self.compressor.compress_yuv(image, &mut output)?;
        Ok(output.to_vec())
    }
}

/// Receives the encoded frame. Never called for jobs that were not encoded.
pub type EncodeCallback = Box<dyn FnOnce(Frame<'static>) + Send>;

/// A queued frame. The pixels are an owned copy so the source buffer can be
/// recycled by the hardware before the worker runs.
pub struct EncodeJob {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    quality: i32,
    timestamp: u64,
    sequence: u32,
    on_complete: EncodeCallback,
}

impl EncodeJob {
    fn run(self, compressor: &mut dyn Compressor) {
        let span = info_span!(
            "encode",
            sequence = self.sequence,
            width = self.width,
            height = self.height,
            quality = self.quality
        );
        let _guard = span.enter();

        match compressor.compress(&self.pixels, self.width, self.height, self.quality) {
            Ok(data) => (self.on_complete)(Frame {
                data: Cow::Owned(data),
                timestamp: self.timestamp,
                sequence: self.sequence,
            }),
            Err(e) => warn!("dropping frame {}: {}", self.sequence, e),
        }
    }
}

struct Queue {
    jobs: VecDeque<EncodeJob>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

pub struct AsyncEncoder {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<Box<dyn Compressor>>>>,
    // Parked here while stopped, owned by the worker while running.
    compressor: Mutex<Option<Box<dyn Compressor>>>,
}

impl AsyncEncoder {
    /// Creates a stopped encoder holding at most `capacity` queued jobs.
    pub fn new(capacity: usize, compressor: Box<dyn Compressor>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "encoder queue size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::with_capacity(capacity),
                    running: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity,
            }),
            worker: Mutex::new(None),
            compressor: Mutex::new(Some(compressor)),
        })
    }

    pub fn with_turbojpeg(capacity: usize) -> Result<Self> {
        Self::new(capacity, Box::new(TurboJpeg::new()?))
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of jobs waiting, not counting the one being encoded.
    pub fn len(&self) -> usize {
        self.lock_queue().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.lock_queue().running
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.shared.queue.lock().expect("encoder queue poisoned")
    }

    /// Spawns the worker. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // A worker left over from `close` must hand the codec back first.
        self.join_worker();

        let compressor = self
            .compressor
            .lock()
            .expect("encoder codec poisoned")
            .take()
            .ok_or_else(|| Error::Start("encoder codec is unavailable".to_string()))?;

        self.lock_queue().running = true;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("jpeg-encoder".to_string())
            .spawn(move || worker(shared, compressor));
        match handle {
            Ok(handle) => {
                *self.worker.lock().expect("encoder worker poisoned") = Some(handle);
                debug!("jpeg encoder started, queue size {}", self.shared.capacity);
                Ok(())
            }
            Err(e) => {
                self.lock_queue().running = false;
                Err(e.into())
            }
        }
    }

    /// Stops intake and discards queued jobs without calling their
    /// callbacks. Submitters blocked in [`encode`](Self::encode) return
    /// `false`. The job being encoded, if any, still completes.
    pub fn close(&self) {
        let discarded = {
            let mut queue = self.lock_queue();
            queue.running = false;
            std::mem::take(&mut queue.jobs)
        };
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        if !discarded.is_empty() {
            debug!("discarded {} queued encode jobs", discarded.len());
        }
    }

    /// Closes the queue and waits for the in-flight job and the worker.
    pub fn stop(&self) {
        self.close();
        self.join_worker();
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().expect("encoder worker poisoned").take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!("encoder stopped from its own worker, not joining");
            return;
        }
        match handle.join() {
            Ok(compressor) => {
                *self.compressor.lock().expect("encoder codec poisoned") = Some(compressor)
            }
            Err(_) => warn!("jpeg encoder worker panicked"),
        }
    }

    /// Queues an I420 frame for compression, blocking while the queue is
    /// full. Returns `false` without queueing if the encoder is stopped,
    /// including when it stops while this call is blocked.
    #[allow(clippy::too_many_arguments)]
    pub fn encode<F>(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        quality: i32,
        timestamp: u64,
        sequence: u32,
        on_complete: F,
    ) -> bool
    where
        F: FnOnce(Frame<'static>) + Send + 'static,
    {
        let job = EncodeJob {
            pixels: pixels.to_vec(),
            width,
            height,
            quality,
            timestamp,
            sequence,
            on_complete: Box::new(on_complete),
        };

        let capacity = self.shared.capacity;
        let mut queue = self
            .shared
            .not_full
            .wait_while(self.lock_queue(), |q| {
                q.running && q.jobs.len() >= capacity
            })
            .expect("encoder queue poisoned");
        if !queue.running {
            debug!("encoder stopped, frame {} not queued", sequence);
            return false;
        }

        queue.jobs.push_back(job);
        if queue.jobs.len() + 2 >= capacity {
            debug!(
                "jpeg encoder queue nearly full ({}/{})",
                queue.jobs.len(),
                capacity
            );
        }
        drop(queue);
        self.shared.not_empty.notify_one();
        true
    }
}

impl Drop for AsyncEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(shared: Arc<Shared>, mut compressor: Box<dyn Compressor>) -> Box<dyn Compressor> {
    loop {
        let job = {
            let mut queue = shared
                .not_empty
                .wait_while(
                    shared.queue.lock().expect("encoder queue poisoned"),
                    |q| q.running && q.jobs.is_empty(),
                )
                .expect("encoder queue poisoned");
            if !queue.running {
                break;
            }
            queue.jobs.pop_front()
        };
        shared.not_full.notify_one();

        if let Some(job) = job {
            job.run(compressor.as_mut());
        }
    }
    debug!("jpeg encoder worker exiting");
    compressor
}
