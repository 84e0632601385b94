// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Capture pipeline controller.
//!
//! [`Pipeline`] owns the camera for its whole lifecycle:
//!
//! 1. [`initialize`](Pipeline::initialize) acquires the camera, negotiates
//!    streams and builds the control store and encoder.
//! 2. [`start`](Pipeline::start) allocates buffers, stages the initial
//!    controls on every pooled request and queues them all.
//! 3. Each completion is handled on the camera's thread: pending controls are
//!    staged on the request, direct streams are delivered in place,
//!    compressed streams go to the [`AsyncEncoder`], and the request is queued
//!    again.
//! 4. [`stop`](Pipeline::stop) tears everything down and releases the camera.
//!
//! Control changes take effect on the next request to complete after
//! [`set_controls`](Pipeline::set_controls), so their latency is bounded by
//! the request pool depth.

use crate::{
    config::PipelineConfig,
    controls::{Capabilities, ControlSet, ControlStore},
    encoder::{AsyncEncoder, Compressor, TurboJpeg},
    error::{Error, Result},
    hal::{Camera, CameraEvent, CameraManager, Request, RequestStatus},
    streams::{StreamDescriptor, StreamKind, StreamManager},
};
use std::{
    borrow::Cow,
    cell::Cell,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, info_span, trace, warn};

pub const DEFAULT_TARGET_FPS: i32 = 30;
pub const DEFAULT_JPEG_QUALITY: i32 = 85;

/// A delivered frame.
///
/// Direct frames borrow the mapped hardware buffer and are only valid for the
/// duration of the frame callback. Compressed frames own their bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub data: Cow<'a, [u8]>,
    /// Sensor timestamp in nanoseconds.
    pub timestamp: u64,
    pub sequence: u32,
}

impl Frame<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies borrowed data so the frame can outlive the callback.
    pub fn into_owned(self) -> Frame<'static> {
        Frame {
            data: Cow::Owned(self.data.into_owned()),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

/// Called with every delivered frame. Direct frames arrive on the camera's
/// completion thread, compressed frames on the encoder worker.
pub type FrameCallback = Arc<dyn Fn(StreamKind, &Frame<'_>) + Send + Sync>;

/// Called with runtime hardware errors. The pipeline should be stopped.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a user callback until dropped.
struct CallbackScope {
    previous: bool,
}

impl CallbackScope {
    fn enter() -> Self {
        Self {
            previous: IN_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.previous));
    }
}

fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

struct Shared {
    camera: Arc<dyn Camera>,
    streams: RwLock<StreamManager>,
    controls: ControlStore,
    encoder: AsyncEncoder,
    initial: ControlSet,
    jpeg_quality: AtomicI32,
    running: AtomicBool,
}

impl Shared {
    fn on_event(&self, event: CameraEvent, on_frame: &FrameCallback, on_error: &ErrorCallback) {
        match event {
            CameraEvent::RequestCompleted(request) => self.complete(request, on_frame, on_error),
            CameraEvent::Disconnected => {
                error!("camera {} disconnected", self.camera.id());
                on_error(&format!("camera {} disconnected", self.camera.id()));
            }
        }
    }

    fn complete(&self, mut request: Request, on_frame: &FrameCallback, on_error: &ErrorCallback) {
        if request.status() == RequestStatus::Cancelled {
            trace!(cookie = request.cookie(), "ignoring cancelled request");
            return;
        }

        let sequence = request.sequence();
        let span = info_span!("request", sequence, cookie = request.cookie());
        let _guard = span.enter();

        self.controls.apply_pending(&mut request);
        let timestamp = request.metadata().sensor_timestamp.unwrap_or_default();

        {
            let streams = self.streams.read().expect("streams poisoned");
            for (stream, buffer) in request.buffers() {
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                let Some(desc) = streams.stream(*stream) else {
                    continue;
                };
                let Some(data) = streams.mapped(*buffer) else {
                    continue;
                };

                match desc.kind {
                    StreamKind::Raw => {}
                    StreamKind::Direct => {
                        let frame = Frame {
                            data: Cow::Borrowed(data),
                            timestamp,
                            sequence,
                        };
                        on_frame(StreamKind::Direct, &frame);
                    }
                    StreamKind::Compressed => {
                        let quality = self.jpeg_quality.load(Ordering::Acquire);
                        let on_frame = on_frame.clone();
                        self.encoder.encode(
                            data,
                            desc.size.width,
                            desc.size.height,
                            quality,
                            timestamp,
                            sequence,
                            move |frame| {
                                let _scope = CallbackScope::enter();
                                on_frame(StreamKind::Compressed, &frame)
                            },
                        );
                    }
                }
            }
        }

        request.reuse();
        if let Err(e) = self.camera.queue_request(request) {
            if self.running.load(Ordering::Acquire) {
                error!("failed to requeue request: {e}");
                on_error(&format!("failed to requeue request: {e}"));
            } else {
                debug!("request not requeued while stopping: {e}");
            }
        }
    }

    fn begin(self: &Arc<Self>, on_frame: FrameCallback, on_error: ErrorCallback) -> Result<()> {
        self.streams
            .write()
            .expect("streams poisoned")
            .allocate_buffers()?;

        if let Err(e) = self.encoder.start() {
            self.streams.write().expect("streams poisoned").free_buffers();
            return Err(e);
        }

        let weak: Weak<Shared> = Arc::downgrade(self);
        self.camera.set_event_handler(Some(Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                let _scope = CallbackScope::enter();
                shared.on_event(event, &on_frame, &on_error);
            }
        })));

        // The autofocus trigger is one-shot: only the first pooled request
        // carries it.
        let steady = ControlSet {
            af_trigger: None,
            ..self.initial
        };
        let requests = {
            let mut streams = self.streams.write().expect("streams poisoned");
            for (i, request) in streams.requests_mut().iter_mut().enumerate() {
                let controls = if i == 0 { &self.initial } else { &steady };
                self.controls.apply(controls, request);
            }
            streams.take_requests()
        };

        self.running.store(true, Ordering::Release);
        let result = self
            .camera
            .start(&steady.to_control_list())
            .and_then(|_| {
                requests
                    .into_iter()
                    .try_for_each(|request| self.camera.queue_request(request))
            });

        if let Err(e) = result {
            self.running.store(false, Ordering::Release);
            self.shutdown();
            return Err(e);
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.camera.set_event_handler(None);
        // Unblocks a completion waiting on a full encoder queue so the
        // camera can stop its capture thread.
        self.encoder.close();
        self.camera.stop();
        self.encoder.stop();
        self.streams.write().expect("streams poisoned").free_buffers();
    }
}

/// The capture/control/encode pipeline.
///
/// All methods take `&self`, so a pipeline can be shared between the thread
/// that drives it and the threads that adjust its controls.
pub struct Pipeline {
    manager: Arc<dyn CameraManager>,
    compressor: Mutex<Option<Box<dyn Compressor>>>,
    // Serialises initialize/start/stop/close.
    lifecycle: Mutex<()>,
    shared: Mutex<Option<Arc<Shared>>>,
    // Teardown of a stop requested from inside a callback.
    teardown: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(manager: Arc<dyn CameraManager>) -> Self {
        Self {
            manager,
            compressor: Mutex::new(None),
            lifecycle: Mutex::new(()),
            shared: Mutex::new(None),
            teardown: Mutex::new(None),
        }
    }

    /// Creates and initializes a pipeline in one step.
    pub fn open(manager: Arc<dyn CameraManager>, config: &PipelineConfig) -> Result<Self> {
        let pipeline = Self::new(manager);
        pipeline.initialize(config)?;
        Ok(pipeline)
    }

    /// Uses `compressor` instead of libjpeg-turbo for the next
    /// `initialize`.
    pub fn with_compressor(self, compressor: Box<dyn Compressor>) -> Self {
        *self.compressor.lock().expect("compressor poisoned") = Some(compressor);
        self
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .lock()
            .expect("pipeline poisoned")
            .clone()
            .ok_or(Error::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().expect("pipeline poisoned").is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared()
            .map(|shared| shared.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Acquires a camera and configures its streams. Nothing is allocated
    /// until [`start`](Self::start).
    pub fn initialize(&self, config: &PipelineConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        if self.is_initialized() {
            return Err(Error::AlreadyInitialized);
        }
        self.join_teardown();
        config.validate()?;

        let cameras = self.manager.cameras();
        if cameras.is_empty() {
            return Err(Error::NoCameras);
        }
        let camera = match &config.camera {
            Some(id) => self
                .manager
                .get(id)
                .ok_or_else(|| Error::CameraNotFound(id.clone()))?,
            None => cameras[0].clone(),
        };
        camera.acquire()?;

        match self.build(camera.clone(), config) {
            Ok(shared) => {
                *self.shared.lock().expect("pipeline poisoned") = Some(Arc::new(shared));
                info!("pipeline initialized on camera {}", camera.id());
                Ok(())
            }
            Err(e) => {
                camera.release();
                Err(e)
            }
        }
    }

    fn build(&self, camera: Arc<dyn Camera>, config: &PipelineConfig) -> Result<Shared> {
        let mut streams = StreamManager::new(camera.clone());
        streams.configure(config.raw(), &config.streams)?;

        let compressor = match self.compressor.lock().expect("compressor poisoned").take() {
            Some(compressor) => compressor,
            None => Box::new(TurboJpeg::new()?),
        };
        let encoder = AsyncEncoder::new(config.jpeg_encoder_queue_size, compressor)?;

        let mut initial = config.controls;
        initial.target_fps.get_or_insert(DEFAULT_TARGET_FPS);
        initial.jpeg_quality.get_or_insert(DEFAULT_JPEG_QUALITY);
        debug!("initial controls {:?}", initial);

        Ok(Shared {
            controls: ControlStore::new(camera.clone()),
            jpeg_quality: AtomicI32::new(initial.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY)),
            camera,
            streams: RwLock::new(streams),
            encoder,
            initial,
            running: AtomicBool::new(false),
        })
    }

    /// Starts capture. On failure nothing is left allocated or running.
    pub fn start<F, E>(&self, on_frame: F, on_error: E) -> Result<()>
    where
        F: Fn(StreamKind, &Frame<'_>) + Send + Sync + 'static,
        E: Fn(&str) + Send + Sync + 'static,
    {
        let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        let shared = self.shared()?;
        if shared.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }

        shared.begin(Arc::new(on_frame), Arc::new(on_error))?;
        info!("pipeline started");
        Ok(())
    }

    /// Stops capture, frees every buffer and releases the camera. Does
    /// nothing if not running.
    ///
    /// Safe to call from the frame and error callbacks. There the handler is
    /// unregistered and the encoder closed before returning, and the rest of
    /// the teardown runs on a helper thread once the callback has returned.
    /// A later `stop`, `close` or `initialize` waits for it to finish.
    pub fn stop(&self) {
        if in_callback() {
            self.stop_from_callback();
            return;
        }

        let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        let Ok(shared) = self.shared() else {
            self.join_teardown();
            return;
        };
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        shared.shutdown();
        shared.camera.release();
        self.shared.lock().expect("pipeline poisoned").take();
        info!("pipeline stopped");
    }

    fn stop_from_callback(&self) {
        let mut slot = self.shared.lock().expect("pipeline poisoned");
        let running = slot
            .as_ref()
            .is_some_and(|shared| shared.running.swap(false, Ordering::AcqRel));
        if !running {
            return;
        }
        let Some(shared) = slot.take() else {
            return;
        };

        shared.camera.set_event_handler(None);
        shared.encoder.close();

        let spawned = thread::Builder::new()
            .name("pipeline-stop".to_string())
            .spawn(move || {
                shared.shutdown();
                shared.camera.release();
                info!("pipeline stopped");
            });
        match spawned {
            Ok(handle) => *self.teardown.lock().expect("teardown poisoned") = Some(handle),
            Err(e) => error!("failed to spawn pipeline teardown: {e}"),
        }
    }

    fn join_teardown(&self) {
        let handle = self.teardown.lock().expect("teardown poisoned").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("pipeline teardown panicked");
            }
        }
    }

    /// Stops if running and releases a camera that was initialized but
    /// never started.
    pub fn close(&self) {
        self.stop();
        if in_callback() {
            return;
        }

        let _lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        if let Some(shared) = self.shared.lock().expect("pipeline poisoned").take() {
            shared.camera.release();
            debug!("released camera {}", shared.camera.id());
        }
    }

    /// Merges `controls` into the pending set. JPEG quality takes effect for
    /// the next frame handed to the encoder.
    pub fn set_controls(&self, controls: &ControlSet) -> Result<()> {
        let shared = self.shared()?;
        if let Some(quality) = controls.jpeg_quality {
            if !(1..=100).contains(&quality) {
                warn!("jpeg quality {quality} will be clamped to 1..=100");
            }
            shared.jpeg_quality.store(quality, Ordering::Release);
        }
        shared.controls.submit(controls);
        Ok(())
    }

    /// Last-applied control values.
    pub fn get_controls(&self) -> Result<ControlSet> {
        Ok(self.shared()?.controls.snapshot())
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.shared()?.controls.capabilities())
    }

    /// Negotiated streams, raw stream first.
    pub fn streams(&self) -> Result<Vec<StreamDescriptor>> {
        let shared = self.shared()?;
        let streams = shared.streams.read().expect("streams poisoned");
        Ok(streams.streams().to_vec())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
