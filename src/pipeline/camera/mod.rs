#[cfg(feature = "camera-nokhwa")]
pub mod native;
pub mod registry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::bounded;
use parking_lot::Mutex;

pub use registry::{DeviceClaim, DeviceRegistry};

use crate::{error::CaptureError, types::Frame};

const CAPTURE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConstraints {
    pub device_index: u32,
    pub facing_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Consecutive failed reads after which the stream counts as lost.
    pub max_read_failures: u32,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device_index: 0,
            facing_mode: FacingMode::User,
            ideal_width: 640,
            ideal_height: 480,
            max_read_failures: 50,
        }
    }
}

impl CameraConstraints {
    /// Key under which the device is claimed in the [`DeviceRegistry`].
    pub fn device_key(&self) -> String {
        format!("camera:{}", self.device_index)
    }
}

#[derive(Debug)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An open camera stream. Lives on the capture thread for its whole life.
pub trait StreamHandle {
    fn get_frame(&mut self) -> anyhow::Result<RgbaFrame>;
    fn release(&mut self) -> anyhow::Result<()>;
}

/// Grants access to a physical camera.
pub trait CameraBackend: Send + Sync + 'static {
    fn request_access(
        &self,
        constraints: &CameraConstraints,
    ) -> Result<Box<dyn StreamHandle>, CaptureError>;
}

/// Pull-based source of the most recent camera frame.
pub trait FrameSource: Send + Sync {
    /// Acquires the device. A no-op while already streaming.
    fn start(&self) -> Result<(), CaptureError>;
    /// Releases the device. Idempotent; also cancels a `start` in progress.
    fn stop(&self);
    /// Latest captured frame, `None` until the first one arrives.
    fn current_frame(&self) -> Option<Frame>;
    /// `Err` once a started stream has died and will deliver no more frames.
    fn health(&self) -> Result<(), CaptureError> {
        Ok(())
    }
}

#[derive(Debug)]
struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureWorker {
    fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
enum CaptureState {
    Idle,
    Starting { stop: Arc<AtomicBool> },
    Streaming(CaptureWorker),
}

/// [`FrameSource`] over any [`CameraBackend`], holding a registry claim on the
/// device for as long as the capture thread runs.
pub struct CameraFrameSource<B: CameraBackend> {
    backend: Arc<B>,
    constraints: CameraConstraints,
    registry: Arc<DeviceRegistry>,
    state: Mutex<CaptureState>,
    latest: Arc<Mutex<Option<Frame>>>,
    fault: Arc<Mutex<Option<CaptureError>>>,
}

impl<B: CameraBackend> CameraFrameSource<B> {
    pub fn new(backend: B, constraints: CameraConstraints) -> Self {
        Self::with_registry(backend, constraints, DeviceRegistry::global())
    }

    pub fn with_registry(
        backend: B,
        constraints: CameraConstraints,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            backend: Arc::new(backend),
            constraints,
            registry,
            state: Mutex::new(CaptureState::Idle),
            latest: Arc::new(Mutex::new(None)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(*self.state.lock(), CaptureState::Streaming(_))
    }

    fn spawn_capture(
        &self,
        claim: DeviceClaim,
        stop: Arc<AtomicBool>,
    ) -> Result<CaptureWorker, CaptureError> {
        let (ready_tx, ready_rx) = bounded(1);
        let backend = Arc::clone(&self.backend);
        let constraints = self.constraints.clone();
        let latest = Arc::clone(&self.latest);
        let fault = Arc::clone(&self.fault);
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("frame-capture".into())
            .spawn(move || {
                let mut stream = match backend.request_access(&constraints) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let outcome =
                    capture_loop(stream.as_mut(), &stop_flag, &latest, constraints.max_read_failures);
                if let Err(err) = stream.release() {
                    log::warn!("failed to release camera stream: {err:?}");
                }
                drop(claim);
                // Reported only after the device is free again.
                if let Err(err) = outcome {
                    log::error!("camera {} lost: {err}", constraints.device_key());
                    *fault.lock() = Some(err);
                }
            })
            .map_err(|err| {
                CaptureError::DeviceUnavailable(format!("failed to spawn capture thread: {err}"))
            })?;

        let worker = CaptureWorker {
            stop,
            handle: Some(handle),
        };
        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(CaptureError::DeviceUnavailable(
                "capture thread exited before opening the camera".into(),
            ))
        });
        match ready {
            Ok(()) => Ok(worker),
            Err(err) => {
                worker.shutdown();
                Err(err)
            }
        }
    }
}

/// Runs until stopped, or until `max_failures` reads in a row have failed.
fn capture_loop(
    stream: &mut dyn StreamHandle,
    stop: &AtomicBool,
    latest: &Mutex<Option<Frame>>,
    max_failures: u32,
) -> Result<(), CaptureError> {
    let mut sequence = 0u64;
    let mut failures = 0u32;
    while !stop.load(Ordering::Relaxed) {
        match stream.get_frame() {
            Ok(raw) => {
                failures = 0;
                sequence += 1;
                let frame = Frame::new(raw.rgba, raw.width, raw.height, sequence);
                *latest.lock() = Some(frame);
            }
            Err(err) => {
                failures += 1;
                log::warn!("camera frame read failed ({failures} in a row): {err:?}");
                if failures >= max_failures.max(1) {
                    return Err(CaptureError::DeviceUnavailable(format!(
                        "{failures} consecutive frame reads failed: {err}"
                    )));
                }
                thread::sleep(CAPTURE_ERROR_BACKOFF);
            }
        }
    }
    Ok(())
}

impl<B: CameraBackend> FrameSource for CameraFrameSource<B> {
    fn start(&self) -> Result<(), CaptureError> {
        let stop = {
            let mut state = self.state.lock();
            match *state {
                CaptureState::Streaming(_) => return Ok(()),
                CaptureState::Starting { .. } => {
                    return Err(CaptureError::DeviceUnavailable(
                        "camera start already in progress".into(),
                    ));
                }
                CaptureState::Idle => {}
            }
            *self.fault.lock() = None;
            let stop = Arc::new(AtomicBool::new(false));
            *state = CaptureState::Starting {
                stop: Arc::clone(&stop),
            };
            stop
        };

        let result = self
            .registry
            .claim(&self.constraints.device_key())
            .and_then(|claim| self.spawn_capture(claim, Arc::clone(&stop)));

        let mut state = self.state.lock();
        match result {
            Ok(worker) if stop.load(Ordering::SeqCst) => {
                *state = CaptureState::Idle;
                drop(state);
                worker.shutdown();
                log::debug!("camera start cancelled by a concurrent stop");
                Err(CaptureError::Cancelled)
            }
            Ok(worker) => {
                *state = CaptureState::Streaming(worker);
                log::info!("camera {} streaming", self.constraints.device_key());
                Ok(())
            }
            Err(err) => {
                *state = CaptureState::Idle;
                Err(err)
            }
        }
    }

    fn stop(&self) {
        let worker = {
            let mut state = self.state.lock();
            if let CaptureState::Starting { stop } = &*state {
                // The starting thread sees the flag and releases what it acquired.
                stop.store(true, Ordering::SeqCst);
                None
            } else if let CaptureState::Streaming(worker) =
                std::mem::replace(&mut *state, CaptureState::Idle)
            {
                Some(worker)
            } else {
                None
            }
        };
        if let Some(worker) = worker {
            worker.shutdown();
            log::info!("camera {} stopped", self.constraints.device_key());
        }
        *self.latest.lock() = None;
    }

    fn current_frame(&self) -> Option<Frame> {
        self.latest.lock().clone()
    }

    fn health(&self) -> Result<(), CaptureError> {
        match self.fault.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<B: CameraBackend> Drop for CameraFrameSource<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
