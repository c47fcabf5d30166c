pub mod common;
pub mod hand;
pub mod palm;
pub mod pose;

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;

use super::pending::{CancellationToken, Pending, Resolver};
use crate::{
    config::{ModelComplexity, PipelineConfig},
    error::{DetectionError, InitError},
    model_download::{self, ModelAsset},
    types::{DetectorKind, Frame, LandmarkSet},
};

/// The opaque landmark model: image in, normalized landmarks out.
pub trait LandmarkEngine: Send {
    fn infer(&mut self, frame: &Frame) -> anyhow::Result<LandmarkSet>;

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds an engine on the detector's worker thread.
pub type EngineLoader =
    Box<dyn FnOnce(&DetectorOptions) -> Result<Box<dyn LandmarkEngine>, InitError> + Send>;

/// Push channel for successful detections.
pub type ResultCallback = Box<dyn FnMut(&Frame, &LandmarkSet) + Send>;

pub type InitResult = Result<(), InitError>;
pub type DetectionResult = Result<LandmarkSet, DetectionError>;

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorOptions {
    pub kind: DetectorKind,
    pub detection_confidence: f32,
    pub tracking_confidence: f32,
    pub max_subjects: usize,
    pub model_complexity: ModelComplexity,
}

impl DetectorOptions {
    pub fn from_config(kind: DetectorKind, config: &PipelineConfig) -> Self {
        Self {
            kind,
            detection_confidence: config.detection_confidence,
            tracking_confidence: config.tracking_confidence,
            max_subjects: match kind {
                DetectorKind::Pose => 1,
                DetectorKind::Hand => config.max_subjects,
            },
            model_complexity: config.model_complexity,
        }
    }
}

/// Where detection engines come from.
#[derive(Clone, Debug)]
pub enum DetectorBackend {
    /// ONNX Runtime models stored under `model_dir`, downloaded on first use.
    Ort { model_dir: PathBuf },
}

impl Default for DetectorBackend {
    fn default() -> Self {
        DetectorBackend::Ort {
            model_dir: model_download::default_model_dir(),
        }
    }
}

impl DetectorBackend {
    pub fn label(&self) -> &'static str {
        match self {
            DetectorBackend::Ort { .. } => "ort",
        }
    }

    pub fn loader(&self, kind: DetectorKind) -> EngineLoader {
        match self {
            DetectorBackend::Ort { model_dir } => {
                let model_dir = model_dir.clone();
                Box::new(move |options: &DetectorOptions| {
                    let assets = ModelAsset::for_detector(kind);
                    for asset in assets {
                        model_download::ensure_model_ready(*asset, &model_dir, |_evt| {})
                            .map_err(|err| InitError::AssetUnavailable(format!("{err:#}")))?;
                    }
                    let engine: Box<dyn LandmarkEngine> = match kind {
                        DetectorKind::Pose => {
                            Box::new(pose::OrtPoseEngine::new(&model_dir, options)?)
                        }
                        DetectorKind::Hand => {
                            Box::new(hand::OrtHandEngine::new(&model_dir, options)?)
                        }
                    };
                    Ok(engine)
                })
            }
        }
    }
}

struct Job {
    frame: Frame,
    reply: Resolver<DetectionResult>,
}

struct Shared {
    token: CancellationToken,
    ready: AtomicBool,
    in_flight: AtomicBool,
    sink: Mutex<Option<ResultCallback>>,
}

/// Owns one detection engine on a dedicated worker thread.
///
/// At most one detection is in flight. Once [`dispose`](Self::dispose) has
/// returned the result callback never runs again and pending detections
/// resolve to [`DetectionError::Disposed`].
pub struct LandmarkDetector {
    kind: DetectorKind,
    loader: Option<EngineLoader>,
    shared: Arc<Shared>,
    jobs: Option<Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl LandmarkDetector {
    pub fn new(kind: DetectorKind, loader: EngineLoader) -> Self {
        Self {
            kind,
            loader: Some(loader),
            shared: Arc::new(Shared {
                token: CancellationToken::new(),
                ready: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                sink: Mutex::new(None),
            }),
            jobs: None,
            worker: None,
        }
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Registers the result channel, replacing any earlier registration.
    pub fn on_result(&mut self, callback: ResultCallback) {
        let mut sink = self.shared.sink.lock();
        if self.shared.token.is_live() {
            *sink = Some(callback);
        }
    }

    /// Loads the engine on the worker thread.
    pub fn initialize(&mut self, options: DetectorOptions) -> Pending<InitResult> {
        let (resolver, pending) = Pending::channel(|| Err(InitError::WorkerGone));
        if self.shared.token.is_cancelled() {
            resolver.resolve(Err(InitError::Disposed));
            return pending;
        }
        let Some(loader) = self.loader.take() else {
            resolver.resolve(Err(InitError::ModelLoad(
                "detector was already initialized".into(),
            )));
            return pending;
        };

        let (job_tx, job_rx) = bounded::<Job>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("landmark-detector".into())
            .spawn(move || run_worker(loader, options, job_rx, resolver, shared));
        match spawned {
            Ok(handle) => {
                self.jobs = Some(job_tx);
                self.worker = Some(handle);
            }
            Err(err) => log::error!("failed to spawn detector worker: {err}"),
        }
        pending
    }

    /// Submits one frame. Rejected while another detection is outstanding.
    pub fn detect(&mut self, frame: Frame) -> Result<Pending<DetectionResult>, DetectionError> {
        if self.shared.token.is_cancelled() {
            return Err(DetectionError::Disposed);
        }
        if !self.is_ready() {
            return Err(DetectionError::NotInitialized);
        }
        let Some(jobs) = self.jobs.as_ref() else {
            return Err(DetectionError::NotInitialized);
        };
        if self.shared.in_flight.swap(true, Ordering::SeqCst) {
            return Err(DetectionError::Busy);
        }

        let (reply, pending) = Pending::channel(|| Err(DetectionError::WorkerGone));
        match jobs.try_send(Job { frame, reply }) {
            Ok(()) => Ok(pending),
            Err(TrySendError::Full(_)) => {
                self.shared.in_flight.store(false, Ordering::SeqCst);
                Err(DetectionError::Busy)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.in_flight.store(false, Ordering::SeqCst);
                Err(DetectionError::WorkerGone)
            }
        }
    }

    /// Idempotent. Blocks until the worker has released the engine.
    pub fn dispose(&mut self) {
        if !self.shared.token.cancel() {
            return;
        }
        // Waits out a callback that is running right now.
        self.shared.sink.lock().take();
        self.jobs.take();
        self.loader.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("{} detector worker panicked", self.kind.label());
            }
        }
        log::info!("{} detector disposed", self.kind.label());
    }
}

impl Drop for LandmarkDetector {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_worker(
    loader: EngineLoader,
    options: DetectorOptions,
    jobs: Receiver<Job>,
    init: Resolver<InitResult>,
    shared: Arc<Shared>,
) {
    let kind = options.kind;
    let mut engine = match loader(&options) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("failed to initialize {} detector: {err}", kind.label());
            init.resolve(Err(err));
            return;
        }
    };

    if shared.token.is_cancelled() {
        release_engine(engine.as_mut(), kind);
        init.resolve(Err(InitError::Disposed));
        return;
    }
    shared.ready.store(true, Ordering::SeqCst);
    log::info!("{} detector ready", kind.label());
    init.resolve(Ok(()));

    while let Ok(Job { frame, reply }) = jobs.recv() {
        let outcome = if shared.token.is_cancelled() {
            Err(DetectionError::Disposed)
        } else {
            engine
                .infer(&frame)
                .map_err(|err| DetectionError::Inference(format!("{err:#}")))
        };

        let outcome = match outcome {
            Ok(set) => deliver(&shared, &frame, set),
            Err(err) => Err(err),
        };
        shared.in_flight.store(false, Ordering::SeqCst);
        reply.resolve(outcome);
    }

    release_engine(engine.as_mut(), kind);
}

fn deliver(shared: &Shared, frame: &Frame, set: LandmarkSet) -> DetectionResult {
    let mut sink = shared.sink.lock();
    if shared.token.is_cancelled() {
        log::debug!("discarding detection for frame {} after dispose", frame.sequence);
        return Err(DetectionError::Disposed);
    }
    if let Some(callback) = sink.as_mut() {
        callback(frame, &set);
    }
    Ok(set)
}

fn release_engine(engine: &mut dyn LandmarkEngine, kind: DetectorKind) {
    if let Err(err) = engine.release() {
        log::warn!("failed to release {} engine: {err:?}", kind.label());
    }
}
