use std::{sync::Arc, thread, time::Duration};

use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, never, select, tick, unbounded,
};
use parking_lot::Mutex;

use super::{
    camera::FrameSource,
    detector::{DetectorOptions, EngineLoader, LandmarkDetector, ResultCallback},
    overlay::{OverlayRenderer, OverlayStyle, Surface},
    pending::{CancellationToken, Pending},
    scheduler::{FrameScheduler, TickOutcome},
};
use crate::{
    config::{PipelineConfig, SchedulerConfig},
    error::{CaptureError, InitError, PipelineError},
    types::{DetectorKind, Frame, LandmarkSet},
};

/// Consumer hook fired once per successful detection, after rendering.
pub type LandmarksCallback = Box<dyn FnMut(&LandmarkSet) + Send>;

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    Running,
    Failed(PipelineError),
    Disposed,
}

/// The consumer-facing view of [`PipelineState`].
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineStatus {
    Loading,
    Running,
    Failed(PipelineError),
}

impl PipelineState {
    /// `None` for `Disposed`, which keeps whatever status was last reported.
    fn status(&self) -> Option<PipelineStatus> {
        match self {
            PipelineState::Uninitialized | PipelineState::Initializing => {
                Some(PipelineStatus::Loading)
            }
            PipelineState::Running => Some(PipelineStatus::Running),
            PipelineState::Failed(err) => Some(PipelineStatus::Failed(err.clone())),
            PipelineState::Disposed => None,
        }
    }
}

/// Everything one pipeline instance is built from.
pub struct PipelineParts {
    pub kind: DetectorKind,
    pub config: PipelineConfig,
    pub source: Arc<dyn FrameSource>,
    pub loader: EngineLoader,
    pub style: OverlayStyle,
    pub scheduler: SchedulerConfig,
}

struct StatusCell {
    state: PipelineState,
    status: PipelineStatus,
    watchers: Vec<Sender<PipelineStatus>>,
}

#[derive(Clone)]
struct SharedStatus(Arc<Mutex<StatusCell>>);

impl SharedStatus {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(StatusCell {
            state: PipelineState::Uninitialized,
            status: PipelineStatus::Loading,
            watchers: Vec::new(),
        })))
    }

    /// Moves to `next` unless the pipeline is already disposed.
    fn transition(&self, next: PipelineState) -> bool {
        let mut cell = self.0.lock();
        if cell.state == PipelineState::Disposed {
            return false;
        }
        log::debug!("pipeline {:?} -> {:?}", cell.state, next);
        let status = next.status();
        cell.state = next;
        if let Some(status) = status {
            if status != cell.status {
                cell.status = status.clone();
                cell.watchers.retain(|tx| tx.send(status.clone()).is_ok());
            }
        }
        true
    }
}

/// Awaitable completion of a pipeline's teardown.
#[derive(Clone, Debug)]
pub struct DisposalHandle {
    done: Receiver<()>,
}

impl DisposalHandle {
    /// Blocks until every resource has been released. Must not be called
    /// from inside a landmarks callback.
    pub fn wait(&self) {
        let _ = self.done.recv();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }
}

/// One camera → detector → overlay pipeline with a single lifecycle.
///
/// Construction starts a `pipeline` thread that brings up the detector and
/// the frame source, then schedules detections until disposal or failure.
pub struct PipelineController {
    kind: DetectorKind,
    config: PipelineConfig,
    token: CancellationToken,
    status: SharedStatus,
    surface: Arc<Mutex<Surface>>,
    wake: Sender<()>,
    done: Receiver<()>,
}

impl PipelineController {
    pub fn new(parts: PipelineParts, on_landmarks: Option<LandmarksCallback>) -> Self {
        let token = CancellationToken::new();
        let status = SharedStatus::new();
        let surface = Arc::new(Mutex::new(Surface::default()));
        let (wake_tx, wake_rx) = bounded(1);
        let (done_tx, done_rx) = bounded::<()>(0);
        let kind = parts.kind;
        let config = parts.config.clone();

        let lifecycle = Lifecycle {
            token: token.clone(),
            status: status.clone(),
            surface: Arc::clone(&surface),
            wake: wake_rx,
            _done: done_tx,
        };
        let spawned = thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || lifecycle.run(parts, on_landmarks));
        if let Err(err) = spawned {
            log::error!("failed to spawn pipeline thread: {err}");
            status.transition(PipelineState::Failed(PipelineError::Init(InitError::WorkerGone)));
        }

        Self {
            kind,
            config,
            token,
            status,
            surface,
            wake: wake_tx,
            done: done_rx,
        }
    }

    /// Disposes `old`, waits for its resources, then builds the replacement.
    pub fn rebuild(
        old: PipelineController,
        parts: PipelineParts,
        on_landmarks: Option<LandmarksCallback>,
    ) -> Self {
        old.dispose().wait();
        drop(old);
        Self::new(parts, on_landmarks)
    }

    pub fn kind(&self) -> DetectorKind {
        self.kind
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.status.0.lock().state.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.0.lock().status.clone()
    }

    /// Receives the current status right away, then every change.
    pub fn watch_status(&self) -> Receiver<PipelineStatus> {
        let (tx, rx) = unbounded();
        let mut cell = self.status.0.lock();
        let _ = tx.send(cell.status.clone());
        cell.watchers.push(tx);
        rx
    }

    pub fn surface(&self) -> Arc<Mutex<Surface>> {
        Arc::clone(&self.surface)
    }

    /// Idempotent and non-blocking; safe from any thread, including the
    /// landmarks callback.
    pub fn dispose(&self) -> DisposalHandle {
        if self.token.cancel() {
            self.status.transition(PipelineState::Disposed);
            let _ = self.wake.try_send(());
            log::info!("{} pipeline disposing", self.kind.label());
        }
        DisposalHandle {
            done: self.done.clone(),
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct Lifecycle {
    token: CancellationToken,
    status: SharedStatus,
    surface: Arc<Mutex<Surface>>,
    wake: Receiver<()>,
    // Dropped when the thread exits, which completes every DisposalHandle.
    _done: Sender<()>,
}

enum Startup {
    Detector(Result<(), InitError>),
    Source(Result<(), CaptureError>),
}

/// Why the run loop ended.
enum Exit {
    Disposed,
    Failed(PipelineError),
}

impl Lifecycle {
    fn run(self, parts: PipelineParts, on_landmarks: Option<LandmarksCallback>) {
        let PipelineParts {
            kind,
            config,
            source,
            loader,
            style,
            scheduler,
        } = parts;

        let mut detector = LandmarkDetector::new(kind, loader);
        let sink = self.render_sink(OverlayRenderer::new(style), config.clone(), on_landmarks);
        detector.on_result(sink);
        let mut scheduler = FrameScheduler::new(scheduler).with_cancellation(self.token.clone());
        let mut starter = None;

        let exit = if self.status.transition(PipelineState::Initializing) {
            let init = detector.initialize(DetectorOptions::from_config(kind, &config));
            let (started, handle) = spawn_start(Arc::clone(&source));
            starter = handle;
            match self.await_ready(&init, &started) {
                Some(exit) => exit,
                None => self.schedule(&mut scheduler, source.as_ref(), &mut detector),
            }
        } else {
            Exit::Disposed
        };

        if let Exit::Failed(err) = &exit {
            log::error!("{} pipeline failed: {err}", kind.label());
            self.status.transition(PipelineState::Failed(err.clone()));
        }

        scheduler.stop();
        detector.dispose();
        source.stop();
        if let Some(handle) = starter {
            if handle.join().is_err() {
                log::error!("frame source start thread panicked");
            }
        }
        log::info!("{} pipeline resources released", kind.label());

        if matches!(exit, Exit::Failed(_)) {
            // Failed is terminal but still needs an explicit dispose.
            let _ = self.wake.recv();
        }
    }

    /// Waits for both the detector and the frame source. `None` once both
    /// are up and the pipeline is still live.
    fn await_ready(
        &self,
        init: &Pending<Result<(), InitError>>,
        started: &Pending<Result<(), CaptureError>>,
    ) -> Option<Exit> {
        let mut init_rx = init.receiver().clone();
        let mut started_rx = started.receiver().clone();
        let mut detector_ready = false;
        let mut source_ready = false;
        while !(detector_ready && source_ready) {
            let event = select! {
                recv(self.wake) -> _ => return Some(Exit::Disposed),
                recv(init_rx) -> msg => Startup::Detector(msg.unwrap_or(Err(InitError::WorkerGone))),
                recv(started_rx) -> msg => Startup::Source(msg.unwrap_or_else(|_| {
                    Err(CaptureError::DeviceUnavailable(
                        "frame source start thread exited".into(),
                    ))
                })),
            };
            if self.token.is_cancelled() {
                log::debug!("startup finished after dispose; ignoring");
                return Some(Exit::Disposed);
            }
            match event {
                Startup::Detector(Ok(())) => {
                    detector_ready = true;
                    init_rx = never();
                }
                Startup::Source(Ok(())) => {
                    source_ready = true;
                    started_rx = never();
                }
                Startup::Detector(Err(err)) => return Some(Exit::Failed(err.into())),
                Startup::Source(Err(err)) => return Some(Exit::Failed(err.into())),
            }
        }
        None
    }

    fn schedule(
        &self,
        scheduler: &mut FrameScheduler,
        source: &dyn FrameSource,
        detector: &mut LandmarkDetector,
    ) -> Exit {
        if !self.status.transition(PipelineState::Running) {
            return Exit::Disposed;
        }
        log::info!("{} pipeline running", detector.kind().label());

        let ticker = tick(scheduler.config().tick_interval);
        loop {
            select! {
                recv(self.wake) -> _ => return Exit::Disposed,
                recv(ticker) -> _ => {
                    if self.token.is_cancelled() {
                        return Exit::Disposed;
                    }
                    if let Err(err) = source.health() {
                        return Exit::Failed(PipelineError::Capture(err));
                    }
                    match scheduler.tick(source, detector) {
                        TickOutcome::Stopped => return Exit::Disposed,
                        TickOutcome::Exhausted(_) if self.token.is_cancelled() => {
                            return Exit::Disposed;
                        }
                        TickOutcome::Exhausted(err) => {
                            return Exit::Failed(PipelineError::Detection(err));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Renders each detection and forwards it to the consumer while live.
    fn render_sink(
        &self,
        renderer: OverlayRenderer,
        config: PipelineConfig,
        mut on_landmarks: Option<LandmarksCallback>,
    ) -> ResultCallback {
        let token = self.token.clone();
        let surface = Arc::clone(&self.surface);
        Box::new(move |frame: &Frame, set: &LandmarkSet| {
            if token.is_cancelled() {
                log::debug!("dropping result for frame {} after dispose", frame.sequence);
                return;
            }
            let summary = renderer.render(&mut surface.lock(), frame, Some(set), &config);
            log::trace!("frame {} rendered: {summary:?}", frame.sequence);
            if let Some(callback) = on_landmarks.as_mut() {
                callback(set);
            }
        })
    }
}

/// Starts the source off the lifecycle thread so disposal can interrupt it.
fn spawn_start(
    source: Arc<dyn FrameSource>,
) -> (Pending<Result<(), CaptureError>>, Option<thread::JoinHandle<()>>) {
    let (resolver, pending) = Pending::channel(|| {
        Err(CaptureError::DeviceUnavailable(
            "frame source start thread exited".into(),
        ))
    });
    let spawned = thread::Builder::new()
        .name("frame-source-start".into())
        .spawn(move || resolver.resolve(source.start()));
    match spawned {
        Ok(handle) => (pending, Some(handle)),
        Err(err) => {
            log::error!("failed to spawn frame source start thread: {err}");
            (pending, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;
    use crate::pipeline::{
        camera::{
            CameraConstraints, CameraFrameSource, DeviceRegistry,
            mock::{MockCamera, MockCounters},
        },
        detector::mock::{EngineStats, MockEngine, failing_loader, loader},
    };

    struct Harness {
        registry: Arc<DeviceRegistry>,
        camera: Arc<MockCounters>,
        engine: Arc<EngineStats>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: DeviceRegistry::new(),
                camera: Arc::new(MockCounters::default()),
                engine: Arc::new(EngineStats::default()),
            }
        }

        fn parts_with(&self, kind: DetectorKind, camera: MockCamera, engine: MockEngine) -> PipelineParts {
            let camera = MockCamera {
                counters: Arc::clone(&self.camera),
                ..camera
            };
            PipelineParts {
                kind,
                config: PipelineConfig::default(),
                source: Arc::new(CameraFrameSource::with_registry(
                    camera,
                    CameraConstraints::default(),
                    Arc::clone(&self.registry),
                )),
                loader: loader(engine),
                style: OverlayStyle::default(),
                scheduler: SchedulerConfig {
                    tick_interval: Duration::from_millis(2),
                    ..SchedulerConfig::default()
                },
            }
        }

        fn parts(&self, kind: DetectorKind) -> PipelineParts {
            self.parts_with(
                kind,
                MockCamera::new(),
                MockEngine::new(kind, Arc::clone(&self.engine)),
            )
        }
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn counting_callback() -> (Arc<AtomicUsize>, LandmarksCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        (
            count,
            Box::new(move |_set: &LandmarkSet| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn running_pipeline_renders_and_notifies() {
        let harness = Harness::new();
        let (count, callback) = counting_callback();
        let controller = PipelineController::new(harness.parts(DetectorKind::Pose), Some(callback));
        let statuses = controller.watch_status();

        wait_for("landmarks", || count.load(Ordering::SeqCst) >= 3);
        assert_eq!(controller.status(), PipelineStatus::Running);
        assert_eq!(statuses.try_iter().last(), Some(PipelineStatus::Running));
        assert_eq!(controller.surface().lock().dimensions(), (8, 6));
        assert_eq!(harness.engine.max_concurrent(), 1);

        controller.dispose().wait();
        assert_eq!(controller.state(), PipelineState::Disposed);
        assert_eq!(harness.engine.released(), 1);
        assert_eq!(harness.camera.released(), 1);
        assert!(!harness.registry.is_claimed("camera:0"));
    }

    #[test]
    fn raw_frames_render_when_overlay_disabled() {
        let harness = Harness::new();
        let mut parts = harness.parts(DetectorKind::Hand);
        parts.config = PipelineConfig::default().with_overlay(false);
        let (count, callback) = counting_callback();
        let controller = PipelineController::new(parts, Some(callback));
        wait_for("landmarks", || count.load(Ordering::SeqCst) >= 1);

        // Raw frames from the mock camera are never the stylized background.
        let pixel = *controller.surface().lock().image().get_pixel(0, 0);
        assert_ne!(pixel.0, OverlayStyle::default().background);
        controller.dispose().wait();
    }

    #[test]
    fn permission_denied_fails_without_detecting() {
        let harness = Harness::new();
        let parts = harness.parts_with(
            DetectorKind::Pose,
            MockCamera::denying(CaptureError::PermissionDenied("user said no".into())),
            MockEngine::new(DetectorKind::Pose, Arc::clone(&harness.engine)),
        );
        let controller = PipelineController::new(parts, None);

        wait_for("failure", || matches!(controller.status(), PipelineStatus::Failed(_)));
        assert_eq!(
            controller.status(),
            PipelineStatus::Failed(PipelineError::Capture(CaptureError::PermissionDenied(
                "user said no".into()
            )))
        );
        wait_for("engine release", || harness.engine.released() == 1);
        assert_eq!(harness.engine.calls(), 0);

        controller.dispose().wait();
        assert_eq!(controller.state(), PipelineState::Disposed);
        assert_eq!(harness.engine.calls(), 0);
    }

    #[test]
    fn init_failure_surfaces_and_releases_camera() {
        let harness = Harness::new();
        let mut parts = harness.parts(DetectorKind::Hand);
        parts.loader = failing_loader(InitError::AssetUnavailable("offline".into()));
        let controller = PipelineController::new(parts, None);

        wait_for("failure", || matches!(controller.status(), PipelineStatus::Failed(_)));
        assert_eq!(
            controller.status(),
            PipelineStatus::Failed(PipelineError::Init(InitError::AssetUnavailable(
                "offline".into()
            )))
        );
        wait_for("camera release", || !harness.registry.is_claimed("camera:0"));
        controller.dispose().wait();
    }

    #[test]
    fn dispose_is_idempotent_and_concurrent_safe() {
        let harness = Harness::new();
        let controller = Arc::new(PipelineController::new(harness.parts(DetectorKind::Pose), None));
        wait_for("running", || controller.status() == PipelineStatus::Running);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let controller = Arc::clone(&controller);
                thread::spawn(move || controller.dispose().wait())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        controller.dispose().wait();

        assert!(controller.dispose().is_complete());
        assert_eq!(harness.engine.released(), 1);
        assert_eq!(harness.camera.acquired(), 1);
        assert_eq!(harness.camera.released(), 1);
    }

    #[test]
    fn dispose_during_startup_releases_everything() {
        let harness = Harness::new();
        let parts = harness.parts_with(
            DetectorKind::Pose,
            MockCamera::slow(Duration::from_millis(50)),
            MockEngine::new(DetectorKind::Pose, Arc::clone(&harness.engine)),
        );
        let controller = PipelineController::new(parts, None);
        thread::sleep(Duration::from_millis(10));
        assert!(controller.dispose().wait_timeout(Duration::from_secs(3)));

        assert_eq!(controller.state(), PipelineState::Disposed);
        assert_eq!(harness.engine.calls(), 0);
        assert_eq!(harness.camera.acquired(), harness.camera.released());
        assert!(!harness.registry.is_claimed("camera:0"));
    }

    #[test]
    fn no_callback_after_dispose_returns() {
        let harness = Harness::new();
        let (gate_tx, gate_rx) = bounded(1);
        let mut engine = MockEngine::new(DetectorKind::Pose, Arc::clone(&harness.engine));
        engine.gate = Some(gate_rx);
        let parts = harness.parts_with(DetectorKind::Pose, MockCamera::new(), engine);
        let (count, callback) = counting_callback();
        let controller = PipelineController::new(parts, Some(callback));

        // A detection is now blocked inside the engine.
        wait_for("submit", || harness.engine.calls() == 1);
        let handle = controller.dispose();
        gate_tx.send(()).unwrap();
        handle.wait();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(harness.engine.released(), 1);
    }

    #[test]
    fn dispose_from_inside_callback_does_not_deadlock() {
        let harness = Harness::new();
        let slot: Arc<Mutex<Option<Arc<PipelineController>>>> = Arc::new(Mutex::new(None));
        let hook = Arc::clone(&slot);
        let callback: LandmarksCallback = Box::new(move |_set: &LandmarkSet| {
            if let Some(controller) = hook.lock().as_ref() {
                controller.dispose();
            }
        });
        let controller = Arc::new(PipelineController::new(
            harness.parts(DetectorKind::Hand),
            Some(callback),
        ));
        *slot.lock() = Some(Arc::clone(&controller));

        wait_for("self-dispose", || controller.state() == PipelineState::Disposed);
        assert!(controller.dispose().wait_timeout(Duration::from_secs(3)));
        slot.lock().take();
        assert_eq!(harness.engine.released(), 1);
    }

    #[test]
    fn rebuild_reacquires_the_device() {
        let harness = Harness::new();
        let first = PipelineController::new(harness.parts(DetectorKind::Pose), None);
        wait_for("running", || first.status() == PipelineStatus::Running);

        let second = PipelineController::rebuild(first, harness.parts(DetectorKind::Hand), None);
        wait_for("rebuilt", || second.status() == PipelineStatus::Running);
        assert_eq!(second.kind(), DetectorKind::Hand);
        assert_eq!(harness.camera.acquired(), 2);
        assert_eq!(harness.camera.max_live(), 1);
        second.dispose().wait();
    }

    #[test]
    fn lost_camera_fails_running_pipeline_and_releases_everything() {
        let harness = Harness::new();
        let parts = harness.parts_with(
            DetectorKind::Hand,
            MockCamera::unplugged_after(20),
            MockEngine::new(DetectorKind::Hand, Arc::clone(&harness.engine)),
        );
        let controller = PipelineController::new(parts, None);
        let statuses = controller.watch_status();

        wait_for("failure", || matches!(controller.status(), PipelineStatus::Failed(_)));
        assert!(matches!(
            controller.status(),
            PipelineStatus::Failed(PipelineError::Capture(CaptureError::DeviceUnavailable(_)))
        ));
        let seen: Vec<_> = statuses.try_iter().collect();
        assert!(seen.contains(&PipelineStatus::Running));
        wait_for("engine release", || harness.engine.released() == 1);
        assert_eq!(harness.camera.released(), 1);
        assert!(!harness.registry.is_claimed("camera:0"));

        controller.dispose().wait();
        assert_eq!(controller.state(), PipelineState::Disposed);
    }

    #[test]
    fn repeated_detection_failures_fail_the_pipeline() {
        let harness = Harness::new();
        let mut engine = MockEngine::new(DetectorKind::Pose, Arc::clone(&harness.engine));
        engine.fail = true;
        let mut parts = harness.parts_with(DetectorKind::Pose, MockCamera::new(), engine);
        parts.scheduler.max_consecutive_failures = 3;
        let controller = PipelineController::new(parts, None);

        wait_for("failure", || matches!(controller.status(), PipelineStatus::Failed(_)));
        assert!(matches!(
            controller.status(),
            PipelineStatus::Failed(PipelineError::Detection(_))
        ));
        controller.dispose().wait();
    }
}
