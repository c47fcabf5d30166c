use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{after, never, select, tick};
use limb_tracker::{
    DetectorKind, LandmarkSet, ModelComplexity, PipelineConfig, SchedulerConfig,
    pipeline::{
        CameraConstraints, CameraFrameSource, DetectorBackend, LandmarksCallback, NokhwaBackend,
        OverlayStyle, PipelineController, PipelineParts, PipelineStatus, available_cameras,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Body pose with arm and hand joints marked.
    Arm,
    /// Up to `--max-hands` hand skeletons.
    Hand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Complexity {
    Low,
    Mid,
    High,
}

impl From<Complexity> for ModelComplexity {
    fn from(value: Complexity) -> Self {
        match value {
            Complexity::Low => ModelComplexity::Low,
            Complexity::Mid => ModelComplexity::Mid,
            Complexity::High => ModelComplexity::High,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live arm and hand landmark tracking from a webcam", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Arm)]
    mode: Mode,

    /// Draw the raw camera frame instead of the skeleton overlay.
    #[arg(long)]
    no_overlay: bool,

    #[arg(long, value_name = "INDEX", default_value_t = 0)]
    camera: u32,

    #[arg(long, value_name = "DIR", default_value = "models")]
    model_dir: PathBuf,

    #[arg(long, default_value_t = 0.5)]
    detection_confidence: f32,

    #[arg(long, default_value_t = 0.5)]
    tracking_confidence: f32,

    #[arg(long, default_value_t = 2)]
    max_hands: usize,

    #[arg(long, value_enum, default_value_t = Complexity::Mid)]
    complexity: Complexity,

    /// Write PNG snapshots of the overlay here.
    #[arg(long, value_name = "DIR")]
    snapshot_dir: Option<PathBuf>,

    #[arg(long, value_name = "SECS", default_value_t = 5)]
    snapshot_every: u64,

    /// Rebuild the pipeline with the overlay flipped every SECS seconds.
    #[arg(long, value_name = "SECS")]
    toggle_overlay_every: Option<u64>,

    #[arg(long)]
    list_cameras: bool,

    /// Stop after SECS seconds; runs until failure otherwise.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,
}

impl Args {
    fn kind(&self) -> DetectorKind {
        match self.mode {
            Mode::Arm => DetectorKind::Pose,
            Mode::Hand => DetectorKind::Hand,
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            overlay_enabled: !self.no_overlay,
            detection_confidence: self.detection_confidence,
            tracking_confidence: self.tracking_confidence,
            max_subjects: self.max_hands,
            model_complexity: self.complexity.into(),
        }
    }

    fn parts(&self, config: PipelineConfig) -> PipelineParts {
        let kind = self.kind();
        let backend = DetectorBackend::Ort {
            model_dir: self.model_dir.clone(),
        };
        let constraints = CameraConstraints {
            device_index: self.camera,
            ..CameraConstraints::default()
        };
        let style = match self.mode {
            Mode::Arm => OverlayStyle::arm_focus(),
            Mode::Hand => OverlayStyle::default(),
        };
        PipelineParts {
            kind,
            config,
            source: Arc::new(CameraFrameSource::new(NokhwaBackend, constraints)),
            loader: backend.loader(kind),
            // Selfie view.
            style: OverlayStyle {
                mirror: true,
                ..style
            },
            scheduler: SchedulerConfig::default(),
        }
    }
}

enum Event {
    Status(Option<PipelineStatus>),
    Snapshot,
    ToggleOverlay,
    Stop,
}

fn landmark_logger(kind: DetectorKind) -> LandmarksCallback {
    Box::new(move |set: &LandmarkSet| match kind {
        DetectorKind::Pose => match set.pose() {
            Some(pose) => log::info!("pose landmarks: {}", pose.landmarks.len()),
            None => log::debug!("no pose in frame"),
        },
        DetectorKind::Hand => {
            for hand in set.hands() {
                log::info!(
                    "{} hand landmarks: {} (score {:.2})",
                    hand.handedness.map(|h| h.label()).unwrap_or("unknown"),
                    hand.landmarks.len(),
                    hand.score
                );
            }
        }
    })
}

fn save_snapshot(controller: &PipelineController, dir: &Path, index: u64) -> Result<()> {
    let surface = controller.surface();
    let surface = surface.lock();
    if surface.dimensions() == (0, 0) {
        log::debug!("nothing rendered yet, skipping snapshot");
        return Ok(());
    }
    let path = dir.join(format!("overlay-{index:05}.png"));
    surface.save(&path)?;
    log::info!("saved snapshot {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_cameras {
        let cameras = available_cameras().context("failed to query cameras")?;
        if cameras.is_empty() {
            println!("no cameras found");
        }
        for camera in cameras {
            println!("{}: {}", camera.index, camera.label);
        }
        return Ok(());
    }

    let mut config = args.config();
    config.validate()?;
    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create snapshot directory {}", dir.display()))?;
    }

    let kind = args.kind();
    log::info!(
        "starting {} tracking on camera {} (overlay {})",
        kind.label(),
        args.camera,
        if config.overlay_enabled { "on" } else { "off" }
    );
    let mut controller =
        PipelineController::new(args.parts(config.clone()), Some(landmark_logger(kind)));
    let mut statuses = controller.watch_status();

    let snapshots = match &args.snapshot_dir {
        Some(_) => tick(Duration::from_secs(args.snapshot_every.max(1))),
        None => never(),
    };
    let toggles = match args.toggle_overlay_every {
        Some(secs) => tick(Duration::from_secs(secs.max(1))),
        None => never(),
    };
    let deadline = match args.duration {
        Some(secs) => after(Duration::from_secs(secs)),
        None => never(),
    };
    let started = Instant::now();
    let mut snapshot_index = 0;

    loop {
        let event = select! {
            recv(statuses) -> status => Event::Status(status.ok()),
            recv(snapshots) -> _ => Event::Snapshot,
            recv(toggles) -> _ => Event::ToggleOverlay,
            recv(deadline) -> _ => Event::Stop,
        };
        match event {
            Event::Status(Some(PipelineStatus::Failed(reason))) => {
                controller.dispose().wait();
                bail!("pipeline failed: {reason}");
            }
            Event::Status(Some(status)) => log::info!("pipeline status: {status:?}"),
            Event::Status(None) | Event::Stop => break,
            Event::Snapshot => {
                if let Some(dir) = &args.snapshot_dir {
                    snapshot_index += 1;
                    if let Err(err) = save_snapshot(&controller, dir, snapshot_index) {
                        log::warn!("{err:#}");
                    }
                }
            }
            Event::ToggleOverlay => {
                config = config.with_overlay(!config.overlay_enabled);
                log::info!(
                    "rebuilding pipeline with overlay {}",
                    if config.overlay_enabled { "on" } else { "off" }
                );
                controller = PipelineController::rebuild(
                    controller,
                    args.parts(config.clone()),
                    Some(landmark_logger(kind)),
                );
                statuses = controller.watch_status();
            }
        }
    }

    controller.dispose().wait();
    log::info!("stopped after {:.1?}", started.elapsed());
    Ok(())
}
