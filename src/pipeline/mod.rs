pub mod camera;
pub mod controller;
pub mod detector;
pub mod overlay;
pub mod pending;
pub mod rgba_converter;
pub mod scheduler;
pub mod skeleton;

// Re-exports for convenience
#[cfg(feature = "camera-nokhwa")]
pub use camera::native::{CameraDevice, NokhwaBackend, available_cameras};
pub use camera::{CameraBackend, CameraConstraints, CameraFrameSource, DeviceRegistry, FrameSource};
pub use controller::{
    DisposalHandle, LandmarksCallback, PipelineController, PipelineParts, PipelineState,
    PipelineStatus,
};
pub use detector::{DetectorBackend, DetectorOptions, LandmarkDetector, LandmarkEngine};
pub use overlay::{OverlayRenderer, OverlayStyle, RenderSummary, Surface};
pub use pending::{CancellationToken, Pending};
pub use scheduler::{FrameScheduler, SchedulerStats, TickOutcome};
