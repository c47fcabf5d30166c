//! Camera frames in, body or hand landmarks out, drawn onto an overlay.

pub mod config;
pub mod error;
pub mod model_download;
pub mod pipeline;
pub mod types;

pub use config::{ModelComplexity, PipelineConfig, SchedulerConfig};
pub use error::{CaptureError, ConfigError, DetectionError, InitError, PipelineError};
pub use types::{DetectorKind, Frame, Handedness, Landmark, LandmarkSet, Skeleton};
