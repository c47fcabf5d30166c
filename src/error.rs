use thiserror::Error;

/// Camera acquisition failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("camera start cancelled by stop")]
    Cancelled,
}

/// Detection capability failed to come up.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("detection asset unavailable: {0}")]
    AssetUnavailable(String),

    #[error("failed to load detection model: {0}")]
    ModelLoad(String),

    #[error("detector disposed before initialization finished")]
    Disposed,

    #[error("detector worker exited before reporting readiness")]
    WorkerGone,
}

/// A single `detect` call failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("detector is not initialized")]
    NotInitialized,

    #[error("detector has been disposed")]
    Disposed,

    #[error("a detection is already in flight")]
    Busy,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("detector worker exited")]
    WorkerGone,
}

/// Reason carried by a failed pipeline.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error("detection kept failing: {0}")]
    Detection(DetectionError),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ConfidenceOutOfRange { name: &'static str, value: f32 },

    #[error("max_subjects must be at least 1")]
    NoSubjects,
}
