use std::{sync::Arc, time::Instant};

use crate::pipeline::skeleton::{HAND_CONNECTIONS, POSE_CONNECTIONS};

pub const POSE_LANDMARK_COUNT: usize = 33;
pub const HAND_LANDMARK_COUNT: usize = 21;

/// One captured RGBA image. Pixels are shared, so cloning a frame is cheap.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgba: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(rgba: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            rgba: rgba.into(),
            width,
            height,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// A uniformly colored frame, handy for placeholders and tests.
    pub fn solid(width: u32, height: u32, color: [u8; 4], sequence: u64) -> Self {
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            rgba.extend_from_slice(&color);
        }
        Self::new(rgba, width, height, sequence)
    }
}

/// A keypoint in [0, 1]-normalized image space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Present for pose landmarks, absent for hand landmarks.
    pub visibility: Option<f32>,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            x,
            y,
            z,
            visibility: None,
        }
    }

    pub fn with_visibility(mut self, visibility: f32) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn to_pixel(&self, width: u32, height: u32) -> (f32, f32) {
        (self.x * width as f32, self.y * height as f32)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
    Unknown,
}

impl Handedness {
    pub fn label(&self) -> &'static str {
        match self {
            Handedness::Left => "Left",
            Handedness::Right => "Right",
            Handedness::Unknown => "Unknown",
        }
    }

    /// Maps the hand model's right-hand probability onto a label.
    pub fn from_score(score: f32) -> Self {
        if !score.is_finite() {
            Handedness::Unknown
        } else if score >= 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Pose,
    Hand,
}

impl DetectorKind {
    pub fn label(&self) -> &'static str {
        match self {
            DetectorKind::Pose => "pose",
            DetectorKind::Hand => "hand",
        }
    }

    pub fn landmark_count(&self) -> usize {
        match self {
            DetectorKind::Pose => POSE_LANDMARK_COUNT,
            DetectorKind::Hand => HAND_LANDMARK_COUNT,
        }
    }

    pub fn topology(&self) -> &'static [(usize, usize)] {
        match self {
            DetectorKind::Pose => POSE_CONNECTIONS,
            DetectorKind::Hand => HAND_CONNECTIONS,
        }
    }
}

/// One detected subject. Index `i` of `landmarks` is always the same joint.
#[derive(Clone, Debug, PartialEq)]
pub struct Skeleton {
    pub landmarks: Vec<Landmark>,
    pub handedness: Option<Handedness>,
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LandmarkSet {
    pub kind: DetectorKind,
    pub skeletons: Vec<Skeleton>,
}

impl LandmarkSet {
    pub fn empty(kind: DetectorKind) -> Self {
        Self {
            kind,
            skeletons: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.skeletons.iter().all(|s| s.landmarks.is_empty())
    }

    pub fn landmark_total(&self) -> usize {
        self.skeletons.iter().map(|s| s.landmarks.len()).sum()
    }

    /// The body skeleton of a pose result.
    pub fn pose(&self) -> Option<&Skeleton> {
        match self.kind {
            DetectorKind::Pose => self.skeletons.first(),
            DetectorKind::Hand => None,
        }
    }

    pub fn hands(&self) -> &[Skeleton] {
        match self.kind {
            DetectorKind::Hand => &self.skeletons,
            DetectorKind::Pose => &[],
        }
    }
}

/// Anatomical roles of the 33 pose landmarks, in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PoseJoint {
    Nose,
    LeftEyeInner,
    LeftEye,
    LeftEyeOuter,
    RightEyeInner,
    RightEye,
    RightEyeOuter,
    LeftEar,
    RightEar,
    MouthLeft,
    MouthRight,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftPinky,
    RightPinky,
    LeftIndex,
    RightIndex,
    LeftThumb,
    RightThumb,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
    LeftHeel,
    RightHeel,
    LeftFootIndex,
    RightFootIndex,
}

impl PoseJoint {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Anatomical roles of the 21 hand landmarks, in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum HandJoint {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexMcp,
    IndexPip,
    IndexDip,
    IndexTip,
    MiddleMcp,
    MiddlePip,
    MiddleDip,
    MiddleTip,
    RingMcp,
    RingPip,
    RingDip,
    RingTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

impl HandJoint {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joint_enums_cover_model_outputs() {
        assert_eq!(PoseJoint::RightFootIndex.index() + 1, POSE_LANDMARK_COUNT);
        assert_eq!(HandJoint::PinkyTip.index() + 1, HAND_LANDMARK_COUNT);
        assert_eq!(PoseJoint::LeftShoulder.index(), 11);
        assert_eq!(HandJoint::MiddleMcp.index(), 9);
    }

    #[test]
    fn handedness_from_score() {
        assert_eq!(Handedness::from_score(0.9), Handedness::Right);
        assert_eq!(Handedness::from_score(0.1), Handedness::Left);
        assert_eq!(Handedness::from_score(f32::NAN), Handedness::Unknown);
    }

    #[test]
    fn accessors_respect_kind() {
        let skeleton = Skeleton {
            landmarks: vec![Landmark::new(0.5, 0.5, 0.0); HAND_LANDMARK_COUNT],
            handedness: Some(Handedness::Left),
            score: 0.9,
        };
        let set = LandmarkSet {
            kind: DetectorKind::Hand,
            skeletons: vec![skeleton],
        };
        assert!(set.pose().is_none());
        assert_eq!(set.hands().len(), 1);
        assert_eq!(set.landmark_total(), HAND_LANDMARK_COUNT);
        assert!(LandmarkSet::empty(DetectorKind::Pose).is_empty());
    }

    #[test]
    fn topology_stays_within_landmark_count() {
        for kind in [DetectorKind::Pose, DetectorKind::Hand] {
            let count = kind.landmark_count();
            assert!(kind.topology().iter().all(|&(a, b)| a < count && b < count));
        }
        assert_eq!(DetectorKind::Pose.landmark_count(), 33);
        assert_eq!(DetectorKind::Hand.landmark_count(), 21);
    }

    #[test]
    fn solid_frame_has_expected_length() {
        let frame = Frame::solid(4, 3, [1, 2, 3, 255], 7);
        assert_eq!(frame.rgba.len(), 4 * 3 * 4);
        assert_eq!(&frame.rgba[..4], &[1, 2, 3, 255]);
        assert_eq!(frame.sequence, 7);
    }
}
