use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::{session::Session, value::Tensor};

use super::{
    DetectorOptions, LandmarkEngine,
    common::{self, CropTransform, build_session, landmark_rows},
    palm::{PalmDetector, PalmDetectorConfig, PalmRegion, crop_from_palm},
};
use crate::{
    error::InitError,
    model_download::ModelAsset,
    types::{
        DetectorKind, Frame, HAND_LANDMARK_COUNT, HandJoint, Handedness, Landmark, LandmarkSet,
        Skeleton,
    },
};

pub const HAND_INPUT_SIZE: u32 = 224;

// Crop side relative to the landmark extent of a tracked hand.
const TRACKED_CROP_SCALE: f32 = 1.8;

/// Rotated square region of the frame holding one hand.
#[derive(Clone, Copy, Debug, PartialEq)]
struct HandRoi {
    center: (f32, f32),
    side: f32,
    angle: f32,
}

impl HandRoi {
    fn from_palm(palm: &PalmRegion) -> Self {
        let (center, side, angle) = crop_from_palm(palm);
        Self {
            center,
            side,
            angle,
        }
    }

    /// Next-frame region around landmarks given in frame pixels.
    fn from_landmarks(points: &[(f32, f32)]) -> Option<Self> {
        let wrist = points.get(HandJoint::Wrist.index())?;
        let middle = points.get(HandJoint::MiddleMcp.index())?;
        let (min_x, max_x, min_y, max_y) = points.iter().fold(
            (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
            |acc, (x, y)| (acc.0.min(*x), acc.1.max(*x), acc.2.min(*y), acc.3.max(*y)),
        );
        let span = (max_x - min_x).max(max_y - min_y);
        if !span.is_finite() || span <= 1.0 {
            return None;
        }
        Some(Self {
            center: ((min_x + max_x) * 0.5, (min_y + max_y) * 0.5),
            side: span * TRACKED_CROP_SCALE,
            // Wrist to middle knuckle points up in the crop.
            angle: (middle.0 - wrist.0).atan2(-(middle.1 - wrist.1)),
        })
    }

    fn contains(&self, point: (f32, f32)) -> bool {
        let dx = point.0 - self.center.0;
        let dy = point.1 - self.center.1;
        (dx * dx + dy * dy).sqrt() < self.side * 0.25
    }
}

struct HandEstimate {
    skeleton: Skeleton,
    next_roi: Option<HandRoi>,
}

/// Palm detection followed by the 21-point hand landmark model per palm.
///
/// Hands whose landmark confidence stays at or above `tracking_confidence`
/// are followed into the next frame without re-running palm detection.
pub struct OrtHandEngine {
    landmarker: Session,
    palm_detector: PalmDetector,
    options: DetectorOptions,
    tracked: Vec<HandRoi>,
}

impl OrtHandEngine {
    pub fn new(model_dir: &Path, options: &DetectorOptions) -> Result<Self, InitError> {
        let landmarker = build_session(
            &ModelAsset::HandLandmark.path_in(model_dir),
            options.model_complexity,
        )?;
        let palm_detector = PalmDetector::new(
            &ModelAsset::PalmDetector.path_in(model_dir),
            options.model_complexity,
            PalmDetectorConfig {
                score_threshold: options.detection_confidence,
                top_k: options.max_subjects,
                ..PalmDetectorConfig::default()
            },
        )?;
        log::info!(
            "hand ORT engine ready (max {} hands, {:?} complexity)",
            options.max_subjects,
            options.model_complexity
        );
        Ok(Self {
            landmarker,
            palm_detector,
            options: options.clone(),
            tracked: Vec::new(),
        })
    }

    fn regions(&mut self, frame: &Frame) -> Vec<HandRoi> {
        let mut rois = std::mem::take(&mut self.tracked);
        if rois.len() >= self.options.max_subjects {
            return rois;
        }

        let palms = self.palm_detector.detect(frame).unwrap_or_else(|err| {
            log::warn!("palm detection failed: {err:?}");
            Vec::new()
        });
        for palm in &palms {
            if rois.len() >= self.options.max_subjects {
                break;
            }
            let roi = HandRoi::from_palm(palm);
            if rois.iter().any(|existing| existing.contains(roi.center)) {
                continue;
            }
            rois.push(roi);
        }
        rois
    }

    fn estimate(&mut self, frame: &Frame, roi: &HandRoi) -> Result<HandEstimate> {
        let (input, transform) = common::prepare_rotated_crop(
            frame,
            roi.center,
            roi.side,
            roi.angle,
            HAND_INPUT_SIZE,
        )?;
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .landmarker
            .run(ort::inputs![tensor])
            .context("failed to run hand landmark session")?;
        if outputs.len() < 1 {
            return Err(anyhow!("hand landmark model returned no outputs"));
        }

        let coords: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let scalar = |idx: usize| -> Option<f32> {
            if outputs.len() <= idx {
                return None;
            }
            outputs[idx]
                .try_extract_array::<f32>()
                .ok()
                .and_then(|arr| arr.iter().next().copied())
        };
        let confidence = scalar(1).unwrap_or(0.0).clamp(0.0, 1.0);
        let handedness = scalar(2).map(Handedness::from_score).unwrap_or(Handedness::Unknown);

        let rows = landmark_rows(&coords, HAND_LANDMARK_COUNT, 3)?;
        let pixels = project_rows(&rows, &transform);
        let landmarks = normalize(&rows, &pixels, &transform, frame);

        let next_roi = if confidence >= self.options.tracking_confidence {
            HandRoi::from_landmarks(&pixels)
        } else {
            None
        };
        Ok(HandEstimate {
            skeleton: Skeleton {
                landmarks,
                handedness: Some(handedness),
                score: confidence,
            },
            next_roi,
        })
    }
}

impl LandmarkEngine for OrtHandEngine {
    fn infer(&mut self, frame: &Frame) -> Result<LandmarkSet> {
        let rois = self.regions(frame);
        let mut set = LandmarkSet::empty(DetectorKind::Hand);
        for roi in rois {
            let estimate = self.estimate(frame, &roi);
            absorb(
                &mut set,
                &mut self.tracked,
                estimate,
                self.options.detection_confidence,
            );
        }
        Ok(set)
    }

    fn release(&mut self) -> Result<()> {
        self.tracked.clear();
        Ok(())
    }
}

/// Adds one region's estimate to the frame result. A failed region is
/// skipped so the other hands survive.
fn absorb(
    set: &mut LandmarkSet,
    tracked: &mut Vec<HandRoi>,
    estimate: Result<HandEstimate>,
    detection_confidence: f32,
) {
    let estimate = match estimate {
        Ok(estimate) => estimate,
        Err(err) => {
            log::warn!("hand landmark estimate failed: {err:?}");
            return;
        }
    };
    if let Some(next) = estimate.next_roi {
        tracked.push(next);
    }
    if estimate.skeleton.score >= detection_confidence {
        set.skeletons.push(estimate.skeleton);
    }
}

fn project_rows(rows: &[&[f32]], transform: &CropTransform) -> Vec<(f32, f32)> {
    rows.iter().map(|row| transform.project(row[0], row[1])).collect()
}

/// Frame pixels to [0, 1] image space; depth is scaled like x.
fn normalize(
    rows: &[&[f32]],
    pixels: &[(f32, f32)],
    transform: &CropTransform,
    frame: &Frame,
) -> Vec<Landmark> {
    let (w, h) = (frame.width.max(1) as f32, frame.height.max(1) as f32);
    rows.iter()
        .zip(pixels)
        .map(|(row, (px, py))| {
            Landmark::new(
                (px / w).clamp(0.0, 1.0),
                (py / h).clamp(0.0, 1.0),
                row[2] * transform.pixel_scale() / w,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upright_hand() -> Vec<(f32, f32)> {
        let mut points = vec![(100.0, 100.0); HAND_LANDMARK_COUNT];
        points[HandJoint::Wrist.index()] = (100.0, 200.0);
        points[HandJoint::MiddleMcp.index()] = (100.0, 140.0);
        points[HandJoint::MiddleTip.index()] = (100.0, 60.0);
        points[HandJoint::ThumbTip.index()] = (60.0, 120.0);
        points
    }

    #[test]
    fn upright_hand_tracks_without_rotation() {
        let roi = HandRoi::from_landmarks(&upright_hand()).unwrap();
        assert!(roi.angle.abs() < 1e-5);
        assert_eq!(roi.center, (80.0, 130.0));
        assert!((roi.side - 140.0 * TRACKED_CROP_SCALE).abs() < 1e-3);
    }

    #[test]
    fn sideways_hand_rotates_crop() {
        let mut points = upright_hand();
        points[HandJoint::Wrist.index()] = (40.0, 100.0);
        points[HandJoint::MiddleMcp.index()] = (100.0, 100.0);
        let roi = HandRoi::from_landmarks(&points).unwrap();
        assert!((roi.angle - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
    }

    #[test]
    fn collapsed_landmarks_are_not_tracked() {
        let points = vec![(5.0, 5.0); HAND_LANDMARK_COUNT];
        assert!(HandRoi::from_landmarks(&points).is_none());
    }

    #[test]
    fn palm_inside_tracked_region_is_a_duplicate() {
        let roi = HandRoi {
            center: (100.0, 100.0),
            side: 200.0,
            angle: 0.0,
        };
        assert!(roi.contains((120.0, 110.0)));
        assert!(!roi.contains((200.0, 100.0)));
    }

    #[test]
    fn landmarks_normalize_to_frame() {
        let frame = Frame::solid(200, 100, [0; 4], 1);
        let transform = CropTransform {
            center: (100.0, 50.0),
            side: 224.0,
            angle: 0.0,
            output_size: HAND_INPUT_SIZE,
            orig_w: 200,
            orig_h: 100,
        };
        let row = [112.0f32, 112.0, 10.0];
        let rows = vec![&row[..]];
        let pixels = project_rows(&rows, &transform);
        let landmarks = normalize(&rows, &pixels, &transform, &frame);
        assert_eq!(landmarks[0].x, 0.5);
        assert_eq!(landmarks[0].y, 0.5);
        assert!((landmarks[0].z - 0.05).abs() < 1e-6);
        assert_eq!(landmarks[0].visibility, None);
    }

    #[test]
    fn failed_region_keeps_other_hands() {
        let estimate = |score: f32, x: f32| HandEstimate {
            skeleton: Skeleton {
                landmarks: vec![Landmark::new(0.5, 0.5, 0.0); HAND_LANDMARK_COUNT],
                handedness: Some(Handedness::Left),
                score,
            },
            next_roi: Some(HandRoi {
                center: (x, 100.0),
                side: 120.0,
                angle: 0.0,
            }),
        };
        let mut set = LandmarkSet::empty(DetectorKind::Hand);
        let mut tracked = Vec::new();

        absorb(&mut set, &mut tracked, Ok(estimate(0.9, 50.0)), 0.5);
        absorb(&mut set, &mut tracked, Err(anyhow!("crop out of bounds")), 0.5);
        absorb(&mut set, &mut tracked, Ok(estimate(0.3, 250.0)), 0.5);

        assert_eq!(set.skeletons.len(), 1);
        assert_eq!(set.skeletons[0].score, 0.9);
        assert_eq!(tracked.len(), 2);
        assert_eq!(tracked[1].center, (250.0, 100.0));
    }
}
