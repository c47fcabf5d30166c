use std::path::Path;

use anyhow::{Context, Result, anyhow};
use ort::{session::Session, value::Tensor};

use super::{
    DetectorOptions, LandmarkEngine,
    common::{
        CropTransform, LetterboxInfo, build_session, landmark_rows, prepare_letterboxed,
        prepare_rotated_crop, sigmoid,
    },
};
use crate::{
    error::InitError,
    model_download::ModelAsset,
    types::{DetectorKind, Frame, Landmark, LandmarkSet, POSE_LANDMARK_COUNT, Skeleton},
};

pub const POSE_INPUT_SIZE: u32 = 256;

// The model emits 33 body landmarks plus 6 auxiliary ones, 5 values each.
const MODEL_LANDMARKS: usize = 39;
const VALUES_PER_LANDMARK: usize = 5;
const TRACKED_CROP_SCALE: f32 = 1.25;

/// How model input pixels map back onto the frame.
enum Projection {
    Letterbox(LetterboxInfo),
    Crop(CropTransform),
}

impl Projection {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        match self {
            Projection::Letterbox(info) => info.unproject(x, y),
            Projection::Crop(transform) => transform.project(x, y),
        }
    }

    fn pixel_scale(&self) -> f32 {
        match self {
            Projection::Letterbox(info) => 1.0 / info.scale,
            Projection::Crop(transform) => transform.pixel_scale(),
        }
    }
}

/// Square region of the frame around the previous pose.
#[derive(Clone, Copy, Debug, PartialEq)]
struct PoseRoi {
    center: (f32, f32),
    side: f32,
}

impl PoseRoi {
    fn around(landmarks: &[Landmark], width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        let (min_x, max_x, min_y, max_y) = landmarks.iter().fold(
            (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
            |acc, lm| {
                (
                    acc.0.min(lm.x * w),
                    acc.1.max(lm.x * w),
                    acc.2.min(lm.y * h),
                    acc.3.max(lm.y * h),
                )
            },
        );
        let span = (max_x - min_x).max(max_y - min_y);
        if !span.is_finite() || span <= 1.0 {
            return None;
        }
        Some(Self {
            center: ((min_x + max_x) * 0.5, (min_y + max_y) * 0.5),
            side: span * TRACKED_CROP_SCALE,
        })
    }
}

/// BlazePose landmark model over the whole frame, or over the previous
/// pose's region while tracking holds.
pub struct OrtPoseEngine {
    session: Session,
    options: DetectorOptions,
    tracked: Option<PoseRoi>,
}

impl OrtPoseEngine {
    pub fn new(model_dir: &Path, options: &DetectorOptions) -> Result<Self, InitError> {
        let session = build_session(
            &ModelAsset::PoseLandmark.path_in(model_dir),
            options.model_complexity,
        )?;
        log::info!(
            "pose ORT engine ready ({:?} complexity)",
            options.model_complexity
        );
        Ok(Self {
            session,
            options: options.clone(),
            tracked: None,
        })
    }
}

impl LandmarkEngine for OrtPoseEngine {
    fn infer(&mut self, frame: &Frame) -> Result<LandmarkSet> {
        let (input, projection) = match self.tracked.take() {
            Some(roi) => {
                let (input, transform) =
                    prepare_rotated_crop(frame, roi.center, roi.side, 0.0, POSE_INPUT_SIZE)?;
                (input, Projection::Crop(transform))
            }
            None => {
                let (input, info) = prepare_letterboxed(frame, POSE_INPUT_SIZE)?;
                (input, Projection::Letterbox(info))
            }
        };

        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run pose landmark session")?;
        if outputs.len() < 2 {
            return Err(anyhow!(
                "pose model returned {} outputs, expected at least 2",
                outputs.len()
            ));
        }

        let raw: Vec<f32> = outputs[0].try_extract_array::<f32>()?.iter().copied().collect();
        let confidence = outputs[1]
            .try_extract_array::<f32>()?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);

        let mut set = LandmarkSet::empty(DetectorKind::Pose);
        if confidence < self.options.detection_confidence.min(self.options.tracking_confidence) {
            return Ok(set);
        }

        let landmarks = decode_pose(&raw, &projection, frame.width, frame.height)?;
        if confidence >= self.options.tracking_confidence {
            self.tracked = PoseRoi::around(&landmarks, frame.width, frame.height);
        }
        if confidence >= self.options.detection_confidence {
            set.skeletons.push(Skeleton {
                landmarks,
                handedness: None,
                score: confidence,
            });
        }
        Ok(set)
    }

    fn release(&mut self) -> Result<()> {
        self.tracked = None;
        Ok(())
    }
}

fn decode_pose(
    raw: &[f32],
    projection: &Projection,
    width: u32,
    height: u32,
) -> Result<Vec<Landmark>> {
    let rows = landmark_rows(raw, MODEL_LANDMARKS, VALUES_PER_LANDMARK)?;
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    Ok(rows
        .iter()
        .take(POSE_LANDMARK_COUNT)
        .map(|row| {
            let (px, py) = projection.to_frame(row[0], row[1]);
            Landmark::new(
                (px / w).clamp(0.0, 1.0),
                (py / h).clamp(0.0, 1.0),
                row[2] * projection.pixel_scale() / w,
            )
            .with_visibility(sigmoid(row[3]))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_keeps_body_landmarks_only() {
        let mut raw = vec![0.0f32; MODEL_LANDMARKS * VALUES_PER_LANDMARK];
        for (i, row) in raw.chunks_exact_mut(VALUES_PER_LANDMARK).enumerate() {
            row[0] = 128.0;
            row[1] = 128.0;
            row[3] = if i == 0 { 10.0 } else { -10.0 };
        }
        let projection = Projection::Letterbox(LetterboxInfo {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 64.0,
            orig_w: 512,
            orig_h: 256,
        });

        let landmarks = decode_pose(&raw, &projection, 512, 256).unwrap();
        assert_eq!(landmarks.len(), POSE_LANDMARK_COUNT);
        assert_eq!(landmarks[0].x, 0.5);
        assert_eq!(landmarks[0].y, 0.5);
        assert!(landmarks[0].visibility.unwrap() > 0.99);
        assert!(landmarks[1].visibility.unwrap() < 0.01);
    }

    #[test]
    fn short_output_is_an_error() {
        let projection = Projection::Letterbox(LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            orig_w: 256,
            orig_h: 256,
        });
        assert!(decode_pose(&[0.0; 10], &projection, 256, 256).is_err());
    }

    #[test]
    fn roi_surrounds_previous_pose() {
        let landmarks = [Landmark::new(0.25, 0.25, 0.0), Landmark::new(0.75, 0.5, 0.0)];
        let roi = PoseRoi::around(&landmarks, 400, 200).unwrap();
        assert_eq!(roi.center, (200.0, 75.0));
        assert!((roi.side - 200.0 * TRACKED_CROP_SCALE).abs() < 1e-3);
        assert!(PoseRoi::around(&[Landmark::new(0.5, 0.5, 0.0)], 400, 200).is_none());
    }
}
