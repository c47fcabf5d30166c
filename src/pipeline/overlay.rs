use std::path::Path;

use anyhow::Context;
use image::RgbaImage;

use super::skeleton::{ARM_JOINTS, Canvas};
use crate::{
    config::PipelineConfig,
    types::{Frame, LandmarkSet, Skeleton},
};

/// Target the renderer draws onto.
#[derive(Clone, Debug)]
pub struct Surface {
    image: RgbaImage,
}

impl Default for Surface {
    fn default() -> Self {
        Self {
            image: RgbaImage::new(0, 0),
        }
    }
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.image
            .save(path)
            .with_context(|| format!("failed to write surface snapshot to {}", path.display()))
    }

    fn resize_to(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        }
    }

    fn canvas(&mut self) -> Canvas<'_> {
        let (width, height) = self.image.dimensions();
        Canvas::new(&mut self.image, width, height)
    }

    fn blit_frame(&mut self, frame: &Frame, mirror: bool) -> bool {
        let row_len = frame.width as usize * 4;
        let buffer: &mut [u8] = &mut self.image;
        if frame.rgba.len() != buffer.len() || row_len == 0 {
            return false;
        }

        if !mirror {
            buffer.copy_from_slice(&frame.rgba);
            return true;
        }
        for (dst_row, src_row) in buffer
            .chunks_exact_mut(row_len)
            .zip(frame.rgba.chunks_exact(row_len))
        {
            for (dst, src) in dst_row
                .chunks_exact_mut(4)
                .zip(src_row.chunks_exact(4).rev())
            {
                dst.copy_from_slice(src);
            }
        }
        true
    }
}

#[derive(Clone, Debug)]
pub struct OverlayStyle {
    pub background: [u8; 4],
    pub line_color: [u8; 4],
    pub point_color: [u8; 4],
    pub line_thickness: i32,
    pub point_radius: i32,
    /// Flip horizontally so the view reads like a mirror.
    pub mirror: bool,
    /// Only these joint indices get point markers; `None` marks every joint.
    pub highlight: Option<&'static [usize]>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            background: [17, 24, 39, 255],
            line_color: [0, 255, 0, 255],
            line_thickness: 3,
            point_color: [255, 0, 0, 255],
            point_radius: 3,
            mirror: false,
            highlight: None,
        }
    }
}

impl OverlayStyle {
    /// Markers on shoulders, elbows, wrists and hands only.
    pub fn arm_focus() -> Self {
        Self {
            highlight: Some(ARM_JOINTS),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Background {
    RawFrame,
    Stylized,
}

/// What a single `render` call put on the surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSummary {
    pub background: Background,
    pub skeletons: usize,
    pub edges: usize,
    pub points: usize,
}

#[derive(Clone, Debug, Default)]
pub struct OverlayRenderer {
    style: OverlayStyle,
}

impl OverlayRenderer {
    pub fn new(style: OverlayStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    pub fn render(
        &self,
        surface: &mut Surface,
        frame: &Frame,
        landmarks: Option<&LandmarkSet>,
        config: &PipelineConfig,
    ) -> RenderSummary {
        surface.resize_to(frame.width, frame.height);

        if !config.overlay_enabled {
            if !surface.blit_frame(frame, self.style.mirror) {
                log::warn!(
                    "frame {} has {} bytes, expected {}x{} RGBA",
                    frame.sequence,
                    frame.rgba.len(),
                    frame.width,
                    frame.height
                );
            }
            return RenderSummary {
                background: Background::RawFrame,
                skeletons: 0,
                edges: 0,
                points: 0,
            };
        }

        surface.canvas().fill(self.style.background);
        let mut summary = RenderSummary {
            background: Background::Stylized,
            skeletons: 0,
            edges: 0,
            points: 0,
        };

        let Some(set) = landmarks else {
            return summary;
        };
        let topology = set.kind.topology();
        for skeleton in set.skeletons.iter().filter(|s| !s.landmarks.is_empty()) {
            let (edges, points) = self.draw_skeleton(surface, skeleton, topology);
            summary.skeletons += 1;
            summary.edges += edges;
            summary.points += points;
        }
        summary
    }

    fn draw_skeleton(
        &self,
        surface: &mut Surface,
        skeleton: &Skeleton,
        topology: &[(usize, usize)],
    ) -> (usize, usize) {
        let (width, height) = surface.dimensions();
        let mirror = self.style.mirror;
        let points: Vec<(f32, f32)> = skeleton
            .landmarks
            .iter()
            .map(|lm| {
                let (x, y) = lm.to_pixel(width, height);
                if mirror { (width as f32 - 1.0 - x, y) } else { (x, y) }
            })
            .collect();

        let mut canvas = surface.canvas();
        let mut edges = 0;
        for &(a, b) in topology {
            if let (Some(&pa), Some(&pb)) = (points.get(a), points.get(b)) {
                canvas.draw_line(pa, pb, self.style.line_color, self.style.line_thickness);
                edges += 1;
            }
        }

        let mut markers = 0;
        for (idx, &point) in points.iter().enumerate() {
            if self
                .style
                .highlight
                .is_some_and(|joints| !joints.contains(&idx))
            {
                continue;
            }
            canvas.draw_disc(point, self.style.point_radius, self.style.point_color);
            markers += 1;
        }
        (edges, markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::skeleton::{HAND_CONNECTIONS, POSE_CONNECTIONS},
        types::{
            DetectorKind, HAND_LANDMARK_COUNT, Handedness, Landmark, POSE_LANDMARK_COUNT,
        },
    };

    fn pose_set() -> LandmarkSet {
        let landmarks = (0..POSE_LANDMARK_COUNT)
            .map(|i| {
                let t = i as f32 / POSE_LANDMARK_COUNT as f32;
                Landmark::new(0.1 + 0.8 * t, 0.2 + 0.6 * t, 0.0).with_visibility(0.9)
            })
            .collect();
        LandmarkSet {
            kind: DetectorKind::Pose,
            skeletons: vec![Skeleton {
                landmarks,
                handedness: None,
                score: 0.9,
            }],
        }
    }

    fn hand(offset_x: f32, handedness: Handedness) -> Skeleton {
        Skeleton {
            landmarks: (0..HAND_LANDMARK_COUNT)
                .map(|i| Landmark::new(offset_x + 0.01 * i as f32, 0.3 + 0.02 * i as f32, 0.0))
                .collect(),
            handedness: Some(handedness),
            score: 0.95,
        }
    }

    fn at(surface: &Surface, x: u32, y: u32) -> [u8; 4] {
        surface.image().get_pixel(x, y).0
    }

    #[test]
    fn overlay_disabled_draws_raw_frame_only() {
        let frame = Frame::solid(32, 24, [10, 20, 30, 255], 1);
        let mut surface = Surface::new(4, 4);
        let renderer = OverlayRenderer::default();
        let config = PipelineConfig::default().with_overlay(false);
        let empty = LandmarkSet::empty(DetectorKind::Pose);

        let summary = renderer.render(&mut surface, &frame, Some(&empty), &config);

        assert_eq!(summary.background, Background::RawFrame);
        assert_eq!((summary.edges, summary.points, summary.skeletons), (0, 0, 0));
        assert_eq!(surface.dimensions(), (32, 24));
        assert_eq!(surface.image().as_raw().as_slice(), &frame.rgba[..]);
    }

    #[test]
    fn overlay_disabled_ignores_landmarks() {
        let frame = Frame::solid(40, 40, [1, 2, 3, 255], 1);
        let mut surface = Surface::default();
        let config = PipelineConfig::default().with_overlay(false);

        let summary =
            OverlayRenderer::default().render(&mut surface, &frame, Some(&pose_set()), &config);

        assert_eq!(summary.points, 0);
        assert!(surface.image().pixels().all(|p| p.0 == [1, 2, 3, 255]));
    }

    #[test]
    fn stylized_pose_draws_all_edges_and_markers() {
        let frame = Frame::solid(200, 100, [200, 200, 200, 255], 3);
        let mut surface = Surface::default();
        let renderer = OverlayRenderer::default();
        let set = pose_set();

        let summary = renderer.render(&mut surface, &frame, Some(&set), &PipelineConfig::default());

        assert_eq!(summary.background, Background::Stylized);
        assert_eq!(summary.skeletons, 1);
        assert_eq!(summary.edges, POSE_CONNECTIONS.len());
        assert_eq!(summary.points, POSE_LANDMARK_COUNT);
        assert_eq!(surface.dimensions(), (200, 100));
        // Corner keeps the stylized background, never the raw frame.
        assert_eq!(at(&surface, 199, 0), renderer.style().background);
        // Markers sit at the scaled landmark positions.
        let (x, y) = set.skeletons[0].landmarks[0].to_pixel(200, 100);
        assert_eq!(at(&surface, x as u32, y as u32), renderer.style().point_color);
    }

    #[test]
    fn no_landmarks_draws_background_only() {
        let frame = Frame::solid(16, 16, [200, 0, 0, 255], 1);
        let mut surface = Surface::default();
        let renderer = OverlayRenderer::default();

        let summary = renderer.render(&mut surface, &frame, None, &PipelineConfig::default());

        assert_eq!(summary.skeletons, 0);
        assert!(
            surface
                .image()
                .pixels()
                .all(|p| p.0 == renderer.style().background)
        );
    }

    #[test]
    fn two_hands_render_as_independent_skeletons() {
        let frame = Frame::solid(320, 240, [0, 0, 0, 255], 1);
        let mut surface = Surface::default();
        let set = LandmarkSet {
            kind: DetectorKind::Hand,
            skeletons: vec![hand(0.1, Handedness::Left), hand(0.6, Handedness::Right)],
        };

        let summary =
            OverlayRenderer::default().render(&mut surface, &frame, Some(&set), &PipelineConfig::default());

        assert_eq!(summary.skeletons, 2);
        assert_eq!(summary.edges, 2 * HAND_CONNECTIONS.len());
        assert_eq!(summary.points, 2 * HAND_LANDMARK_COUNT);
        // The gap between the hands stays untouched: no cross-hand edge.
        let gap_x = (0.45 * 320.0) as u32;
        let gap_y = (0.3 * 240.0) as u32;
        assert_eq!(
            at(&surface, gap_x, gap_y),
            OverlayStyle::default().background
        );
    }

    #[test]
    fn arm_focus_marks_only_arm_joints() {
        let frame = Frame::solid(100, 100, [0, 0, 0, 255], 1);
        let mut surface = Surface::default();
        let renderer = OverlayRenderer::new(OverlayStyle::arm_focus());

        let summary =
            renderer.render(&mut surface, &frame, Some(&pose_set()), &PipelineConfig::default());

        assert_eq!(summary.points, ARM_JOINTS.len());
        assert_eq!(summary.edges, POSE_CONNECTIONS.len());
    }

    #[test]
    fn mirror_flips_raw_frame() {
        let mut rgba = vec![0u8; 2 * 1 * 4];
        rgba[..4].copy_from_slice(&[255, 0, 0, 255]);
        rgba[4..].copy_from_slice(&[0, 0, 255, 255]);
        let frame = Frame::new(rgba, 2, 1, 1);
        let renderer = OverlayRenderer::new(OverlayStyle {
            mirror: true,
            ..OverlayStyle::default()
        });
        let mut surface = Surface::default();

        renderer.render(
            &mut surface,
            &frame,
            None,
            &PipelineConfig::default().with_overlay(false),
        );

        assert_eq!(at(&surface, 0, 0), [0, 0, 255, 255]);
        assert_eq!(at(&surface, 1, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn mirrored_markers_follow_mirrored_pixels() {
        let frame = Frame::solid(50, 50, [0, 0, 0, 255], 1);
        let set = LandmarkSet {
            kind: DetectorKind::Pose,
            skeletons: vec![Skeleton {
                landmarks: vec![Landmark::new(0.0, 0.5, 0.0).with_visibility(0.9)],
                handedness: None,
                score: 0.9,
            }],
        };
        let renderer = OverlayRenderer::new(OverlayStyle {
            mirror: true,
            ..OverlayStyle::default()
        });
        let mut surface = Surface::default();

        let summary = renderer.render(&mut surface, &frame, Some(&set), &PipelineConfig::default());

        assert_eq!(summary.points, 1);
        // Column 0 of the frame is blitted to column 49.
        assert_eq!(at(&surface, 49, 25), renderer.style().point_color);
        assert_eq!(at(&surface, 0, 25), renderer.style().background);
    }
}
