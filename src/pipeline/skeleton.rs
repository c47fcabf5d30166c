//! Landmark topologies and the raster primitives used to draw them.

/// MediaPipe BlazePose body graph over the 33 pose landmarks.
pub const POSE_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 7),
    (0, 4),
    (4, 5),
    (5, 6),
    (6, 8),
    (9, 10),
    (11, 12),
    (11, 13),
    (13, 15),
    (15, 17),
    (15, 19),
    (15, 21),
    (17, 19),
    (12, 14),
    (14, 16),
    (16, 18),
    (16, 20),
    (16, 22),
    (18, 20),
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (24, 26),
    (25, 27),
    (26, 28),
    (27, 29),
    (28, 30),
    (29, 31),
    (30, 32),
    (27, 31),
    (28, 32),
];

/// MediaPipe hand graph over the 21 hand landmarks.
pub const HAND_CONNECTIONS: &[(usize, usize)] = &[
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (0, 5),
    (5, 6),
    (6, 7),
    (7, 8),
    (5, 9),
    (9, 10),
    (10, 11),
    (11, 12),
    (9, 13),
    (13, 14),
    (14, 15),
    (15, 16),
    (13, 17),
    (0, 17),
    (17, 18),
    (18, 19),
    (19, 20),
];

/// Pose joints shown by the arm-tracking view: shoulders down to the fingertips.
pub const ARM_JOINTS: &[usize] = &[11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22];

/// Mutable view over a packed RGBA buffer.
pub struct Canvas<'a> {
    buffer: &'a mut [u8],
    width: u32,
    height: u32,
}

impl<'a> Canvas<'a> {
    pub fn new(buffer: &'a mut [u8], width: u32, height: u32) -> Self {
        Self {
            buffer,
            width,
            height,
        }
    }

    pub fn fill(&mut self, color: [u8; 4]) {
        for px in self.buffer.chunks_exact_mut(4) {
            px.copy_from_slice(&color);
        }
    }

    /// Bresenham line, widened by stamping a diamond of `thickness` pixels.
    pub fn draw_line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 4], thickness: i32) {
        let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
        let (x1, y1) = (p1.0 as i32, p1.1 as i32);
        let dx = (x1 - x0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let dy = -(y1 - y0).abs();
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (thickness.max(1) - 1) / 2;

        loop {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox.abs() + oy.abs() <= radius {
                        self.put_pixel(x0 + ox, y0 + oy, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    pub fn draw_disc(&mut self, center: (f32, f32), radius: i32, color: [u8; 4]) {
        let (cx, cy) = (center.0 as i32, center.1 as i32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }

    fn put_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if x < 0 || y < 0 {
            return;
        }
        let (ux, uy) = (x as u32, y as u32);
        if ux >= self.width || uy >= self.height {
            return;
        }
        let idx = ((uy * self.width + ux) as usize) * 4;
        if idx + 3 < self.buffer.len() {
            self.buffer[idx..idx + 4].copy_from_slice(&color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HAND_LANDMARK_COUNT, POSE_LANDMARK_COUNT};

    fn pixel(buffer: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * width + x) as usize) * 4;
        [buffer[idx], buffer[idx + 1], buffer[idx + 2], buffer[idx + 3]]
    }

    #[test]
    fn topologies_reference_valid_joints() {
        assert_eq!(POSE_CONNECTIONS.len(), 35);
        assert_eq!(HAND_CONNECTIONS.len(), 21);
        assert!(
            POSE_CONNECTIONS
                .iter()
                .all(|&(a, b)| a < POSE_LANDMARK_COUNT && b < POSE_LANDMARK_COUNT)
        );
        assert!(
            HAND_CONNECTIONS
                .iter()
                .all(|&(a, b)| a < HAND_LANDMARK_COUNT && b < HAND_LANDMARK_COUNT)
        );
    }

    #[test]
    fn line_covers_endpoints() {
        let mut buffer = vec![0u8; 10 * 10 * 4];
        let red = [255, 0, 0, 255];
        Canvas::new(&mut buffer, 10, 10).draw_line((1.0, 1.0), (8.0, 6.0), red, 1);
        assert_eq!(pixel(&buffer, 10, 1, 1), red);
        assert_eq!(pixel(&buffer, 10, 8, 6), red);
        assert_eq!(pixel(&buffer, 10, 0, 9), [0, 0, 0, 0]);
    }

    #[test]
    fn drawing_outside_bounds_is_clipped() {
        let mut buffer = vec![0u8; 4 * 4 * 4];
        let mut canvas = Canvas::new(&mut buffer, 4, 4);
        canvas.draw_disc((-10.0, -10.0), 3, [1, 1, 1, 1]);
        canvas.draw_line((-5.0, 2.0), (20.0, 2.0), [9, 9, 9, 9], 1);
        assert_eq!(pixel(&buffer, 4, 0, 2), [9, 9, 9, 9]);
        assert_eq!(pixel(&buffer, 4, 3, 2), [9, 9, 9, 9]);
        assert_eq!(pixel(&buffer, 4, 0, 0), [0, 0, 0, 0]);
    }
}
