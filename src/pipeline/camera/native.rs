use anyhow::{Result, anyhow};
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

use super::{CameraBackend, CameraConstraints, FacingMode, RgbaFrame, StreamHandle};
use crate::{
    error::CaptureError,
    pipeline::rgba_converter::{self, SourceFormat},
};

// Built-in macOS cameras often reject YUYV even though nokhwa reports it, so
// raw formats go first.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::GRAY,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::MJPEG,
];

const IDEAL_FRAME_RATE: u32 = 30;

fn requested_formats(constraints: &CameraConstraints) -> [RequestedFormat<'static>; 4] {
    let ideal = CameraFormat::new_from(
        constraints.ideal_width,
        constraints.ideal_height,
        FrameFormat::MJPEG,
        IDEAL_FRAME_RATE,
    );
    [
        RequestedFormat::with_formats(RequestedFormatType::Closest(ideal), PREFERRED_PIXEL_FORMATS),
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .filter_map(|info| {
            let index = info.index().as_index().ok()?;
            Some(CameraDevice {
                index,
                label: info.human_name(),
            })
        })
        .collect())
}

/// Live cameras through nokhwa's native backends.
#[derive(Clone, Copy, Debug, Default)]
pub struct NokhwaBackend;

impl CameraBackend for NokhwaBackend {
    fn request_access(
        &self,
        constraints: &CameraConstraints,
    ) -> Result<Box<dyn StreamHandle>, CaptureError> {
        if constraints.facing_mode == FacingMode::Environment {
            log::debug!("facing mode is advisory on desktop cameras; using the selected device");
        }
        let camera = open_camera(constraints)?;
        let format = camera.camera_format();
        log::info!(
            "opened camera {} at {}x{} {:?} @ {} fps",
            constraints.device_index,
            format.width(),
            format.height(),
            format.format(),
            format.frame_rate()
        );
        Ok(Box::new(NokhwaStream { camera }))
    }
}

fn open_camera(constraints: &CameraConstraints) -> Result<Camera, CaptureError> {
    let index = CameraIndex::Index(constraints.device_index);
    let mut last_err = None;

    for requested in requested_formats(constraints) {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.to_string()),
            },
            Err(err) => last_err = Some(err.to_string()),
        }
    }

    let message =
        last_err.unwrap_or_else(|| "failed to open camera with any supported format".into());
    Err(classify_open_error(message))
}

fn classify_open_error(message: String) -> CaptureError {
    let lowered = message.to_lowercase();
    if ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

struct NokhwaStream {
    camera: Camera,
}

impl StreamHandle for NokhwaStream {
    fn get_frame(&mut self) -> Result<RgbaFrame> {
        let buffer = self.camera.frame()?;
        let resolution = buffer.resolution();
        let (width, height) = (resolution.width_x, resolution.height_y);
        let format = match buffer.source_frame_format() {
            FrameFormat::NV12 => SourceFormat::Nv12,
            FrameFormat::YUYV => SourceFormat::Yuyv,
            FrameFormat::MJPEG => SourceFormat::Mjpeg,
            FrameFormat::RAWRGB => SourceFormat::Rgb,
            FrameFormat::RAWBGR => SourceFormat::Bgr,
            FrameFormat::GRAY => SourceFormat::Gray,
        };
        let rgba = rgba_converter::to_rgba(format, buffer.buffer(), width, height)?;
        if rgba.is_empty() {
            return Err(anyhow!("camera produced an empty frame"));
        }
        Ok(RgbaFrame {
            rgba,
            width,
            height,
        })
    }

    fn release(&mut self) -> Result<()> {
        self.camera.stop_stream()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_messages_map_to_permission_denied() {
        assert!(matches!(
            classify_open_error("Camera access Denied by user".into()),
            CaptureError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_open_error("device busy".into()),
            CaptureError::DeviceUnavailable(_)
        ));
    }
}
