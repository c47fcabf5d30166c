use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

/// Pixel layouts a capture device can hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

impl SourceFormat {
    fn label(&self) -> &'static str {
        match self {
            SourceFormat::Nv12 => "NV12",
            SourceFormat::Yuyv => "YUYV",
            SourceFormat::Mjpeg => "MJPEG",
            SourceFormat::Rgb => "RGB",
            SourceFormat::Bgr => "BGR",
            SourceFormat::Gray => "GRAY",
        }
    }

    /// Minimum raw buffer size for a `width` x `height` frame; `None` for
    /// compressed formats.
    fn raw_len(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            SourceFormat::Nv12 => Some(pixels + pixels / 2),
            SourceFormat::Yuyv => Some(pixels * 2),
            SourceFormat::Rgb | SourceFormat::Bgr => Some(pixels * 3),
            SourceFormat::Gray => Some(pixels),
            SourceFormat::Mjpeg => None,
        }
    }
}

/// Decodes one captured buffer into packed RGBA.
pub fn to_rgba(format: SourceFormat, data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if let Some(expected) = format.raw_len(width, height) {
        if data.len() < expected {
            return Err(anyhow!(
                "{} buffer too small: got {}, expected {expected}",
                format.label(),
                data.len()
            ));
        }
    }

    let mut rgba = vec![0u8; width as usize * height as usize * 4];
    match format {
        SourceFormat::Nv12 => nv12_into(data, width, height, &mut rgba)?,
        SourceFormat::Yuyv => yuyv_into(data, width, height, &mut rgba)?,
        SourceFormat::Mjpeg => return decode_mjpeg(data, width, height),
        SourceFormat::Rgb => expand_channels(data, 3, [0, 1, 2], &mut rgba),
        SourceFormat::Bgr => expand_channels(data, 3, [2, 1, 0], &mut rgba),
        SourceFormat::Gray => expand_channels(data, 1, [0, 0, 0], &mut rgba),
    }
    Ok(rgba)
}

fn nv12_into(data: &[u8], width: u32, height: u32, rgba: &mut [u8]) -> Result<()> {
    let y_len = width as usize * height as usize;
    let image = YuvBiPlanarImage {
        y_plane: &data[..y_len],
        y_stride: width,
        uv_plane: &data[y_len..y_len + y_len / 2],
        uv_stride: width,
        width,
        height,
    };
    yuv_nv12_to_rgba(
        &image,
        rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 to RGBA failed: {err:?}"))
}

fn yuyv_into(data: &[u8], width: u32, height: u32, rgba: &mut [u8]) -> Result<()> {
    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    yuyv422_to_rgba(
        &packed,
        rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV422 to RGBA failed: {err:?}"))
}

fn decode_mjpeg(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        let decoded = decoder
            .info()
            .map(|info| format!("{}x{}", info.width, info.height))
            .unwrap_or_else(|| "unknown size".into());
        return Err(anyhow!(
            "MJPEG frame is {decoded}, camera reported {width}x{height}"
        ));
    }
    Ok(rgba)
}

/// Packs `stride`-byte pixels into opaque RGBA, picking source bytes by `order`.
fn expand_channels(data: &[u8], stride: usize, order: [usize; 3], rgba: &mut [u8]) {
    rgba.par_chunks_exact_mut(4)
        .zip(data.par_chunks_exact(stride))
        .for_each(|(dst, src)| {
            dst[0] = src[order[0]];
            dst[1] = src[order[1]];
            dst[2] = src[order[2]];
            dst[3] = 255;
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_swaps_channels() {
        let rgba = to_rgba(SourceFormat::Bgr, &[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(rgba, vec![3, 2, 1, 255, 6, 5, 4, 255]);
    }

    #[test]
    fn gray_expands_to_opaque_rgba() {
        let rgba = to_rgba(SourceFormat::Gray, &[7, 9], 1, 2).unwrap();
        assert_eq!(rgba, vec![7, 7, 7, 255, 9, 9, 9, 255]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(to_rgba(SourceFormat::Rgb, &[0; 5], 2, 1).is_err());
        assert!(to_rgba(SourceFormat::Yuyv, &[0; 3], 2, 1).is_err());
        assert!(to_rgba(SourceFormat::Nv12, &[0; 4], 2, 2).is_err());
    }

    #[test]
    fn corrupt_mjpeg_is_an_error() {
        assert!(to_rgba(SourceFormat::Mjpeg, &[0xFF, 0xD8, 0x00], 2, 2).is_err());
    }
}
