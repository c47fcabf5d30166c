use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

use crate::types::DetectorKind;

/// ONNX model files the detection engines load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelAsset {
    HandLandmark,
    PalmDetector,
    PoseLandmark,
}

impl ModelAsset {
    pub fn for_detector(kind: DetectorKind) -> &'static [ModelAsset] {
        match kind {
            DetectorKind::Hand => &[ModelAsset::PalmDetector, ModelAsset::HandLandmark],
            DetectorKind::Pose => &[ModelAsset::PoseLandmark],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelAsset::HandLandmark => "hand landmark",
            ModelAsset::PalmDetector => "palm detector",
            ModelAsset::PoseLandmark => "pose landmark",
        }
    }

    pub fn filename(&self) -> &'static str {
        match self {
            ModelAsset::HandLandmark => "handpose_estimation_mediapipe_2023feb.onnx",
            ModelAsset::PalmDetector => "palm_detection_mediapipe_2023feb.onnx",
            ModelAsset::PoseLandmark => "pose_estimation_mediapipe_2023mar.onnx",
        }
    }

    pub fn url(&self) -> &'static str {
        match self {
            ModelAsset::HandLandmark => {
                "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/handpose_estimation_mediapipe_2023feb.onnx"
            }
            ModelAsset::PalmDetector => {
                "https://raw.githubusercontent.com/214zzl995/gesture-universe/refs/heads/main/models/palm_detection_mediapipe_2023feb.onnx"
            }
            ModelAsset::PoseLandmark => {
                "https://huggingface.co/opencv/pose_estimation_mediapipe/resolve/main/pose_estimation_mediapipe_2023mar.onnx"
            }
        }
    }

    pub fn path_in(&self, model_dir: &Path) -> PathBuf {
        model_dir.join(self.filename())
    }
}

pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModelDownloadEvent {
    AlreadyPresent {
        asset: ModelAsset,
    },
    Started {
        asset: ModelAsset,
        total: Option<u64>,
    },
    Progress {
        asset: ModelAsset,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        asset: ModelAsset,
    },
}

/// Makes sure `asset` exists under `model_dir`, downloading it if needed.
///
/// Downloads land in a temp file first, so an interrupted download never
/// leaves a truncated model behind.
pub fn ensure_model_ready<F>(
    asset: ModelAsset,
    model_dir: &Path,
    mut on_event: F,
) -> anyhow::Result<PathBuf>
where
    F: FnMut(ModelDownloadEvent),
{
    let model_path = asset.path_in(model_dir);
    if model_path.exists() {
        log::debug!("{} model present at {}", asset.label(), model_path.display());
        on_event(ModelDownloadEvent::AlreadyPresent { asset });
        on_event(ModelDownloadEvent::Finished { asset });
        return Ok(model_path);
    }

    fs::create_dir_all(model_dir)
        .with_context(|| format!("failed to create model directory {}", model_dir.display()))?;

    let mut progress: Option<ProgressBar> = None;
    download_to_path(asset, asset.url(), &model_path, &mut |event| {
        match &event {
            ModelDownloadEvent::Started { total, .. } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished { asset } => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{} model ready", asset.label()));
                }
            }
            ModelDownloadEvent::AlreadyPresent { .. } => {}
        }
        on_event(event);
    })
    .with_context(|| {
        format!(
            "failed to download {} model to {}",
            asset.label(),
            model_path.display()
        )
    })?;
    Ok(model_path)
}

fn download_to_path<F>(
    asset: ModelAsset,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!(
        "downloading {} model from {url} to {}",
        asset.label(),
        dest.display()
    );

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .context("failed to build download client")?;
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total_size = response.content_length();
    on_event(ModelDownloadEvent::Started {
        asset,
        total: total_size,
    });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            asset,
            downloaded,
            total: total_size,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move temp model {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelDownloadEvent::Finished { asset });
    Ok(())
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .map(|style| style.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading model")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_model_is_used_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let asset = ModelAsset::PoseLandmark;
        fs::write(asset.path_in(dir.path()), b"onnx").unwrap();

        let mut events = Vec::new();
        let path = ensure_model_ready(asset, dir.path(), |evt| events.push(evt)).unwrap();
        assert_eq!(path, dir.path().join(asset.filename()));
        assert_eq!(
            events,
            vec![
                ModelDownloadEvent::AlreadyPresent { asset },
                ModelDownloadEvent::Finished { asset },
            ]
        );
    }

    #[test]
    fn hand_detection_needs_both_models() {
        assert_eq!(
            ModelAsset::for_detector(DetectorKind::Hand),
            &[ModelAsset::PalmDetector, ModelAsset::HandLandmark]
        );
        assert_eq!(
            ModelAsset::for_detector(DetectorKind::Pose),
            &[ModelAsset::PoseLandmark]
        );
        for asset in [
            ModelAsset::HandLandmark,
            ModelAsset::PalmDetector,
            ModelAsset::PoseLandmark,
        ] {
            assert!(asset.url().ends_with(asset.filename()));
        }
    }
}
