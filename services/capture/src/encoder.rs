//! Artifact encoder boundary and the ffmpeg-backed implementation.

use crate::error::EncodeError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

/// Turns an ordered frame sequence into one video file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactEncoder: Send + Sync {
    /// On success `output` holds a playable file.
    async fn encode(
        &self,
        frames: &[Bytes],
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), EncodeError>;
}

/// Encodes JPEG frames into an MJPEG video with an `ffmpeg` child process.
pub struct FfmpegEncoder {
    ffmpeg_path: String,
    quality: u8,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: impl Into<String>, quality: u8) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            quality,
        }
    }

    /// Write frames as `frame_0000.jpg`, `frame_0001.jpg`, ... so ffmpeg's
    /// image2 demuxer reads them back in arrival order.
    async fn stage_frames(frames: &[Bytes], dir: &Path) -> Result<(), EncodeError> {
        for (i, frame) in frames.iter().enumerate() {
            let frame_path = dir.join(format!("frame_{:04}.jpg", i));
            tokio::fs::write(&frame_path, frame).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactEncoder for FfmpegEncoder {
    #[instrument(skip(self, frames), fields(frames = frames.len(), output = %output.display()))]
    async fn encode(
        &self,
        frames: &[Bytes],
        frame_rate: u32,
        output: &Path,
    ) -> Result<(), EncodeError> {
        if frames.is_empty() {
            return Err(EncodeError::NoFrames);
        }

        // Lives beside the output; removed when `staging` drops.
        let staging_root = output.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix("frames_")
            .tempdir_in(staging_root)?;

        Self::stage_frames(frames, staging.path()).await?;

        let input_pattern = staging.path().join("frame_%04d.jpg");
        let frame_rate = frame_rate.to_string();
        let quality = self.quality.to_string();

        debug!(ffmpeg = %self.ffmpeg_path, "Running encoder");

        let result = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .args(["-loglevel", "error"])
            .args(["-framerate", frame_rate.as_str()])
            .arg("-i")
            .arg(&input_pattern)
            .args(["-c:v", "mjpeg"])
            .args(["-q:v", quality.as_str()])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(EncodeError::Spawn)?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            error!(status = %result.status, stderr = %stderr, "ffmpeg failed");
            return Err(EncodeError::Failed {
                status: result.status.to_string(),
                stderr,
            });
        }

        if tokio::fs::metadata(output).await.is_err() {
            return Err(EncodeError::MissingOutput(output.display().to_string()));
        }

        info!(output = %output.display(), "Created MJPEG video");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_frames_names_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let frames = vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")];

        FfmpegEncoder::stage_frames(&frames, dir.path()).await.unwrap();

        let first = tokio::fs::read(dir.path().join("frame_0000.jpg")).await.unwrap();
        let second = tokio::fs::read(dir.path().join("frame_0001.jpg")).await.unwrap();
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[tokio::test]
    async fn test_empty_frames_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::new("ffmpeg", 2);

        let result = encoder.encode(&[], 10, &dir.path().join("out.mjpeg")).await;
        assert!(matches!(result, Err(EncodeError::NoFrames)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported_and_staging_removed() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg-binary", 2);
        let frames = vec![Bytes::from_static(b"jpeg")];

        let result = encoder.encode(&frames, 10, &dir.path().join("out.mjpeg")).await;
        assert!(matches!(result, Err(EncodeError::Spawn(_))));

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
