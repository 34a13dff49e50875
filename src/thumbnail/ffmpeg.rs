use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use crate::core::{Result, UploadError, UploadFile};
use super::FrameExtractor;

/// Runs the `ffmpeg` binary on a temporary copy of the video
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    program: PathBuf,
}

impl FfmpegFrameExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    fn args(input: &str, at: Duration, width: u32, height: u32) -> Vec<String> {
        // letterbox onto a fixed canvas
        let filter = format!(
            "scale={width}:{height}:force_original_aspect_ratio=decrease,pad={width}:{height}:(ow-iw)/2:(oh-ih)/2"
        );

        vec![
            "-v".into(), "error".into(),
            "-ss".into(), format!("{:.3}", at.as_secs_f64()),
            "-i".into(), input.into(),
            "-frames:v".into(), "1".into(),
            "-vf".into(), filter,
            "-f".into(), "image2pipe".into(),
            "-c:v".into(), "mjpeg".into(),
            "-q:v".into(), "5".into(),
            "pipe:1".into(),
        ]
    }
}

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn extract_frame(&self, file: &UploadFile, at: Duration, width: u32, height: u32) -> Result<Option<Bytes>> {
        // ffmpeg needs a seekable input
        let input = tempfile::Builder::new()
            .prefix("thumb-")
            .suffix(".video")
            .tempfile()?;
        tokio::fs::write(input.path(), &file.data).await?;

        let output = Command::new(&self.program)
            .args(Self::args(&input.path().to_string_lossy(), at, width, height))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UploadError::internal(format!("ffmpeg exited with {}: {}", output.status, stderr.trim())));
        }

        if output.stdout.is_empty() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_args() {
        let args = FfmpegFrameExtractor::args("/tmp/in.video", Duration::from_secs(1), 160, 90);
        let joined = args.join(" ");

        assert!(joined.starts_with("-v error -ss 1.000 -i /tmp/in.video -frames:v 1"));
        assert!(joined.contains("scale=160:90:force_original_aspect_ratio=decrease,pad=160:90"));
        assert!(joined.ends_with("-c:v mjpeg -q:v 5 pipe:1"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let extractor = FfmpegFrameExtractor::new("/nonexistent/ffmpeg-binary");
        let file = UploadFile::new("a.mp4", "video/mp4", vec![0u8; 4]);

        let result = extractor.extract_frame(&file, Duration::ZERO, 16, 9).await;
        assert!(result.is_err());
    }
}
