//! Preview images for queued uploads.
//!
//! Images are passed through as-is, videos get their frame at one second
//! (or the first frame when shorter) scaled onto a small canvas. Nothing in
//! here can fail an enqueue: every error collapses into "no thumbnail".

mod ffmpeg;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use tracing::debug;
use crate::core::{Result, UploadFile};

pub use ffmpeg::FfmpegFrameExtractor;

#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    /// Position of the captured video frame
    pub seek: Duration,
    pub timeout: Duration,
    pub ffmpeg_path: PathBuf,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 160,
            height: 90,
            seek: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

/// Captures a single JPEG frame from a video
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// `Ok(None)` when the video has no frame at `at`
    async fn extract_frame(&self, file: &UploadFile, at: Duration, width: u32, height: u32) -> Result<Option<Bytes>>;
}

#[derive(Clone)]
pub struct ThumbnailGenerator {
    config: ThumbnailConfig,
    extractor: Arc<dyn FrameExtractor>,
}

impl ThumbnailGenerator {
    pub fn new(config: ThumbnailConfig) -> Self {
        let extractor = Arc::new(FfmpegFrameExtractor::new(config.ffmpeg_path.clone()));
        Self { config, extractor }
    }

    pub fn with_extractor(config: ThumbnailConfig, extractor: Arc<dyn FrameExtractor>) -> Self {
        Self { config, extractor }
    }

    pub fn disabled() -> Self {
        Self::new(ThumbnailConfig {
            enabled: false,
            ..ThumbnailConfig::default()
        })
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    /// Data URL of the preview, if one can be produced
    pub async fn generate(&self, file: &UploadFile) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        if file.is_image() {
            return Some(data_url(&file.mime_type, &file.data));
        }

        if !file.is_video() {
            return None;
        }

        match tokio::time::timeout(self.config.timeout, self.capture_video_frame(file)).await {
            Ok(Ok(Some(frame))) => Some(data_url("image/jpeg", &frame)),
            Ok(Ok(None)) => {
                debug!(file = %file.name, "video has no frame to capture");
                None
            }
            Ok(Err(err)) => {
                debug!(file = %file.name, error = %err, "thumbnail capture failed");
                None
            }
            Err(_) => {
                debug!(file = %file.name, timeout = ?self.config.timeout, "thumbnail capture timed out");
                None
            }
        }
    }

    async fn capture_video_frame(&self, file: &UploadFile) -> Result<Option<Bytes>> {
        let (width, height) = (self.config.width, self.config.height);

        let frame = self.extractor
            .extract_frame(file, self.config.seek, width, height)
            .await?;
        if frame.as_ref().is_some_and(|frame| !frame.is_empty()) {
            return Ok(frame);
        }

        // shorter than the seek position
        let frame = self.extractor
            .extract_frame(file, Duration::ZERO, width, height)
            .await?;
        Ok(frame.filter(|frame| !frame.is_empty()))
    }
}

pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}
