use super::{VideoReader, TARGET_HEIGHT, TARGET_WIDTH};
use anyhow::{anyhow, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};
use std::path::Path;

const FALLBACK_FPS: f64 = 30.0;

pub struct OpencvReader {
    capture: VideoCapture,
    source: String,
    source_fps: f64,
}

impl OpencvReader {
    /// Open a video file.
    pub fn open_file(path: &Path) -> Result<Self> {
        let source = path.to_string_lossy().to_string();
        let capture = VideoCapture::from_file(&source, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", source));
        }

        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?;
        let reader = Self::with_capture(capture, source)?;
        tracing::info!(
            "OpencvReader: opened {}, fps={:.2}, stream_frames={}",
            reader.source,
            reader.source_fps,
            raw_count
        );
        Ok(reader)
    }

    /// Open a local capture device, requesting the pipeline resolution.
    pub fn open_camera(index: i32) -> Result<Self> {
        let mut capture = VideoCapture::new(index, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open camera {}", index));
        }
        capture.set(CAP_PROP_FRAME_WIDTH, TARGET_WIDTH as f64)?;
        capture.set(CAP_PROP_FRAME_HEIGHT, TARGET_HEIGHT as f64)?;

        let reader = Self::with_capture(capture, format!("camera:{}", index))?;
        tracing::info!("OpencvReader: opened {}", reader.source);
        Ok(reader)
    }

    fn with_capture(capture: VideoCapture, source: String) -> Result<Self> {
        let mut fps = capture.get(CAP_PROP_FPS)?;
        if !fps.is_finite() || fps <= 0.0 {
            tracing::warn!(
                "OpencvReader: no FPS in metadata for {}, falling back to {}",
                source,
                FALLBACK_FPS
            );
            fps = FALLBACK_FPS;
        }
        Ok(Self {
            capture,
            source,
            source_fps: fps,
        })
    }
}

impl VideoReader for OpencvReader {
    fn next_frame(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Err(anyhow!("No more frames from {}", self.source));
        }
        Ok(frame)
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn release(&mut self) -> Result<()> {
        if self.capture.is_opened()? {
            self.capture.release()?;
            tracing::debug!("OpencvReader: released {}", self.source);
        }
        Ok(())
    }
}
