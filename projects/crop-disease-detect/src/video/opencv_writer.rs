use super::{target_size, FrameSink};
use anyhow::{anyhow, Result};
use opencv::{core::Mat, prelude::*, videoio::VideoWriter};
use std::path::{Path, PathBuf};

/// XVID/AVI writer for annotated frames at the pipeline resolution.
pub struct OpencvWriter {
    writer: VideoWriter,
    path: PathBuf,
    frames: usize,
}

impl OpencvWriter {
    pub fn create(path: &Path, fps: f64) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Output path is not valid UTF-8: {:?}", path))?;
        let fourcc = VideoWriter::fourcc('X', 'V', 'I', 'D')?;
        let writer = VideoWriter::new(path_str, fourcc, fps, target_size(), true)?;
        if !writer.is_opened()? {
            return Err(anyhow!("Failed to open video writer at {}", path_str));
        }
        tracing::info!("OpencvWriter: writing {} at {:.2} fps", path_str, fps);
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            frames: 0,
        })
    }
}

impl FrameSink for OpencvWriter {
    fn write(&mut self, frame: &Mat) -> Result<()> {
        self.writer.write(frame)?;
        self.frames += 1;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.writer.is_opened()? {
            self.writer.release()?;
            tracing::info!(
                "OpencvWriter: closed {} after {} frames",
                self.path.display(),
                self.frames
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn test_write_and_release_produces_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("capture.avi");
        let mut writer = OpencvWriter::create(&path, 20.0).unwrap();
        let frame = Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(90.0)).unwrap();
        for _ in 0..3 {
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();
        // A second release is a no-op.
        writer.release().unwrap();

        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
