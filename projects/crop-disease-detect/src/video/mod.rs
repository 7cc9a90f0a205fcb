pub mod opencv_reader;
pub mod opencv_writer;
pub mod probe;
pub mod transcode;

use anyhow::Result;
use opencv::core::{Mat, Size};
use opencv::prelude::*;
use std::path::Path;

/// Every frame is normalized to this resolution before inference.
pub const TARGET_WIDTH: i32 = 640;
pub const TARGET_HEIGHT: i32 = 480;

pub trait VideoReader: Send {
    fn next_frame(&mut self) -> Result<Mat>;
    fn source_fps(&self) -> f64;
    fn release(&mut self) -> Result<()>;
}

/// Destination for annotated frames (a container on disk in production).
pub trait FrameSink: Send {
    fn write(&mut self, frame: &Mat) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Opens capture sources and output containers for streaming sessions.
pub trait MediaBackend: Send + Sync {
    fn open_file(&self, path: &Path) -> Result<Box<dyn VideoReader>>;
    fn open_camera(&self, index: i32) -> Result<Box<dyn VideoReader>>;
    fn create_writer(&self, path: &Path, fps: f64) -> Result<Box<dyn FrameSink>>;
}

/// OpenCV-backed capture and XVID output.
pub struct OpencvBackend;

impl MediaBackend for OpencvBackend {
    fn open_file(&self, path: &Path) -> Result<Box<dyn VideoReader>> {
        Ok(Box::new(opencv_reader::OpencvReader::open_file(path)?))
    }

    fn open_camera(&self, index: i32) -> Result<Box<dyn VideoReader>> {
        Ok(Box::new(opencv_reader::OpencvReader::open_camera(index)?))
    }

    fn create_writer(&self, path: &Path, fps: f64) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(opencv_writer::OpencvWriter::create(path, fps)?))
    }
}

pub fn target_size() -> Size {
    Size::new(TARGET_WIDTH, TARGET_HEIGHT)
}

/// Resize a frame to the pipeline's fixed resolution.
pub fn resize_to_target(frame: &Mat) -> Result<Mat> {
    if frame.cols() == TARGET_WIDTH && frame.rows() == TARGET_HEIGHT {
        return Ok(frame.try_clone()?);
    }
    let mut resized = Mat::default();
    opencv::imgproc::resize(
        frame,
        &mut resized,
        target_size(),
        0.0,
        0.0,
        opencv::imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}

/// Encode a frame as JPEG bytes.
pub fn encode_jpeg(frame: &Mat) -> Result<Vec<u8>> {
    let mut buf = opencv::core::Vector::<u8>::new();
    opencv::imgcodecs::imencode(".jpg", frame, &mut buf, &opencv::core::Vector::new())?;
    Ok(buf.to_vec())
}
