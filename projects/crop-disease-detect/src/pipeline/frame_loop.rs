// Per-session frame loop: read -> resize -> infer -> annotate -> write -> emit
//
// Runs on a dedicated blocking thread. Chunks go out through a bounded
// channel so a slow client throttles the loop.

use crate::pipeline::annotate::Annotator;
use crate::pipeline::detection::Detector;
use crate::video::{encode_jpeg, resize_to_target, FrameSink, VideoReader};
use anyhow::Result;
use axum::body::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Writer frame rate for live captures.
pub const CAMERA_FPS: f64 = 20.0;
/// Chunks buffered between the loop and the HTTP body.
pub const CHUNK_BUFFER: usize = 2;
pub const MULTIPART_BOUNDARY: &str = "frame";

/// Frame one JPEG as a part of a `multipart/x-mixed-replace` stream.
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\n\r\n",
        MULTIPART_BOUNDARY
    );
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// Capture and writer handles owned by one streaming request. Both are
/// released when the session is dropped, however the loop ended.
pub struct StreamSession {
    id: Uuid,
    reader: Box<dyn VideoReader>,
    writer: Box<dyn FrameSink>,
    recording: Arc<AtomicBool>,
}

impl StreamSession {
    pub fn new(
        id: Uuid,
        reader: Box<dyn VideoReader>,
        writer: Box<dyn FrameSink>,
        recording: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            reader,
            writer,
            recording,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Err(e) = self.reader.release() {
            tracing::warn!("Session {}: failed to release capture: {:#}", self.id, e);
        }
        if let Err(e) = self.writer.release() {
            tracing::warn!("Session {}: failed to release writer: {:#}", self.id, e);
        }
        tracing::debug!("Session {}: capture and writer released", self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Source exhausted or unreadable.
    EndOfStream,
    /// Recording flag cleared.
    Cancelled,
    /// Receiving side of the chunk channel closed.
    ClientGone,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLoopStats {
    pub frames: usize,
    pub detections: usize,
    pub stop: StopReason,
}

/// Drive `session` until its source ends, it is cancelled, or the client
/// goes away. Every processed frame is written to the session's writer and
/// sent as a multipart chunk.
pub fn run_frame_loop(
    session: &mut StreamSession,
    detector: &mut Detector,
    annotator: &Annotator,
    min_conf: f32,
    tx: &mpsc::Sender<Bytes>,
) -> Result<FrameLoopStats> {
    let mut frames = 0usize;
    let mut detections = 0usize;

    let stop = loop {
        if !session.is_recording() {
            break StopReason::Cancelled;
        }

        let frame = match session.reader.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Session {}: end of stream: {:#}", session.id, e);
                break StopReason::EndOfStream;
            }
        };

        let frame = resize_to_target(&frame)?;
        let inference = detector.infer(&frame, min_conf)?;
        detections += inference.detections().len();

        let annotated = annotator.annotate(&frame, inference.detections())?;
        session.writer.write(&annotated)?;

        let jpeg = encode_jpeg(&annotated)?;
        if tx.blocking_send(multipart_chunk(&jpeg)).is_err() {
            tracing::info!("Session {}: client disconnected", session.id);
            break StopReason::ClientGone;
        }

        frames += 1;
        if frames % 100 == 0 {
            tracing::debug!(
                "Session {}: {} frames, last inference {:.3}s",
                session.id,
                frames,
                inference.elapsed_secs()
            );
        }
    };

    tracing::info!(
        "Session {}: loop finished ({:?}) after {} frames, {} detections",
        session.id,
        stop,
        frames,
        detections
    );
    Ok(FrameLoopStats {
        frames,
        detections,
        stop,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::detection::tests::{raw, FixedLoader};
    use crate::pipeline::labels::CropKind;
    use anyhow::anyhow;
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use opencv::prelude::*;
    use std::sync::atomic::AtomicUsize;

    /// Reader producing `remaining` grey frames, then end-of-stream.
    pub(crate) struct FakeReader {
        pub remaining: usize,
        pub released: Arc<AtomicUsize>,
    }

    impl VideoReader for FakeReader {
        fn next_frame(&mut self) -> Result<Mat> {
            if self.remaining == 0 {
                return Err(anyhow!("exhausted"));
            }
            self.remaining -= 1;
            Ok(Mat::new_rows_cols_with_default(
                360,
                480,
                CV_8UC3,
                Scalar::all(100.0),
            )?)
        }

        fn source_fps(&self) -> f64 {
            25.0
        }

        fn release(&mut self) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct CountingSink {
        pub written: Arc<AtomicUsize>,
        pub released: Arc<AtomicUsize>,
    }

    impl FrameSink for CountingSink {
        fn write(&mut self, frame: &Mat) -> Result<()> {
            assert_eq!((frame.cols(), frame.rows()), (640, 480));
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&mut self) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        session: StreamSession,
        detector: Detector,
        sink: CountingSink,
        reader_released: Arc<AtomicUsize>,
        recording: Arc<AtomicBool>,
        _weights: tempfile::TempDir,
    }

    fn harness(frames: usize) -> Harness {
        let weights = tempfile::tempdir().unwrap();
        let model = weights.path().join("corn_best.onnx");
        std::fs::write(&model, b"onnx").unwrap();
        let loader = FixedLoader::new(vec![raw(1, 0.8)]);
        let detector = Detector::load(&loader, &model, CropKind::Corn).unwrap();

        let reader_released = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink::default();
        let recording = Arc::new(AtomicBool::new(true));
        let session = StreamSession::new(
            Uuid::new_v4(),
            Box::new(FakeReader {
                remaining: frames,
                released: reader_released.clone(),
            }),
            Box::new(sink.clone()),
            recording.clone(),
        );
        Harness {
            session,
            detector,
            sink,
            reader_released,
            recording,
            _weights: weights,
        }
    }

    #[test]
    fn test_multipart_chunk_framing() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert!(chunk.ends_with(b"\xFF\xD9\r\n"));
    }

    #[test]
    fn test_loop_runs_to_end_of_stream() {
        let mut h = harness(3);
        let (tx, mut rx) = mpsc::channel(8);
        let stats = run_frame_loop(
            &mut h.session,
            &mut h.detector,
            &Annotator::new(None).unwrap(),
            0.5,
            &tx,
        )
        .unwrap();

        assert_eq!(stats.stop, StopReason::EndOfStream);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.detections, 3);
        assert_eq!(h.sink.written.load(Ordering::SeqCst), 3);

        let mut chunks = 0;
        while let Ok(chunk) = rx.try_recv() {
            assert!(chunk.starts_with(b"--frame\r\n"));
            chunks += 1;
        }
        assert_eq!(chunks, 3);

        drop(h.session);
        assert_eq!(h.reader_released.load(Ordering::SeqCst), 1);
        assert_eq!(h.sink.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleared_flag_stops_before_next_frame() {
        let mut h = harness(10);
        h.recording.store(false, Ordering::Relaxed);
        let (tx, _rx) = mpsc::channel(8);
        let stats = run_frame_loop(
            &mut h.session,
            &mut h.detector,
            &Annotator::new(None).unwrap(),
            0.5,
            &tx,
        )
        .unwrap();

        assert_eq!(stats.stop, StopReason::Cancelled);
        assert_eq!(stats.frames, 0);
        assert_eq!(h.sink.written.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closed_channel_ends_loop() {
        let mut h = harness(10);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let stats = run_frame_loop(
            &mut h.session,
            &mut h.detector,
            &Annotator::new(None).unwrap(),
            0.5,
            &tx,
        )
        .unwrap();

        assert_eq!(stats.stop, StopReason::ClientGone);
        assert_eq!(stats.frames, 0);
        // The frame in flight was still recorded.
        assert_eq!(h.sink.written.load(Ordering::SeqCst), 1);
    }
}
