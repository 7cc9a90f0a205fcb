// Streaming session lifecycle
//
// Validates a streaming request, opens model, capture and writer on the
// session's blocking thread, streams from that same thread, and runs
// finalization once the loop ends.

use crate::error::ServiceError;
use crate::pipeline::detection::Detector;
use crate::pipeline::finalize::finalize_session;
use crate::pipeline::frame_loop::{
    run_frame_loop, FrameLoopStats, StreamSession, CAMERA_FPS, CHUNK_BUFFER, MULTIPART_BOUNDARY,
};
use crate::pipeline::labels::CropKind;
use crate::pipeline::types::DetectionRequest;
use crate::web::state::AppState;
use crate::workspace::SessionWorkspace;
use anyhow::anyhow;
use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use futures::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

pub const SESSION_HEADER: &str = "X-Session-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Camera,
}

impl StreamKind {
    /// Request parameter carrying the source location, if any.
    pub fn source_key(&self) -> Option<&'static str> {
        match self {
            StreamKind::Video => Some("inputVideo"),
            StreamKind::Camera => None,
        }
    }
}

struct SessionEntry {
    kind: StreamKind,
    recording: Arc<AtomicBool>,
}

/// Recording flags of the sessions currently streaming.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl SessionRegistry {
    pub fn register(&self, id: Uuid, kind: StreamKind) -> Arc<AtomicBool> {
        let recording = Arc::new(AtomicBool::new(true));
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(
            id,
            SessionEntry {
                kind,
                recording: recording.clone(),
            },
        );
        tracing::info!(
            "Registered {:?} session {} ({} active)",
            kind,
            id,
            sessions.len()
        );
        recording
    }

    pub fn unregister(&self, id: Uuid) {
        if self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
        {
            tracing::info!("Unregistered session {}", id);
        }
    }

    /// Clear the recording flag of one session.
    pub fn stop(&self, id: Uuid) -> bool {
        match self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            Some(entry) => {
                entry.recording.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Clear the recording flag of every camera session. Returns how many
    /// were signalled.
    pub fn stop_cameras(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut stopped = 0;
        for entry in sessions.values().filter(|e| e.kind == StreamKind::Camera) {
            entry.recording.store(false, Ordering::Relaxed);
            stopped += 1;
        }
        stopped
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Inputs of the blocking thread that owns a session's model, capture and
/// writer.
struct SessionSetup {
    id: Uuid,
    model_path: PathBuf,
    crop: CropKind,
    input: Option<PathBuf>,
    capture_path: PathBuf,
    recording: Arc<AtomicBool>,
    min_conf: f32,
}

/// Start a streaming session and return the multipart response that
/// carries its frames. Failures before the first frame come back as errors
/// and leave nothing behind.
pub async fn start_stream(
    state: AppState,
    params: HashMap<String, String>,
    kind: StreamKind,
) -> Result<Response, ServiceError> {
    let request = DetectionRequest::from_params(&params, kind.source_key())?;
    let model_path = state.settings.model_path(&request.model_name);
    if !model_path.is_file() {
        return Err(ServiceError::ModelNotFound(model_path));
    }

    let workspace = SessionWorkspace::create(state.settings.scratch_dir())?;
    let id = workspace.id();

    let input = match request.location() {
        Some(location) => {
            let dest = workspace.download_path();
            if !state.transfer.fetch(location, &dest).await {
                return Err(ServiceError::SourceUnavailable(location.to_string()));
            }
            Some(dest)
        }
        None => {
            state.events.message("Loading, please wait...");
            None
        }
    };

    let setup = SessionSetup {
        id,
        model_path,
        crop: request.kind,
        input,
        capture_path: workspace.capture_path(),
        recording: state.sessions.register(id, kind),
        min_conf: request.confidence,
    };
    let (ready_tx, ready_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel::<Bytes>(CHUNK_BUFFER);
    let worker = {
        let state = state.clone();
        tokio::task::spawn_blocking(move || session_worker(&state, setup, ready_tx, tx))
    };

    let ready = ready_rx
        .await
        .unwrap_or_else(|_| Err(anyhow!("Session {} worker exited during setup", id).into()));
    if let Err(e) = ready {
        state.sessions.unregister(id);
        return Err(e);
    }

    tokio::spawn({
        let state = state.clone();
        async move {
            match worker.await {
                Ok(Some(stats)) => tracing::info!(
                    "Session {} streamed {} frames ({:?})",
                    id,
                    stats.frames,
                    stats.stop
                ),
                Ok(None) => {}
                Err(e) => tracing::error!("Session {} frame loop panicked: {}", id, e),
            }
            finalize_session(&state, &request, kind, workspace).await;
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MULTIPART_BOUNDARY),
        )
        .header(SESSION_HEADER, id.to_string())
        .body(body)
        .map_err(|e| ServiceError::from(anyhow!("Failed to build stream response: {}", e)))
}

/// Body of a session's blocking thread: open everything, report readiness,
/// then run the frame loop. Capture and writer are released when the
/// session drops, on every exit path.
fn session_worker(
    state: &AppState,
    setup: SessionSetup,
    ready: oneshot::Sender<Result<(), ServiceError>>,
    tx: mpsc::Sender<Bytes>,
) -> Option<FrameLoopStats> {
    let (mut session, mut detector) = match open_session(state, &setup) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return None;
        }
    };
    if ready.send(Ok(())).is_err() {
        tracing::warn!("Session {}: request dropped before streaming", setup.id);
        state.sessions.unregister(setup.id);
        return None;
    }

    match run_frame_loop(&mut session, &mut detector, &state.annotator, setup.min_conf, &tx) {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::error!("Session {} frame loop failed: {:#}", setup.id, e);
            None
        }
    }
}

fn open_session(
    state: &AppState,
    setup: &SessionSetup,
) -> Result<(StreamSession, Detector), ServiceError> {
    let detector = Detector::load(state.loader.as_ref(), &setup.model_path, setup.crop)?;

    let (reader, fps) = match &setup.input {
        Some(path) => {
            let reader = state
                .media
                .open_file(path)
                .map_err(|e| ServiceError::SourceUnavailable(format!("{:#}", e)))?;
            let fps = reader.source_fps();
            (reader, fps)
        }
        None => {
            let reader = state
                .media
                .open_camera(state.settings.camera_index)
                .map_err(|e| ServiceError::SourceUnavailable(format!("{:#}", e)))?;
            (reader, CAMERA_FPS)
        }
    };

    let writer = state.media.create_writer(&setup.capture_path, fps)?;
    let session = StreamSession::new(setup.id, reader, writer, setup.recording.clone());
    Ok((session, detector))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::detection::tests::{raw, FixedLoader};
    use crate::pipeline::frame_loop::tests::{CountingSink, FakeReader};
    use crate::video::{FrameSink, MediaBackend, VideoReader};
    use crate::web::state::tests::{records_server, test_env};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Backend serving fake readers: `file_frames` for files, a practically
    /// endless camera.
    pub(crate) struct FakeMedia {
        pub file_frames: usize,
        pub fail_open: bool,
        pub sink: CountingSink,
    }

    impl FakeMedia {
        pub(crate) fn new(file_frames: usize) -> Self {
            Self {
                file_frames,
                fail_open: false,
                sink: CountingSink::default(),
            }
        }
    }

    impl MediaBackend for FakeMedia {
        fn open_file(&self, _path: &Path) -> anyhow::Result<Box<dyn VideoReader>> {
            if self.fail_open {
                return Err(anyhow!("unsupported container"));
            }
            Ok(Box::new(FakeReader {
                remaining: self.file_frames,
                released: Arc::new(AtomicUsize::new(0)),
            }))
        }

        fn open_camera(&self, _index: i32) -> anyhow::Result<Box<dyn VideoReader>> {
            if self.fail_open {
                return Err(anyhow!("no camera"));
            }
            Ok(Box::new(FakeReader {
                remaining: usize::MAX,
                released: Arc::new(AtomicUsize::new(0)),
            }))
        }

        fn create_writer(&self, _path: &Path, _fps: f64) -> anyhow::Result<Box<dyn FrameSink>> {
            Ok(Box::new(self.sink.clone()))
        }
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn scratch_entries(path: &Path) -> usize {
        std::fs::read_dir(path).unwrap().count()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_registry_stop_and_unregister() {
        let registry = SessionRegistry::default();
        let video = Uuid::new_v4();
        let camera = Uuid::new_v4();
        let video_flag = registry.register(video, StreamKind::Video);
        let camera_flag = registry.register(camera, StreamKind::Camera);
        assert_eq!(registry.active_count(), 2);

        assert_eq!(registry.stop_cameras(), 1);
        assert!(video_flag.load(Ordering::Relaxed));
        assert!(!camera_flag.load(Ordering::Relaxed));

        assert!(registry.stop(video));
        assert!(!video_flag.load(Ordering::Relaxed));

        registry.unregister(video);
        registry.unregister(camera);
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.stop(video));
        assert_eq!(registry.stop_cameras(), 0);
    }

    #[tokio::test]
    async fn test_missing_model_fails_before_any_work() {
        let loader = FixedLoader::new(vec![]);
        let loads = loader.loads.clone();
        let env = test_env(loader, FakeMedia::new(3), "http://127.0.0.1:9").await;

        let err = start_stream(
            env.state.clone(),
            params(&[("weight", "tomato_best.onnx"), ("inputVideo", "/tmp/x.mp4")]),
            StreamKind::Video,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ServiceError::ModelNotFound(_)));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert_eq!(scratch_entries(env.scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_unreachable_video_cleans_up() {
        let env = test_env(FixedLoader::new(vec![]), FakeMedia::new(3), "http://127.0.0.1:9").await;

        let err = start_stream(
            env.state.clone(),
            params(&[("weight", "rice_best.onnx"), ("inputVideo", "/no/such/video.mp4")]),
            StreamKind::Video,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ServiceError::SourceUnavailable(_)));
        assert_eq!(env.state.sessions.active_count(), 0);
        assert_eq!(scratch_entries(env.scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_unopenable_camera_unregisters() {
        let mut media = FakeMedia::new(0);
        media.fail_open = true;
        let env = test_env(FixedLoader::new(vec![]), media, "http://127.0.0.1:9").await;

        let err = start_stream(
            env.state.clone(),
            params(&[("weight", "corn_best.onnx")]),
            StreamKind::Camera,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ServiceError::SourceUnavailable(_)));
        assert_eq!(env.state.sessions.active_count(), 0);
        assert_eq!(scratch_entries(env.scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_video_session_streams_then_finalizes() {
        let records = records_server().await;
        let media = FakeMedia::new(4);
        let sink = media.sink.clone();
        let env = test_env(FixedLoader::new(vec![raw(0, 0.9)]), media, &records.base).await;
        let source = env.weights.path().join("clip.mp4");
        std::fs::write(&source, b"not really a video").unwrap();

        let response = start_stream(
            env.state.clone(),
            params(&[
                ("weight", "rice_best.onnx"),
                ("inputVideo", source.to_str().unwrap()),
                ("username", "alice"),
                ("startTime", "2024-05-01 10:00:00"),
            ]),
            StreamKind::Video,
        )
        .await
        .unwrap();

        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("multipart/x-mixed-replace"));
        assert!(response.headers().contains_key(SESSION_HEADER));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text.matches("--frame\r\n").count(), 4);

        let posted = records.records.clone();
        wait_for(|| !posted.lock().unwrap().is_empty()).await;
        let (endpoint, record) = posted.lock().unwrap()[0].clone();
        assert_eq!(endpoint, "/videoRecords");
        assert_eq!(record["username"], "alice");
        assert_eq!(record["weight"], "rice_best.onnx");
        assert_eq!(record["kind"], "rice");
        assert_eq!(record["inputVideo"], source.to_str().unwrap());
        assert_eq!(record["outVideo"], "");

        let scratch = env.scratch.path().to_path_buf();
        wait_for(|| scratch_entries(&scratch) == 0).await;
        assert_eq!(env.state.sessions.active_count(), 0);
        assert_eq!(sink.written.load(Ordering::SeqCst), 4);
        assert_eq!(sink.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_camera_session_stops_on_flag() {
        let records = records_server().await;
        let env = test_env(FixedLoader::new(vec![]), FakeMedia::new(0), &records.base).await;

        let response = start_stream(
            env.state.clone(),
            params(&[("weight", "strawberry_best.onnx"), ("conf", "0.3")]),
            StreamKind::Camera,
        )
        .await
        .unwrap();
        assert_eq!(env.state.sessions.active_count(), 1);

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame\r\n"));

        assert_eq!(env.state.sessions.stop_cameras(), 1);
        while frames.next().await.is_some() {}

        let posted = records.records.clone();
        wait_for(|| !posted.lock().unwrap().is_empty()).await;
        let (endpoint, record) = posted.lock().unwrap()[0].clone();
        assert_eq!(endpoint, "/cameraRecords");
        assert_eq!(record["kind"], "strawberry");
        assert!(record.get("inputVideo").is_none());

        let scratch = env.scratch.path().to_path_buf();
        wait_for(|| scratch_entries(&scratch) == 0).await;
        assert_eq!(env.state.sessions.active_count(), 0);
    }
}
