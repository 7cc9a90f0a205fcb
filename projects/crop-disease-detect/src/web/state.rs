use crate::events::EventHub;
use crate::pipeline::annotate::Annotator;
use crate::pipeline::detection::ModelLoader;
use crate::pipeline::orchestrator::SessionRegistry;
use crate::settings::Settings;
use crate::transfer::TransferClient;
use crate::video::transcode::Transcoder;
use crate::video::MediaBackend;
use anyhow::Result;
use std::sync::Arc;

/// Shared handles passed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub loader: Arc<dyn ModelLoader>,
    pub media: Arc<dyn MediaBackend>,
    pub annotator: Arc<Annotator>,
    pub transfer: TransferClient,
    pub transcoder: Transcoder,
    pub events: EventHub,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        loader: Arc<dyn ModelLoader>,
        media: Arc<dyn MediaBackend>,
    ) -> Result<Self> {
        let annotator = Annotator::new(settings.font_path.as_deref())?;
        let transfer = TransferClient::new(settings.http_timeout, settings.upload_url())?;
        let transcoder = Transcoder::new(settings.ffmpeg_bin.clone());

        Ok(Self {
            settings: Arc::new(settings),
            loader,
            media,
            annotator: Arc::new(annotator),
            transfer,
            transcoder,
            events: EventHub::new(),
            sessions: Arc::new(SessionRegistry::default()),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::detection::tests::FixedLoader;
    use crate::pipeline::orchestrator::tests::FakeMedia;
    use axum::body::Bytes;
    use axum::extract::{Path, State};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) struct TestEnv {
        pub state: AppState,
        pub weights: TempDir,
        pub scratch: TempDir,
    }

    /// State backed by temp directories holding corn, rice and strawberry
    /// artifacts (no tomato), a fake media backend and a missing encoder.
    pub(crate) async fn test_env(loader: FixedLoader, media: FakeMedia, records_url: &str) -> TestEnv {
        let weights = tempfile::tempdir().unwrap();
        for name in ["corn_best.onnx", "rice_best.onnx", "strawberry_best.onnx"] {
            std::fs::write(weights.path().join(name), b"onnx").unwrap();
        }
        let scratch = tempfile::tempdir().unwrap();

        let settings = Settings {
            weights_dir: weights.path().to_path_buf(),
            scratch_dir: scratch.path().to_path_buf(),
            font_path: None,
            records_url: records_url.to_string(),
            ffmpeg_bin: "/nonexistent/ffmpeg".to_string(),
            camera_index: 0,
            http_timeout: Duration::from_secs(2),
        };
        let state = AppState::new(settings, Arc::new(loader), Arc::new(media)).unwrap();
        TestEnv {
            state,
            weights,
            scratch,
        }
    }

    pub(crate) struct RecordsServer {
        pub base: String,
        pub records: Arc<Mutex<Vec<(String, Value)>>>,
        pub uploads: Arc<Mutex<Vec<Bytes>>>,
    }

    #[derive(Clone)]
    struct Captured {
        records: Arc<Mutex<Vec<(String, Value)>>>,
        uploads: Arc<Mutex<Vec<Bytes>>>,
    }

    /// Local stand-in for the storage/records service.
    pub(crate) async fn records_server() -> RecordsServer {
        let captured = Captured {
            records: Arc::new(Mutex::new(Vec::new())),
            uploads: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route(
                "/files/upload",
                post(|State(c): State<Captured>, body: Bytes| async move {
                    c.uploads.lock().unwrap().push(body);
                    Json(json!({"data": "http://store/result.jpg"}))
                }),
            )
            .route(
                "/:endpoint",
                post(
                    |State(c): State<Captured>, Path(endpoint): Path<String>, Json(v): Json<Value>| async move {
                        c.records.lock().unwrap().push((format!("/{}", endpoint), v));
                        Json(json!({"code": 0}))
                    },
                ),
            )
            .with_state(captured.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        RecordsServer {
            base: format!("http://{}", addr),
            records: captured.records,
            uploads: captured.uploads,
        }
    }
}
