use crate::pipeline::labels::CropKind;
use crate::pipeline::orchestrator::StreamKind;
use crate::pipeline::types::DetectionRequest;
use crate::web::state::AppState;
use crate::workspace::SessionWorkspace;
use futures::StreamExt;
use serde::Serialize;

/// Record posted to the records service once a stream has been saved.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub username: String,
    pub weight: String,
    pub conf: f32,
    pub start_time: String,
    pub kind: CropKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_video: Option<String>,
    pub out_video: String,
}

impl CompletionRecord {
    pub fn new(request: &DetectionRequest, kind: StreamKind, out_video: String) -> Self {
        let input_video = match kind {
            StreamKind::Video => request.location().map(str::to_string),
            StreamKind::Camera => None,
        };
        Self {
            username: request.username.clone(),
            weight: request.model_name.clone(),
            conf: request.confidence,
            start_time: request.start_time.clone(),
            kind: request.kind,
            input_video,
            out_video,
        }
    }
}

/// Transcode the session's capture, upload it, post the completion record
/// and remove the session. Never fails; every step degrades on error.
pub async fn finalize_session(
    state: &AppState,
    request: &DetectionRequest,
    kind: StreamKind,
    workspace: SessionWorkspace,
) {
    let id = workspace.id();
    state.events.message("Processing complete, saving...");

    let mut progress = Box::pin(
        state
            .transcoder
            .run(&workspace.capture_path(), &workspace.output_path()),
    );
    while let Some(percent) = progress.next().await {
        state.events.progress(percent);
    }

    let out_video = state.transfer.upload(&workspace.output_path()).await;
    let record = CompletionRecord::new(request, kind, out_video);
    let endpoint = match kind {
        StreamKind::Video => state.settings.video_records_url(),
        StreamKind::Camera => state.settings.camera_records_url(),
    };
    state.transfer.post_record(&record, &endpoint).await;

    state.sessions.unregister(id);
    tracing::info!(
        "Session {} finalized, removing {}",
        id,
        workspace.dir().display()
    );
    drop(workspace);
}
