use crate::error::ServiceError;
use crate::pipeline::detection::Detector;
use crate::pipeline::labels::weight_catalog;
use crate::pipeline::orchestrator::{start_stream, StreamKind};
use crate::pipeline::types::{DetectionRequest, Inference};
use crate::web::state::AppState;
use crate::workspace::SessionWorkspace;
use anyhow::anyhow;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Uniform JSON body of every prediction endpoint. The HTTP status is
/// always 200; `status` carries the outcome.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictResponse {
    pub status: u16,
    pub message: String,
    pub label: String,
    pub confidence: f32,
    pub all_time: f64,
    pub out_img: String,
    pub confidences: Vec<f32>,
    pub labels: Vec<String>,
}

impl PredictResponse {
    pub fn failure(err: &ServiceError) -> Self {
        Self {
            status: err.status(),
            message: err.user_message(),
            label: String::new(),
            confidence: 0.0,
            all_time: 0.0,
            out_img: String::new(),
            confidences: Vec::new(),
            labels: Vec::new(),
        }
    }
}

pub async fn file_names_handler() -> Json<Value> {
    Json(json!({ "weight_items": weight_catalog() }))
}

/// Collect request parameters from a JSON object or a url-encoded form.
/// Anything else yields no parameters, which validation then reports.
pub async fn read_params(req: Request) -> HashMap<String, String> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        match Json::<serde_json::Map<String, Value>>::from_request(req, &()).await {
            Ok(Json(body)) => body
                .into_iter()
                .filter_map(|(k, v)| param_value(v).map(|v| (k, v)))
                .collect(),
            Err(e) => {
                tracing::warn!("Rejected JSON body: {}", e.body_text());
                HashMap::new()
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        match Form::<HashMap<String, String>>::from_request(req, &()).await {
            Ok(Form(form)) => form,
            Err(e) => {
                tracing::warn!("Rejected form body: {}", e.body_text());
                HashMap::new()
            }
        }
    } else {
        tracing::warn!("Unsupported content type '{}'", content_type);
        HashMap::new()
    }
}

fn param_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Run single-image prediction. The staged input and the annotated result
/// live in a per-call workspace that is removed before returning.
pub async fn predict_image(
    state: &AppState,
    params: HashMap<String, String>,
) -> Result<PredictResponse, ServiceError> {
    let request = DetectionRequest::from_params(&params, Some("inputImg"))?;
    let model_path = state.settings.model_path(&request.model_name);
    if !model_path.is_file() {
        return Err(ServiceError::ModelNotFound(model_path));
    }

    let workspace = SessionWorkspace::create(state.settings.scratch_dir())?;
    let location = request.location().unwrap_or_default().to_string();
    let input_path = workspace.input_image_path(&location);
    if !state.transfer.fetch(&location, &input_path).await {
        return Err(ServiceError::UnreadableImage(location));
    }

    let result_path = workspace.result_image_path();
    let inference = {
        let loader = state.loader.clone();
        let annotator = state.annotator.clone();
        let result_path = result_path.clone();
        let kind = request.kind;
        let min_conf = request.confidence;
        tokio::task::spawn_blocking(move || -> Result<Inference, ServiceError> {
            let frame = imgcodecs::imread(
                &input_path.to_string_lossy(),
                imgcodecs::IMREAD_COLOR,
            )?;
            if frame.empty() {
                return Err(ServiceError::UnreadableImage(location));
            }

            let mut detector = Detector::load(loader.as_ref(), &model_path, kind)?;
            let inference = detector.infer(&frame, min_conf)?;
            if let Inference::Detected(result) = &inference {
                let annotated = annotator.annotate(&frame, result.detections())?;
                let path = result_path.to_string_lossy();
                if !imgcodecs::imwrite(&path, &annotated, &opencv::core::Vector::new())? {
                    tracing::warn!("Could not write annotated image {}", path);
                }
            }
            Ok(inference)
        })
        .await
        .map_err(|e| anyhow!("Prediction task failed: {}", e))??
    };

    let Inference::Detected(result) = inference else {
        return Err(ServiceError::NoDetection);
    };

    let out_img = state.transfer.upload(&result_path).await;
    tracing::info!(
        "Predicted '{}' ({:.3}) with {} in {:.3}s",
        result.joined_label(),
        result.top_confidence(),
        request.model_name,
        result.elapsed_secs()
    );

    Ok(PredictResponse {
        status: 200,
        message: "Prediction succeeded".to_string(),
        label: result.joined_label(),
        confidence: result.top_confidence(),
        all_time: result.elapsed_secs(),
        out_img,
        confidences: result.confidences(),
        labels: result.labels(),
    })
}

pub async fn predict_handler(State(state): State<AppState>, req: Request) -> Json<PredictResponse> {
    let params = read_params(req).await;
    match predict_image(&state, params).await {
        Ok(response) => Json(response),
        Err(e) => {
            tracing::error!("Image prediction failed: {:#}", e);
            Json(PredictResponse::failure(&e))
        }
    }
}

async fn stream_response(
    state: AppState,
    params: HashMap<String, String>,
    kind: StreamKind,
) -> Response {
    match start_stream(state, params, kind).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("{:?} stream not started: {:#}", kind, e);
            Json(PredictResponse::failure(&e)).into_response()
        }
    }
}

pub async fn predict_video_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    stream_response(state, params, StreamKind::Video).await
}

pub async fn predict_camera_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    stream_response(state, params, StreamKind::Camera).await
}

pub async fn stop_camera_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let requested = params.get("session").map(|s| s.trim()).filter(|s| !s.is_empty());
    let message = match requested {
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) if state.sessions.stop(id) => format!("Session {} stopped", id),
            Ok(id) => format!("No active session {}", id),
            Err(_) => format!("No active session {}", raw),
        },
        None => {
            let stopped = state.sessions.stop_cameras();
            format!("Stopped {} camera session(s)", stopped)
        }
    };
    // Stopped sessions stay registered until their worker notices the flag.
    let message = format!(
        "{}; {} session(s) winding down or active",
        message,
        state.sessions.active_count()
    );
    tracing::info!("stopCamera: {}", message);
    Json(json!({ "status": 200, "message": message, "code": 0 }))
}
