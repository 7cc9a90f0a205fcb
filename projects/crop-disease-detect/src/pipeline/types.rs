use crate::error::ServiceError;
use crate::pipeline::labels::CropKind;
use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Pixel-space bounding box.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One labelled detection with its confidence materialized as a plain float.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// A non-empty set of detections for one frame.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    elapsed_secs: f64,
}

impl DetectionResult {
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn labels(&self) -> Vec<String> {
        self.detections.iter().map(|d| d.label.clone()).collect()
    }

    pub fn confidences(&self) -> Vec<f32> {
        self.detections.iter().map(|d| d.confidence).collect()
    }

    pub fn joined_label(&self) -> String {
        self.labels().join(",")
    }

    /// Confidence of the first (highest ranked) detection.
    pub fn top_confidence(&self) -> f32 {
        self.detections.first().map(|d| d.confidence).unwrap_or(0.0)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }
}

/// Outcome of running the detector on a single frame.
#[derive(Debug, Clone)]
pub enum Inference {
    Detected(DetectionResult),
    NoDetection { elapsed_secs: f64 },
}

impl Inference {
    pub fn from_detections(detections: Vec<Detection>, elapsed_secs: f64) -> Self {
        if detections.is_empty() {
            Inference::NoDetection { elapsed_secs }
        } else {
            Inference::Detected(DetectionResult {
                detections,
                elapsed_secs,
            })
        }
    }

    pub fn detections(&self) -> &[Detection] {
        match self {
            Inference::Detected(result) => result.detections(),
            Inference::NoDetection { .. } => &[],
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        match self {
            Inference::Detected(result) => result.elapsed_secs,
            Inference::NoDetection { elapsed_secs } => *elapsed_secs,
        }
    }
}

/// Where frames for a request come from.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    /// Local path or http(s) URL.
    Location(String),
    Camera,
}

/// Validated parameters of one detection call.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub model_name: String,
    pub confidence: f32,
    pub kind: CropKind,
    pub source: MediaSource,
    pub username: String,
    pub start_time: String,
}

impl DetectionRequest {
    /// Build a request from raw string parameters. `source_key` names the
    /// parameter carrying the input location; `None` selects the camera.
    pub fn from_params(
        params: &HashMap<String, String>,
        source_key: Option<&'static str>,
    ) -> Result<Self, ServiceError> {
        let model_name = required(params, "weight")?;
        if model_name.contains(['/', '\\']) || model_name.starts_with('.') {
            return Err(ServiceError::InvalidParam {
                name: "weight",
                reason: format!("'{}' is not a plain file name", model_name),
            });
        }

        let source = match source_key {
            Some(key) => MediaSource::Location(required(params, key)?),
            None => MediaSource::Camera,
        };

        let confidence = match optional(params, "conf") {
            None => DEFAULT_CONFIDENCE,
            Some(raw) => {
                let value: f32 = raw.parse().map_err(|_| ServiceError::InvalidParam {
                    name: "conf",
                    reason: format!("'{}' is not a number", raw),
                })?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ServiceError::InvalidParam {
                        name: "conf",
                        reason: format!("{} is outside [0, 1]", value),
                    });
                }
                value
            }
        };

        let kind = match optional(params, "kind") {
            Some(raw) => raw.parse()?,
            None => CropKind::from_weight_name(&model_name).ok_or_else(|| {
                ServiceError::InvalidParam {
                    name: "kind",
                    reason: format!("cannot infer crop kind from '{}'", model_name),
                }
            })?,
        };

        Ok(Self {
            model_name,
            confidence,
            kind,
            source,
            username: optional(params, "username").unwrap_or_default(),
            start_time: optional(params, "startTime").unwrap_or_default(),
        })
    }

    pub fn location(&self) -> Option<&str> {
        match &self.source {
            MediaSource::Location(location) => Some(location),
            MediaSource::Camera => None,
        }
    }
}

fn optional(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(params: &HashMap<String, String>, key: &'static str) -> Result<String, ServiceError> {
    optional(params, key).ok_or(ServiceError::MissingParam(key))
}
