use crate::pipeline::labels::CropKind;
use std::path::PathBuf;
use thiserror::Error;

/// Failures a request can end with. Each maps to the status code embedded
/// in the JSON response body.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("class id {id} is outside the {kind} label table ({len} entries)")]
    UnknownClass {
        id: usize,
        kind: CropKind,
        len: usize,
    },

    #[error("unable to read image: {0}")]
    UnreadableImage(String),

    #[error("unable to open video source: {0}")]
    SourceUnavailable(String),

    #[error("no detections above the confidence threshold")]
    NoDetection,

    #[error(transparent)]
    Vision(#[from] opencv::Error),

    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> u16 {
        match self {
            Self::MissingParam(_)
            | Self::InvalidParam { .. }
            | Self::UnreadableImage(_)
            | Self::SourceUnavailable(_)
            | Self::NoDetection => 400,
            Self::ModelNotFound(_) | Self::ModelLoad { .. } => 404,
            Self::UnknownClass { .. } | Self::Vision(_) | Self::Unhandled(_) => 500,
        }
    }

    /// Text shown to the caller. Recognition failures get a generic hint,
    /// everything else surfaces the error itself.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnreadableImage(_) | Self::NoDetection => {
                "The image could not be recognized, please upload another one.".to_string()
            }
            Self::UnknownClass { .. } | Self::Vision(_) | Self::Unhandled(_) => {
                format!("Prediction failed: {:#}", self)
            }
            _ => self.to_string(),
        }
    }
}
