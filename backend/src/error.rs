use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::path::PathBuf;

use crate::inference::preprocess::InputSize;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Model '{model}' is not registered")]
    UnknownModel { model: String },
    #[error("Model artifact for '{model}' not found at {}", .path.display())]
    NotFound { model: String, path: PathBuf },
    #[error("Input tensor is {actual} but model expects {expected}")]
    ShapeMismatch {
        expected: InputSize,
        actual: InputSize,
    },
    #[error("Invalid input tensor: {0}")]
    InvalidTensor(String),
    #[error("Model produced {actual} scores for {expected} class names")]
    ClassCountMismatch { expected: usize, actual: usize },
    #[error("Model produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("Class index {index} out of range for {classes} classes")]
    InvalidClassIndex { index: usize, classes: usize },
    #[error("Gradient computation unsupported by {engine} engine")]
    GradientUnsupported { engine: &'static str },
    #[error("Failed to load model '{model}': {reason}")]
    Load { model: String, reason: String },
    #[error("Evaluation engine error: {0}")]
    Engine(String),
    #[error("Upload contained no image data")]
    EmptyUpload,
    #[error("Upload too large: {size} bytes, max allowed: {max} bytes")]
    UploadTooLarge { size: usize, max: usize },
    #[error("Analysis timed out after {0} seconds")]
    Timeout(u64),
}

impl InferenceError {
    /// Model missing from the artifact store or the registry table.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            InferenceError::NotFound { .. } | InferenceError::UnknownModel { .. }
        )
    }

    /// Caller or configuration bugs that must surface instead of being skipped.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            InferenceError::ShapeMismatch { .. }
                | InferenceError::InvalidTensor(_)
                | InferenceError::ClassCountMismatch { .. }
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            InferenceError::Decode(_) => "DECODE_ERROR",
            InferenceError::UnknownModel { .. } | InferenceError::NotFound { .. } => "NOT_FOUND",
            InferenceError::ShapeMismatch { .. } => "SHAPE_MISMATCH",
            InferenceError::InvalidTensor(_) => "INVALID_TENSOR",
            InferenceError::ClassCountMismatch { .. } => "CLASS_COUNT_MISMATCH",
            InferenceError::InvalidOutput(_) => "INVALID_OUTPUT",
            InferenceError::InvalidClassIndex { .. } => "INVALID_CLASS_INDEX",
            InferenceError::GradientUnsupported { .. } => "GRADIENT_UNSUPPORTED",
            InferenceError::Load { .. } => "MODEL_LOAD_ERROR",
            InferenceError::Engine(_) => "ENGINE_ERROR",
            InferenceError::EmptyUpload => "EMPTY_UPLOAD",
            InferenceError::UploadTooLarge { .. } => "UPLOAD_TOO_LARGE",
            InferenceError::Timeout(_) => "TIMEOUT",
        }
    }
}

#[cfg(feature = "torch")]
impl From<tch::TchError> for InferenceError {
    fn from(err: tch::TchError) -> Self {
        InferenceError::Engine(err.to_string())
    }
}

impl ResponseError for InferenceError {
    fn status_code(&self) -> StatusCode {
        match self {
            InferenceError::Decode(_)
            | InferenceError::InvalidClassIndex { .. }
            | InferenceError::EmptyUpload => StatusCode::BAD_REQUEST,
            InferenceError::UnknownModel { .. } | InferenceError::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            InferenceError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            InferenceError::GradientUnsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            InferenceError::Load { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InferenceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        log::error!("Request failed: {} ({})", self, status);
        HttpResponse::build(status).json(json!({
            "error": self.to_string(),
            "code": self.error_code(),
        }))
    }
}
