use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of the recommendation pipeline and its store.
#[derive(Error, Debug)]
pub enum RecError {
    #[error("Insufficient data in region {region}: no interactions left after filtering")]
    InsufficientData { region: String },

    #[error("Batch already running for region {region}")]
    BatchAlreadyRunning { region: String },

    #[error("Invalid limit {limit}: must be between 1 and {max}")]
    InvalidLimit { limit: usize, max: usize },

    #[error("Model load failed for region {region}: {reason}")]
    ModelLoad { region: String, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),

    #[error("No target region could be processed")]
    NoRegionProcessed,

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        RecError::Persistence(err.to_string())
    }

    pub fn model_load(region: &str, reason: impl std::fmt::Display) -> Self {
        RecError::ModelLoad {
            region: region.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Error returned from HTTP handlers.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Rec(#[from] RecError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Rec(err) => {
                let status = match err {
                    RecError::InvalidLimit { .. } | RecError::InvalidValue(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    RecError::UnknownRegion(_) => StatusCode::NOT_FOUND,
                    RecError::BatchAlreadyRunning { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
