use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::{TaskRef, ValidationError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskRef),

    #[error("missing or invalid API token")]
    Unauthorized,
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::JobNotFound(_) | DispatchError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
