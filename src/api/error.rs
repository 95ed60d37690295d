use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::manager::ManagerError;
use crate::registry::{RefError, RefId};

/// Structured error type for all HTTP handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 404 - Generic not-found.
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 404 - The process does not exist, or no longer does.
    MissingProcess { process: String, expired: bool },
    /// 404 - The reference id is unknown or was released.
    ReferenceNotFound(String),
    /// 400 - The reference exists but cannot be called.
    NotCallable(RefId),
    /// 404 - A file or virtual file URL that resolves to nothing.
    FileNotFound(String),
    /// 500 - A callback failed. `detail` is only set in debug mode.
    Application { message: String, detail: Option<String> },
    /// 503 - The session table is at its hard cap.
    CapacityExceeded(usize),
    /// 500 - A callback result could not be rendered.
    RenderFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingProcess { .. } => StatusCode::NOT_FOUND,
            ApiError::ReferenceNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotCallable(_) => StatusCode::BAD_REQUEST,
            ApiError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Application { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::RenderFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MissingProcess { .. } => "missing_process",
            ApiError::ReferenceNotFound(_) => "reference_not_found",
            ApiError::NotCallable(_) => "not_callable",
            ApiError::FileNotFound(_) => "file_not_found",
            ApiError::Application { .. } => "application_error",
            ApiError::CapacityExceeded(_) => "capacity_exceeded",
            ApiError::RenderFailed(_) => "render_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via Authorization header or ?token= query parameter.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::MissingProcess { expired: true, .. } => {
                "Session killed. Please refresh.".to_string()
            }
            ApiError::MissingProcess { expired: false, .. } => {
                "No such session. Please refresh.".to_string()
            }
            ApiError::ReferenceNotFound(id) => format!("Reference not found: {}.", id),
            ApiError::NotCallable(id) => format!("Reference {} is not callable.", id),
            ApiError::FileNotFound(path) => format!("File not found: {}.", path),
            ApiError::Application { message, .. } => message.clone(),
            ApiError::CapacityExceeded(cap) => {
                format!("Too many sessions ({}). Try again later.", cap)
            }
            ApiError::RenderFailed(detail) => format!("Could not render result: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Capacity(cap) => ApiError::CapacityExceeded(cap),
            ManagerError::Missing { process, expired } => {
                ApiError::MissingProcess { process, expired }
            }
        }
    }
}

impl From<RefError> for ApiError {
    fn from(e: RefError) -> Self {
        match e {
            RefError::NotFound(id) => ApiError::ReferenceNotFound(id),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = serde_json::json!({
            "code": self.code(),
            "message": self.message(),
        });
        match &self {
            ApiError::MissingProcess { process, expired } => {
                error["process"] = process.clone().into();
                error["expired"] = (*expired).into();
            }
            ApiError::ReferenceNotFound(_) => {
                error["hint"] = "The object was probably released because nothing kept it alive. \
                    Anchor it to a live element or register it with a stronger retention policy."
                    .into();
            }
            ApiError::Application {
                detail: Some(detail),
                ..
            } => {
                error["detail"] = detail.clone().into();
            }
            _ => {}
        }
        (self.status_code(), Json(serde_json::json!({ "error": error }))).into_response()
    }
}
