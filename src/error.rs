//! Error taxonomy shared by every component of the orchestrator

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Registration is missing a required field
    #[error("Invalid camera: {0}")]
    InvalidCamera(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Camera cannot host a new session (status is not online/ready)
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Camera cannot accept PTZ commands (status is not online/ready)
    #[error("Camera offline: {0}")]
    CameraOffline(String),

    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Operation is not valid in the current session or camera state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// PTZ parameter outside the camera's declared limits
    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Device (or the relay in front of it) could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(String),

    /// Device answered but refused the call
    #[error("Device rejected request ({status}): {message}")]
    DeviceRejected { status: u16, message: String },

    /// Session was closed by the idle reaper
    #[error("Session {0} closed after idle timeout")]
    IdleTimeout(String),

    /// Control-channel frame above the configured limit
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, shared by REST bodies and control-channel errors
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidCamera(_) => "INVALID_CAMERA",
            Error::NotFound(_) => "NOT_FOUND",
            Error::CameraUnavailable(_) => "CAMERA_UNAVAILABLE",
            Error::CameraOffline(_) => "CAMERA_OFFLINE",
            Error::InvalidOffer(_) => "INVALID_OFFER",
            Error::InvalidCandidate(_) => "INVALID_CANDIDATE",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::OutOfRange(_) => "OUT_OF_RANGE",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Unreachable(_) => "UNREACHABLE",
            Error::DeviceRejected { .. } => "DEVICE_REJECTED",
            Error::IdleTimeout(_) => "IDLE_TIMEOUT",
            Error::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidCamera(_)
            | Error::InvalidOffer(_)
            | Error::InvalidCandidate(_)
            | Error::OutOfRange(_)
            | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::CameraUnavailable(_) | Error::CameraOffline(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::InvalidState(_) | Error::IdleTimeout(_) => StatusCode::CONFLICT,
            Error::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Unreachable(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::DeviceRejected { .. } => StatusCode::BAD_GATEWAY,
            Error::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request error"
            );
        } else {
            tracing::debug!(
                status = %status,
                error_code = %error_code,
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_from_internal() {
        let errors = [
            Error::OutOfRange("pan".into()),
            Error::CameraOffline("cam-1".into()),
            Error::DeviceRejected {
                status: 401,
                message: "auth".into(),
            },
        ];

        for e in &errors {
            assert_ne!(e.error_code(), "INTERNAL_ERROR");
        }
    }

    #[test]
    fn test_status_mapping() {
        let response = Error::NotFound("cam-9".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = Error::InvalidState("closed".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
