use crate::common::AttendanceError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

impl AttendanceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AttendanceError::ModelsMissing
            | AttendanceError::DuplicateIdentity(_)
            | AttendanceError::PasswordMismatch
            | AttendanceError::NoFacesDirectory(_)
            | AttendanceError::InvalidRequest(_) => StatusCode::UNAUTHORIZED,
            AttendanceError::FileNotFound(_) => StatusCode::NOT_FOUND,
            AttendanceError::DeviceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AttendanceError::NoTrainingData => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AttendanceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_status() {
        assert_eq!(AttendanceError::ModelsMissing.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AttendanceError::PasswordMismatch.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AttendanceError::FileNotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AttendanceError::DeviceUnavailable(1).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AttendanceError::NoTrainingData.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            AttendanceError::Storage("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
