use crate::common::{AttendanceError, Result};
use crate::http::state::AppState;
use crate::http::stream::mjpeg_response;
use crate::service::session::blocking;
use crate::service::{EnrollmentReport, Identification, Mode, StopReport, TrainingReport};
use crate::storage::IdentityRecord;
use crate::camera::CameraInfo;
use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPasswordRequest {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    #[serde(default)]
    pub old_password: String,
    #[serde(default)]
    pub new_password: String,
}

async fn stream(state: AppState, mode: Mode) -> Result<Response> {
    let session = state.session.clone();
    let handle = blocking(move || session.activate(mode)).await?;
    Ok(mjpeg_response(state.session, handle))
}

/// GET /face_recognition
pub async fn face_recognition(State(state): State<AppState>) -> Result<Response> {
    stream(state, Mode::Recognizing).await
}

/// GET /face_capturing
pub async fn face_capturing(State(state): State<AppState>) -> Result<Response> {
    stream(state, Mode::Capturing).await
}

/// GET /stop_feed, always 200; flush failures are reported in the body.
pub async fn stop_feed(State(state): State<AppState>) -> Json<StopReport> {
    let session = state.session.clone();
    match blocking(move || session.stop()).await {
        Ok(report) => Json(report),
        Err(e) => {
            tracing::error!("Failed to stop session: {}", e);
            Json(StopReport { stopped: false, flushed: false, error: Some(e.to_string()) })
        }
    }
}

/// POST /capture_images `{"user_name": "..."}`
pub async fn capture_images(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<EnrollmentReport>> {
    let name = request.user_name.unwrap_or_default();
    let report = state.session.enroll(&name).await?;
    Ok(Json(report))
}

/// GET /training
pub async fn training(State(state): State<AppState>) -> Result<Json<TrainingReport>> {
    let session = state.session.clone();
    let report = blocking(move || session.train()).await?;
    Ok(Json(report))
}

/// GET /analyze_model
#[cfg(feature = "visualization")]
pub async fn analyze_model(State(state): State<AppState>) -> Result<Response> {
    let session = state.session.clone();
    let png = blocking(move || session.analyze()).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/png")], png).into_response())
}

#[cfg(not(feature = "visualization"))]
pub async fn analyze_model() -> Response {
    (
        axum::http::StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "error": "Built without model analysis support" })),
    )
        .into_response()
}

/// GET /read_attendance
pub async fn read_attendance(State(state): State<AppState>) -> Result<Json<Vec<IdentityRecord>>> {
    let session = state.session.clone();
    Ok(Json(blocking(move || session.attendance_snapshot()).await?))
}

/// GET /read_attendance/:file
pub async fn read_attendance_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Json<Vec<IdentityRecord>>> {
    let session = state.session.clone();
    let records = blocking(move || session.read_attendance_file(&file)).await?;
    Ok(Json(records))
}

/// GET /list_attendance_files
pub async fn list_attendance_files(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    let session = state.session.clone();
    Ok(Json(blocking(move || session.attendance_files()).await?))
}

/// POST /verify_password
pub async fn verify_password(
    State(state): State<AppState>,
    Json(request): Json<VerifyPasswordRequest>,
) -> Result<Json<Value>> {
    state.credentials.verify(&request.password)?;
    Ok(Json(json!({ "success": true })))
}

/// POST /update_password
pub async fn update_password(
    State(state): State<AppState>,
    Json(request): Json<UpdatePasswordRequest>,
) -> Result<Json<Value>> {
    state.credentials.update(&request.old_password, &request.new_password)?;
    Ok(Json(json!({ "success": true })))
}

/// GET /list_cameras
pub async fn list_cameras(State(state): State<AppState>) -> Result<Json<Vec<CameraInfo>>> {
    let session = state.session.clone();
    Ok(Json(blocking(move || session.list_cameras()).await?))
}

/// GET /change_camera/:index
pub async fn change_camera(
    State(state): State<AppState>,
    Path(index): Path<u32>,
) -> Result<Json<Value>> {
    let session = state.session.clone();
    blocking(move || session.select_device(index)).await?;
    Ok(Json(json!({ "device_index": index })))
}

/// POST /recognize, multipart field `image`
pub async fn recognize(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<Identification>>> {
    let mut image = None;
    while let Some(field) = multipart.next_field().await
        .map_err(|e| AttendanceError::InvalidRequest(format!("Malformed upload: {}", e)))?
    {
        if field.name() == Some("image") {
            let bytes = field.bytes().await
                .map_err(|e| AttendanceError::InvalidRequest(format!("Malformed upload: {}", e)))?;
            image = Some(bytes);
            break;
        }
    }
    let image = image.ok_or_else(|| AttendanceError::InvalidRequest("Missing image field".into()))?;

    let session = state.session.clone();
    let found = blocking(move || session.identify_image(&image)).await?;
    Ok(Json(found))
}
