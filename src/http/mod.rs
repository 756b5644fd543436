pub mod error;
pub mod routes;
pub mod state;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;
use std::path::Path;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use state::AppState;

pub fn router(state: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/face_recognition", get(routes::face_recognition))
        .route("/face_capturing", get(routes::face_capturing))
        .route("/stop_feed", get(routes::stop_feed))
        .route("/capture_images", post(routes::capture_images))
        .route("/training", get(routes::training))
        .route("/analyze_model", get(routes::analyze_model))
        .route("/read_attendance", get(routes::read_attendance))
        .route("/read_attendance/:file", get(routes::read_attendance_file))
        .route("/list_attendance_files", get(routes::list_attendance_files))
        .route("/verify_password", post(routes::verify_password))
        .route("/update_password", post(routes::update_password))
        .route("/list_cameras", get(routes::list_cameras))
        .route("/change_camera/:index", get(routes::change_camera))
        .route("/recognize", post(routes::recognize))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::recognition::tests::frame_with;
    use crate::service::session::tests::{fixture, Fixture};
    use crate::service::Mode;
    use crate::storage::CredentialStore;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(f: &Fixture) -> Router {
        let credentials = CredentialStore::open_or_init(
            f.controller.layout().passkey_dir(),
            "admin",
        ).unwrap();
        let state = AppState {
            session: f.controller.clone(),
            credentials: Arc::new(credentials),
        };
        std::fs::create_dir_all(f.controller.layout().root().join("static")).unwrap();
        std::fs::write(
            f.controller.layout().root().join("static").join("index.html"),
            "<html>attendance</html>",
        ).unwrap();
        router(state, &f.controller.layout().root().join("static"))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn recognition_without_models_is_unauthorized() {
        let f = fixture(false);
        let response = app(&f).oneshot(get("/face_recognition")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("not loaded"));
    }

    #[tokio::test]
    async fn capture_stream_starts_session_and_stop_ends_it() {
        let f = fixture(false);
        let app = app(&f);

        let response = app.clone().oneshot(get("/face_capturing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(f.controller.state().unwrap().mode, Some(Mode::Capturing));

        let response = app.clone().oneshot(get("/stop_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["stopped"], true);
        assert_eq!(f.controller.state().unwrap().mode, None);

        let response = app.oneshot(get("/stop_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stop_feed_reports_failed_flush_with_ok_status() {
        let f = fixture(false);
        let app = app(&f);
        app.clone().oneshot(get("/face_capturing")).await.unwrap();
        f.store.fail_saves.store(true, Ordering::SeqCst);

        let response = app.oneshot(get("/stop_feed")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["stopped"], true);
        assert_eq!(body["flushed"], false);
        assert!(body["error"].as_str().unwrap().contains("disk full"));
        assert_eq!(f.controller.state().unwrap().mode, None);
    }

    #[tokio::test]
    async fn capture_images_rejects_bad_names() {
        let f = fixture(false);
        let app = app(&f);
        let response = app.clone()
            .oneshot(post_json("/capture_images", serde_json::json!({ "user_name": "" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(post_json("/capture_images", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn attendance_routes() {
        let f = fixture(false);
        let app = app(&f);

        let response = app.clone().oneshot(get("/read_attendance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!([]));

        let response = app.clone().oneshot(get("/read_attendance/01012020.xlsx")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        f.controller.flush_ledger().unwrap();
        let response = app.oneshot(get("/list_attendance_files")).await.unwrap();
        assert_eq!(json_body(response).await, serde_json::json!(["05142024.xlsx"]));
    }

    #[tokio::test]
    async fn training_without_faces_directory_is_unauthorized() {
        let f = fixture(false);
        let response = app(&f).oneshot(get("/training")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn password_routes() {
        let f = fixture(false);
        let app = app(&f);

        let wrong = app.clone()
            .oneshot(post_json("/verify_password", serde_json::json!({ "password": "nope" })))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let updated = app.clone()
            .oneshot(post_json(
                "/update_password",
                serde_json::json!({ "old_password": "admin", "new_password": "changed" }),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);

        let ok = app
            .oneshot(post_json("/verify_password", serde_json::json!({ "password": "changed" })))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["success"], true);
    }

    #[tokio::test]
    async fn camera_routes() {
        let f = fixture(false);
        let app = app(&f);

        let response = app.clone().oneshot(get("/list_cameras")).await.unwrap();
        let cameras = json_body(response).await;
        assert_eq!(cameras[0]["name"], "fake");

        let response = app.oneshot(get("/change_camera/2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.controller.state().unwrap().device_index, 2);
    }

    #[tokio::test]
    async fn recognize_uploaded_image() {
        let f = fixture(true);
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(frame_with(&[(9, 0.8)]).image)
            .write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(
            b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a.png\"\r\nContent-Type: image/png\r\n\r\n",
        );
        body.extend_from_slice(&png);
        body.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");

        let request = Request::builder()
            .method("POST")
            .uri("/recognize")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap();
        let response = app(&f).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let found = json_body(response).await;
        assert_eq!(found[0]["name"], "id9");
        assert_eq!(found[0]["box"], serde_json::json!([0, 0, 10, 20]));
        assert!(f.controller.attendance_snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_is_served_from_static_dir() {
        let f = fixture(false);
        let response = app(&f).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<html>attendance</html>");
    }
}
