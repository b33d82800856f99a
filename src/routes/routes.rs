//! Defines routes for the conversion service.
//!
//! ## Structure
//! - `POST /`        : storage notification push endpoint (one event per request)
//! - `GET  /healthz` : liveness
//! - `GET  /readyz`  : readiness (transcoder + storage)

use crate::{
    handlers::{
        event_handlers::handle_event,
        health_handlers::{healthz, readyz},
    },
    services::convert_service::ConvertService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router.
///
/// The router carries shared state (`ConvertService`) to all handlers.
pub fn routes() -> Router<ConvertService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", post(handle_event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        storage::LocalObjectStore,
        transcoder::FfmpegTranscoder,
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(dir: &tempfile::TempDir, ffmpeg: &str) -> Router {
        let service = ConvertService::new(
            Arc::new(LocalObjectStore::new(dir.path())),
            Arc::new(FfmpegTranscoder::new(ffmpeg)),
        );
        routes().with_state(service)
    }

    async fn post_event(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::post("/")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("ce-id", "evt-1")
                    .header("ce-type", "google.cloud.storage.object.v1.finalized")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir, "ffmpeg")
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_reports_missing_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir, "/nonexistent/ffmpeg")
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["checks"]["transcoder"]["ok"], false);
        assert_eq!(body["checks"]["storage"]["ok"], true);
    }

    #[tokio::test]
    async fn non_audio_event_is_acknowledged_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = post_event(
            app(&dir, "/nonexistent/ffmpeg"),
            serde_json::json!({"bucket": "uploads", "name": "img/cat.png", "contentType": "image/png"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["reason"], "not_audio");
    }

    #[tokio::test]
    async fn wrapped_converted_event_is_acknowledged_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = post_event(
            app(&dir, "/nonexistent/ffmpeg"),
            serde_json::json!({
                "data": {"bucket": "uploads", "name": "a/clip_output.flac", "contentType": "audio/flac"},
                "context": {"eventId": "42", "eventType": "google.storage.object.finalize"}
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "already_converted");
    }

    #[tokio::test]
    async fn missing_source_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        let (status, body) = post_event(
            app(&dir, "/nonexistent/ffmpeg"),
            serde_json::json!({"bucket": "uploads", "name": "gone.wav", "contentType": "audio/wav"}),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn unavailable_transcoder_fails_the_delivery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/clip.wav"), b"RIFF").unwrap();

        let (status, body) = post_event(
            app(&dir, "/nonexistent/ffmpeg"),
            serde_json::json!({"bucket": "uploads", "name": "clip.wav", "contentType": "audio/wav"}),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("not available"));
        assert!(!dir.path().join("uploads/clip_output.flac").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn audio_event_is_converted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\nexec cat\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::create_dir_all(dir.path().join("uploads/dir")).unwrap();
        std::fs::write(dir.path().join("uploads/dir/clip.wav"), b"RIFF0000WAVE").unwrap();

        let (status, body) = post_event(
            app(&dir, fake.to_str().unwrap()),
            serde_json::json!({"bucket": "uploads", "name": "dir/clip.wav", "contentType": "audio/wav"}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "converted");
        assert_eq!(body["output"], "dir/clip_output.flac");
        assert_eq!(body["size"], 12);
        assert!(dir.path().join("uploads/dir/clip_output.flac").is_file());
    }

    #[tokio::test]
    async fn malformed_event_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _) = post_event(
            app(&dir, "ffmpeg"),
            serde_json::json!({"bucket": "uploads"}),
        )
        .await;
        assert!(status.is_client_error());
    }
}
