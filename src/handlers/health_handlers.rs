//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the transcoder binary and storage

use crate::services::convert_service::ConvertService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe: always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs `ffmpeg -version` through the configured transcoder.
/// 2. Probes the storage backend (disk round-trip for local, credentials for gcs).
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<ConvertService>) -> impl IntoResponse {
    let (transcoder, storage) = tokio::join!(
        service.transcoder().version(),
        service.store().probe()
    );

    let mut checks = HashMap::new();
    checks.insert(
        "transcoder",
        match transcoder {
            Ok(version) => CheckStatus {
                ok: true,
                detail: Some(version),
                error: None,
            },
            Err(e) => CheckStatus::failed(e.to_string()),
        },
    );
    checks.insert(
        "storage",
        match storage {
            Ok(()) => CheckStatus {
                ok: true,
                detail: Some(service.store().kind().to_string()),
                error: None,
            },
            Err(e) => CheckStatus::failed(e.to_string()),
        },
    );

    let overall_ok = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    error: Option<String>,
}

impl CheckStatus {
    fn failed(error: String) -> Self {
        Self {
            ok: false,
            detail: None,
            error: Some(error),
        }
    }
}
