//! Push endpoint for storage notifications.
//!
//! The trigger platform POSTs one notification per request and treats any
//! non-2xx answer as a failed delivery.

use crate::{
    errors::AppError,
    models::event::EventEnvelope,
    services::convert_service::{ConvertOutcome, ConvertService, SkipReason},
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;
use tracing::{error, info};

/// JSON body returned for a handled event.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum EventResponse {
    Converted {
        bucket: String,
        output: String,
        size: u64,
    },
    Skipped {
        reason: SkipReason,
    },
}

/// `POST /`
///
/// Accepts the bare object resource or the `{"data": .., "context": ..}`
/// envelope.
pub async fn handle_event(
    State(service): State<ConvertService>,
    headers: HeaderMap,
    Json(envelope): Json<EventEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    let (event, context) = envelope.into_parts();

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let event_id = context
        .as_ref()
        .and_then(|c| c.event_id.as_deref())
        .or_else(|| header("ce-id"));
    let event_type = context
        .as_ref()
        .and_then(|c| c.event_type.as_deref())
        .or_else(|| header("ce-type"));
    info!(
        event_id = event_id.unwrap_or("-"),
        event_type = event_type.unwrap_or("-"),
        bucket = %event.bucket,
        name = %event.name,
        size = event.size.as_deref().unwrap_or("-"),
        metageneration = event.metageneration.as_deref().unwrap_or("-"),
        created = ?event.time_created,
        "received upload event"
    );

    let outcome = service.handle(&event).await.map_err(|err| {
        error!(bucket = %event.bucket, name = %event.name, "conversion failed: {}", err);
        AppError::from(err)
    })?;

    let body = match outcome {
        ConvertOutcome::Converted(object) => EventResponse::Converted {
            bucket: object.bucket,
            output: object.name,
            size: object.size_bytes,
        },
        ConvertOutcome::Skipped(reason) => EventResponse::Skipped { reason },
    };
    Ok((StatusCode::OK, Json(body)))
}
