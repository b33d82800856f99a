//! Storage notifications that trigger a conversion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MIME prefix an upload must carry to be considered audio.
pub const AUDIO_CONTENT_TYPE_PREFIX: &str = "audio/";

/// A single "object finalized" notification from the object store.
///
/// Only `bucket` and `name` are required. The remaining fields mirror the
/// object resource the platform sends and are informational, except
/// `content_type` which drives the audio guard.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    /// Bucket holding the uploaded object.
    pub bucket: String,

    /// Full object path within the bucket (slash-delimited).
    pub name: String,

    /// Declared MIME type of the upload.
    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metageneration: Option<String>,

    /// Object size as reported by the store (a decimal string on the wire).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl UploadEvent {
    #[cfg(test)]
    pub fn new(
        bucket: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            content_type: Some(content_type.into()),
            metageneration: None,
            size: None,
            time_created: None,
            updated: None,
        }
    }

    /// True when the declared content type starts with `audio/`.
    ///
    /// A missing content type is never audio.
    pub fn is_audio(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with(AUDIO_CONTENT_TYPE_PREFIX))
    }
}

/// Delivery metadata attached by background-function style triggers.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
}

/// The request body shapes a trigger may deliver.
///
/// Background functions wrap the object resource in `{"data": .., "context": ..}`;
/// push subscriptions and CloudEvents deliver the object resource directly.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum EventEnvelope {
    Wrapped {
        data: UploadEvent,
        #[serde(default)]
        context: Option<EventContext>,
    },
    Bare(UploadEvent),
}

impl EventEnvelope {
    pub fn into_parts(self) -> (UploadEvent, Option<EventContext>) {
        match self {
            EventEnvelope::Wrapped { data, context } => (data, context),
            EventEnvelope::Bare(event) => (event, None),
        }
    }
}
