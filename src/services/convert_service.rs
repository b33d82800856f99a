//! ConvertService: the upload handler.
//!
//! One call per upload event. Two guards short-circuit to a successful
//! no-op (not audio, already converted); otherwise the source object is
//! streamed through the transcoder into `<dir>/<stem>_output.flac` in the
//! same bucket and the call resolves once that object is committed.

use crate::{
    models::{event::UploadEvent, object::ObjectInfo},
    services::{
        naming::{derive_output_path, is_converted},
        storage::{ObjectStore, StorageError},
        transcoder::{TranscodeError, TranscodeSettings, Transcoder},
    },
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}

/// Why an event was passed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAudio,
    AlreadyConverted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConvertOutcome {
    Skipped(SkipReason),
    Converted(ObjectInfo),
}

/// Shared, read-only after construction; cloning is cheap.
#[derive(Clone)]
pub struct ConvertService {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    settings: TranscodeSettings,
}

impl ConvertService {
    pub fn new(store: Arc<dyn ObjectStore>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            store,
            transcoder,
            settings: TranscodeSettings::MONO_16K_FLAC,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn transcoder(&self) -> &Arc<dyn Transcoder> {
        &self.transcoder
    }

    /// Handle one upload event.
    pub async fn handle(&self, event: &UploadEvent) -> Result<ConvertOutcome, ConvertError> {
        let span = info_span!(
            "convert",
            invocation = %Uuid::new_v4(),
            bucket = %event.bucket,
            name = %event.name,
        );
        self.handle_inner(event).instrument(span).await
    }

    async fn handle_inner(&self, event: &UploadEvent) -> Result<ConvertOutcome, ConvertError> {
        if !event.is_audio() {
            info!(
                content_type = event.content_type.as_deref().unwrap_or(""),
                "not an audio upload, skipping"
            );
            return Ok(ConvertOutcome::Skipped(SkipReason::NotAudio));
        }
        if is_converted(&event.name) {
            info!("already a converted audio, skipping");
            return Ok(ConvertOutcome::Skipped(SkipReason::AlreadyConverted));
        }

        let target = derive_output_path(&event.name);
        let bucket = self.store.bucket(&event.bucket)?;

        info!(backend = self.store.kind(), "streaming audio from {}", event.name);
        let source = bucket.open_read(&event.name).await?;
        info!("created read stream");
        let sink = bucket
            .open_write(&target, self.settings.format.content_type())
            .await?;
        info!(output = sink.key(), "created write stream");

        let object = self
            .transcoder
            .transcode(source, self.settings, sink)
            .await?;

        info!(
            output = %object.name,
            size = object.size_bytes,
            md5 = object.md5.as_deref().unwrap_or(""),
            "output audio uploaded to {}/{}",
            bucket.name(),
            target
        );
        Ok(ConvertOutcome::Converted(object))
    }
}
