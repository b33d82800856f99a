//! Object storage seam.
//!
//! The conversion pipeline only needs three things from a store: a bucket
//! handle by name, a readable byte stream for an object, and a sink that
//! consumes a byte stream and commits it as an object. Two backends
//! implement it: Google Cloud Storage over its JSON API and a local
//! directory tree used for development and tests.

mod factory;
mod gcs;
mod local;

pub use factory::{StorageKind, build_object_store};
pub use gcs::{DEFAULT_ENDPOINT, DEFAULT_METADATA_URL, GcsObjectStore, TokenSource};
pub use local::LocalObjectStore;

use crate::models::object::ObjectInfo;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

/// Owned stream of object bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("storage request failed with status {status}: {message}")]
    Http { status: u16, message: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A store that hands out bucket handles.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name used in logs and readiness output.
    fn kind(&self) -> &'static str;

    /// Construct a handle for `name`, validating the name first.
    fn bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>>;

    /// Cheap check that the backend is usable.
    async fn probe(&self) -> StorageResult<()>;
}

/// Handle to one bucket.
#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Open a readable stream over an existing object.
    async fn open_read(&self, key: &str) -> StorageResult<ByteStream>;

    /// Open a destination for `key`. The object is created or overwritten
    /// only when the returned sink finishes its upload successfully.
    async fn open_write(&self, key: &str, content_type: &str)
    -> StorageResult<Box<dyn ObjectSink>>;
}

/// Write side of an object.
#[async_trait]
pub trait ObjectSink: Send {
    /// Object path this sink writes to.
    fn key(&self) -> &str;

    /// Drain `body` into the object and commit it.
    ///
    /// If `body` yields an error the upload is abandoned and nothing is
    /// committed.
    async fn upload(self: Box<Self>, body: ByteStream) -> StorageResult<ObjectInfo>;
}

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Validate bucket name format.
///
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens, underscores
/// - starts and ends with a letter or digit
/// - no consecutive dots or dot-hyphen patterns
/// - not formatted like an IPv4 address
pub(crate) fn ensure_bucket_name_safe(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.into(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-' | '_'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, hyphens, and underscores",
        ));
    }

    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !alnum(name.chars().next()) || !alnum(name.chars().last()) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

/// Basic object key validation shared by every backend.
pub(crate) fn ensure_key_valid(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
