//! Represents an object written back to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a committed object.
///
/// Returned by storage sinks once the upload has been finalized.
/// The struct carries metadata only, never content bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectInfo {
    /// Bucket holding the object.
    pub bucket: String,

    /// Object path within the bucket.
    pub name: String,

    /// Content type recorded for the object.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: u64,

    /// Hex-encoded MD5 of the payload, when the backend reports one.
    pub md5: Option<String>,

    /// Timestamp when the object was last written.
    pub updated: DateTime<Utc>,
}
