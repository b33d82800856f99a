use super::{GcsObjectStore, LocalObjectStore, ObjectStore, StorageResult, TokenSource};
use crate::config::AppConfig;
use std::{fmt, str::FromStr, sync::Arc};

/// Which storage backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Gcs,
    Local,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gcs" => Ok(StorageKind::Gcs),
            "local" => Ok(StorageKind::Local),
            other => Err(format!(
                "unknown storage backend `{}` (expected `gcs` or `local`)",
                other
            )),
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Gcs => write!(f, "gcs"),
            StorageKind::Local => write!(f, "local"),
        }
    }
}

/// Build the configured backend. The result is shared read-only by every
/// invocation for connection reuse.
pub fn build_object_store(cfg: &AppConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match cfg.storage {
        StorageKind::Local => Ok(Arc::new(LocalObjectStore::new(&cfg.storage_dir))),
        StorageKind::Gcs => {
            let tokens = match (&cfg.gcs_token, cfg.metadata_auth) {
                (Some(token), _) => TokenSource::Static(token.clone()),
                (None, true) => TokenSource::MetadataServer(cfg.metadata_url.clone()),
                (None, false) => TokenSource::Anonymous,
            };
            Ok(Arc::new(GcsObjectStore::new(&cfg.gcs_endpoint, tokens)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_storage_kind() {
        assert_eq!("gcs".parse::<StorageKind>(), Ok(StorageKind::Gcs));
        assert_eq!(" LOCAL ".parse::<StorageKind>(), Ok(StorageKind::Local));
        assert!("s3".parse::<StorageKind>().is_err());
    }
}
