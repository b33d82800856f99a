//! Local directory backend.
//!
//! Buckets are directories directly beneath `base_path`, objects are files at
//! `base_path/{bucket}/{key}`. Writes stream into a temporary file next to the
//! destination and are renamed into place once fully flushed, so readers never
//! observe a partially written object.

use super::{
    Bucket, ByteStream, ObjectSink, ObjectStore, StorageError, StorageResult,
    ensure_bucket_name_safe, ensure_key_valid,
};
use crate::models::object::ObjectInfo;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use std::{
    io,
    path::{Path, PathBuf},
};
use tempfile::TempPath;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    task,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk holding one directory per bucket.
    base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>> {
        ensure_bucket_name_safe(name)?;
        Ok(Box::new(LocalBucket {
            name: name.to_string(),
            root: self.base_path.join(name),
        }))
    }

    /// Write, read back and delete a scratch file under `base_path`.
    async fn probe(&self) -> StorageResult<()> {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::other("file content mismatch")));
        }
        Ok(())
    }
}

struct LocalBucket {
    name: String,
    root: PathBuf,
}

impl LocalBucket {
    /// Rejects keys that could escape the bucket directory.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        ensure_key_valid(key)?;
        if key.starts_with('/')
            || key.ends_with('/')
            || key.contains('\\')
            || key.split('/').any(|segment| segment == ".." || segment == ".")
        {
            return Err(StorageError::InvalidObjectKey(key.to_string()));
        }
        Ok(())
    }

    async fn ensure_exists(&self) -> StorageResult<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::BucketNotFound(self.name.clone())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(self.name.clone()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_read(&self, key: &str) -> StorageResult<ByteStream> {
        self.ensure_key_safe(key)?;
        self.ensure_exists().await?;

        let file = File::open(self.root.join(key)).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: self.name.clone(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok(ReaderStream::new(file).boxed())
    }

    async fn open_write(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<Box<dyn ObjectSink>> {
        self.ensure_key_safe(key)?;
        self.ensure_exists().await?;

        let file_path = self.root.join(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;

        // Removed on drop unless persisted.
        let tmp = task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(".tmp-").tempfile_in(&parent)
        })
        .await
        .map_err(io::Error::other)??;
        let (std_file, tmp_path) = tmp.into_parts();

        Ok(Box::new(LocalSink {
            bucket: self.name.clone(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            file_path,
            file: File::from_std(std_file),
            tmp_path,
        }))
    }
}

struct LocalSink {
    bucket: String,
    key: String,
    content_type: String,
    file_path: PathBuf,
    file: File,
    tmp_path: TempPath,
}

#[async_trait]
impl ObjectSink for LocalSink {
    fn key(&self) -> &str {
        &self.key
    }

    /// Stream into the temp file while computing size and MD5, fsync, then
    /// rename over the destination.
    async fn upload(self: Box<Self>, mut body: ByteStream) -> StorageResult<ObjectInfo> {
        let LocalSink {
            bucket,
            key,
            content_type,
            file_path,
            mut file,
            tmp_path,
        } = *self;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tmp_path
            .persist(&file_path)
            .map_err(|err| StorageError::Io(err.error))?;
        debug!("committed {} ({} bytes)", file_path.display(), size_bytes);

        Ok(ObjectInfo {
            bucket,
            name: key,
            content_type: Some(content_type),
            size_bytes,
            md5: Some(format!("{:x}", digest.compute())),
            updated: Utc::now(),
        })
    }
}
