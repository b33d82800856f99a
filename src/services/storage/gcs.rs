//! Google Cloud Storage backend over the JSON API.
//!
//! Reads use `alt=media` downloads, writes use single-request media uploads
//! with a streaming body. A body that errors mid-way aborts the request, so
//! the store never finalizes a truncated object.

use super::{
    Bucket, ByteStream, ObjectSink, ObjectStore, StorageError, StorageResult,
    ensure_bucket_name_safe, ensure_key_valid,
};
use crate::models::object::ObjectInfo;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use std::{io, sync::Arc};
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal";

const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Characters left unescaped in object names: RFC 3986 unreserved.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Where bearer tokens come from.
#[derive(Clone, Debug)]
pub enum TokenSource {
    /// No authorization header; storage emulators.
    Anonymous,
    /// A fixed access token.
    Static(String),
    /// The instance metadata server available on Cloud Run / GCE / Functions.
    MetadataServer(String),
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}

impl TokenSource {
    async fn bearer(&self, client: &reqwest::Client) -> StorageResult<Option<String>> {
        match self {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::MetadataServer(base) => {
                let response = client
                    .get(format!("{}{}", base.trim_end_matches('/'), TOKEN_PATH))
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|err| StorageError::Auth(format!("metadata server: {}", err)))?;
                if !response.status().is_success() {
                    return Err(StorageError::Auth(format!(
                        "metadata server returned {}",
                        response.status()
                    )));
                }
                let token: MetadataToken = response
                    .json()
                    .await
                    .map_err(|err| StorageError::Auth(format!("metadata token: {}", err)))?;
                Ok(Some(token.access_token))
            }
        }
    }
}

#[derive(Clone)]
pub struct GcsObjectStore {
    inner: Arc<GcsClient>,
}

struct GcsClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: TokenSource,
}

impl GcsClient {
    async fn authorize(&self, request: RequestBuilder) -> StorageResult<RequestBuilder> {
        Ok(match self.tokens.bearer(&self.http).await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

impl GcsObjectStore {
    pub fn new(endpoint: impl Into<String>, tokens: TokenSource) -> StorageResult<Self> {
        let http = reqwest::Client::builder().build()?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self {
            inner: Arc::new(GcsClient {
                http,
                endpoint,
                tokens,
            }),
        })
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn kind(&self) -> &'static str {
        "gcs"
    }

    fn bucket(&self, name: &str) -> StorageResult<Box<dyn Bucket>> {
        ensure_bucket_name_safe(name)?;
        Ok(Box::new(GcsBucket {
            client: self.inner.clone(),
            name: name.to_string(),
        }))
    }

    /// Credentials must be obtainable.
    async fn probe(&self) -> StorageResult<()> {
        self.inner.tokens.bearer(&self.inner.http).await.map(|_| ())
    }
}

struct GcsBucket {
    client: Arc<GcsClient>,
    name: String,
}

#[async_trait]
impl Bucket for GcsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_read(&self, key: &str) -> StorageResult<ByteStream> {
        ensure_key_valid(key)?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.client.endpoint,
            encode(&self.name),
            encode(key)
        );
        debug!("GET {}", url);

        let request = self.client.authorize(self.client.http.get(&url)).await?;
        let response = request.send().await?;
        let response = check_status(response, || StorageError::ObjectNotFound {
            bucket: self.name.clone(),
            key: key.to_string(),
        })
        .await?;

        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }

    async fn open_write(
        &self,
        key: &str,
        content_type: &str,
    ) -> StorageResult<Box<dyn ObjectSink>> {
        ensure_key_valid(key)?;
        Ok(Box::new(GcsSink {
            client: self.client.clone(),
            bucket: self.name.clone(),
            key: key.to_string(),
            content_type: content_type.to_string(),
        }))
    }
}

struct GcsSink {
    client: Arc<GcsClient>,
    bucket: String,
    key: String,
    content_type: String,
}

/// Subset of the object resource returned by uploads.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    bucket: String,
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

impl From<ObjectResource> for ObjectInfo {
    fn from(res: ObjectResource) -> Self {
        ObjectInfo {
            bucket: res.bucket,
            name: res.name,
            content_type: res.content_type,
            size_bytes: res.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            md5: res.md5_hash.as_deref().and_then(md5_hex),
            updated: res.updated.unwrap_or_else(Utc::now),
        }
    }
}

#[async_trait]
impl ObjectSink for GcsSink {
    fn key(&self) -> &str {
        &self.key
    }

    async fn upload(self: Box<Self>, body: ByteStream) -> StorageResult<ObjectInfo> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.client.endpoint,
            encode(&self.bucket),
            encode(&self.key)
        );
        debug!("POST {}", url);

        let request = self
            .client
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, &self.content_type)
            .body(reqwest::Body::wrap_stream(body));
        let request = self.client.authorize(request).await?;
        let response = request.send().await?;
        // The upload target never exists beforehand; a 404 here is the bucket.
        let response =
            check_status(response, || StorageError::BucketNotFound(self.bucket.clone())).await?;

        let resource: ObjectResource = response.json().await?;
        Ok(resource.into())
    }
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OBJECT_NAME).to_string()
}

/// `md5Hash` is base64 on the wire; callers compare hex.
fn md5_hex(encoded: &str) -> Option<String> {
    let raw = general_purpose::STANDARD.decode(encoded).ok()?;
    Some(raw.iter().map(|b| format!("{:02x}", b)).collect())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Map non-success responses onto storage errors. `not_found` builds the
/// error for a 404, which means different things for reads and uploads.
async fn check_status(
    response: Response,
    not_found: impl FnOnce() -> StorageError,
) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&text)
        .map(|env| env.error.message)
        .unwrap_or(text);

    Err(match status {
        StatusCode::NOT_FOUND => not_found(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::Auth(message),
        other => StorageError::Http {
            status: other.as_u16(),
            message,
        },
    })
}
