//! S3-compatible storage backend.
//!
//! This module provides a storage backend implementation for S3-compatible
//! services including AWS S3, Cloudflare R2, Backblaze B2, MinIO, and others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file.

use crate::{
    StorageBackend,
    backend::{UploadReader, check_size},
    error::{Error, ErrorKind, Result},
    models::{BoxAsyncRead, NotDeleted},
    validate_path,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    client::Waiters,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use exn::{OptionExt, ResultExt};
use futures::io::AsyncReadExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// Objects up to this size are sent with a single PutObject; anything larger
/// is streamed as a multipart upload, one part in memory at a time.
const PART_SIZE: usize = 8 * 1024 * 1024;
/// DeleteObjects accepts at most this many keys per request.
const MAX_KEYS_PER_DELETE: usize = 1000;
/// How long to wait for a deleted object to stop being visible.
const DELETE_CONFIRMATION_WAIT: Duration = Duration::from_secs(60);

/// S3-compatible storage backend.
///
/// Stores objects in an S3 bucket, optionally under a key prefix. All keys
/// are relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use shelf_storage::backend::S3Backend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "books",
///     "my-bucket",
///     Some("library/".to_string()),
///     "auto",
///     Some("https://<account>.r2.cloudflarestorage.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "auto" for R2)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Credentials::new(key_id, key_secret, None, None, "shelf-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Configure retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Use path-style addressing for better compatibility with
            // S3-compatible services (R2, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self::from_client(name, Client::from_conf(config_builder.build()), bucket, prefix)
    }

    /// Wrap an already configured client.
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let prefix = prefix.map(validate_path).transpose()?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative key.
    fn full_key(&self, path: &str) -> Result<String> {
        let validated = validate_path(path)?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{validated}"),
            None => validated,
        })
    }

    /// Strip the configured prefix from an S3 key to get the relative key.
    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str()).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
            None => key,
        }
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // unwrap is safe: semaphore is never closed
        self.rate_limiter.clone().acquire_owned().await.unwrap()
    }

    fn sdk_error<E, R>(err: SdkError<E, R>) -> ErrorKind
    where
        E: ProvideErrorMetadata + std::error::Error,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ErrorKind::Network(err.to_string()),
            SdkError::ServiceError(service) => match service.err().code() {
                Some("AccessDenied") => ErrorKind::PermissionDenied(service.err().to_string()),
                Some(code) => ErrorKind::BackendError(format!("{code}: {}", service.err().message().unwrap_or_default())),
                None => ErrorKind::BackendError(service.err().to_string()),
            },
            _ => ErrorKind::BackendError(err.to_string()),
        }
    }

    /// Fill `buf` from the reader until it holds `PART_SIZE` bytes or the
    /// reader is exhausted. Returns `true` at end of stream.
    async fn fill_part(content: &mut UploadReader<'_>, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let read = (&mut *content).take(PART_SIZE as u64).read_to_end(buf).await.map_err(ErrorKind::Io)?;
        Ok(read < PART_SIZE)
    }

    async fn put_single(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let _permit = self.acquire_permit().await;
        let length = i64::try_from(body.len()).or_raise(|| ErrorKind::BackendError("object too large".to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(Self::sdk_error)?;
        Ok(())
    }

    /// Stream the remainder of `content` as a multipart upload whose first
    /// part is already sitting in `buf`. Returns the total number of bytes.
    ///
    /// The upload is aborted, never completed, when the streamed length does
    /// not match `size_hint`.
    async fn put_multipart(
        &self,
        key: &str,
        size_hint: Option<u64>,
        content: &mut UploadReader<'_>,
        mut buf: Vec<u8>,
    ) -> Result<u64> {
        let upload_id = {
            let _permit = self.acquire_permit().await;
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(Self::sdk_error)?
                .upload_id
                .ok_or_raise(|| ErrorKind::BackendError("multipart upload created without an id".to_string()))?
        };
        match self.upload_parts(key, &upload_id, size_hint, content, &mut buf).await {
            Ok(written) => Ok(written),
            Err(e) => {
                let _permit = self.acquire_permit().await;
                if let Err(abort) =
                    self.client.abort_multipart_upload().bucket(&self.bucket).key(key).upload_id(&upload_id).send().await
                {
                    tracing::warn!(key, upload_id, error = %abort, "could not abort multipart upload");
                }
                Err(e)
            },
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        size_hint: Option<u64>,
        content: &mut UploadReader<'_>,
        buf: &mut Vec<u8>,
    ) -> Result<u64> {
        let mut parts = Vec::new();
        let mut written = 0u64;
        let mut finished = false;
        let mut part_number = 1i32;
        while !buf.is_empty() {
            written += buf.len() as u64;
            if size_hint.is_some_and(|expected| written > expected) {
                check_size(size_hint, written)?;
            }
            let body = ByteStream::from(std::mem::take(buf));
            let e_tag = {
                let _permit = self.acquire_permit().await;
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .map_err(Self::sdk_error)?
                    .e_tag
            };
            parts.push(CompletedPart::builder().set_e_tag(e_tag).part_number(part_number).build());
            part_number += 1;
            if finished {
                break;
            }
            finished = Self::fill_part(content, buf).await?;
        }
        check_size(size_hint, written)?;
        let _permit = self.acquire_permit().await;
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(Self::sdk_error)?;
        Ok(written)
    }

    /// Issue a single DeleteObjects request for at most
    /// [`MAX_KEYS_PER_DELETE`] keys, given as `(path, key)` pairs. Failures are
    /// reported under the path the caller passed in, not the normalized key.
    async fn delete_chunk(&self, keys: &[(String, String)]) -> Result<Vec<NotDeleted>> {
        let objects = keys
            .iter()
            .map(|(_, key)| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .or_raise(|| ErrorKind::BackendError("invalid object identifier".to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .or_raise(|| ErrorKind::BackendError("invalid delete request".to_string()))?;
        let _permit = self.acquire_permit().await;
        let output =
            self.client.delete_objects().bucket(&self.bucket).delete(delete).send().await.map_err(Self::sdk_error)?;
        let mut not_deleted = Vec::new();
        for e in output.errors() {
            let key = e.key().unwrap_or_default();
            let cause = || match e.code() {
                Some("AccessDenied") => ErrorKind::PermissionDenied(key.to_string()),
                code => {
                    ErrorKind::BackendError(format!("{}: {}", code.unwrap_or("unknown"), e.message().unwrap_or_default()))
                },
            };
            let mut paths = keys.iter().filter(|(_, k)| k == key).map(|(path, _)| path.clone()).peekable();
            if paths.peek().is_none() {
                tracing::warn!(backend = %self.name, key, "delete error for a key that was not requested");
                not_deleted.push(NotDeleted::new(self.relative_key(key), Error::from(cause())));
                continue;
            }
            for path in paths {
                not_deleted.push(NotDeleted::new(path, Error::from(cause())));
            }
        }
        Ok(not_deleted)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await;
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(e) => Err(Self::sdk_error(e).into()),
        }
    }

    async fn upload(&self, path: &str, size_hint: Option<u64>, content: &mut UploadReader<'_>) -> Result<u64> {
        let key = self.full_key(path)?;
        let mut buf = Vec::new();
        let written = match Self::fill_part(content, &mut buf).await? {
            true => {
                let written = buf.len() as u64;
                // Checked before sending: nothing lands at the key on mismatch.
                check_size(size_hint, written)?;
                self.put_single(&key, buf).await?;
                written
            },
            false => self.put_multipart(&key, size_hint, content, buf).await?,
        };
        tracing::debug!(backend = %self.name, key, written, "uploaded object");
        Ok(written)
    }

    async fn get(&self, path: &str) -> Result<BoxAsyncRead> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(path.to_string()))
            },
            Err(e) => exn::bail!(Self::sdk_error(e)),
        };
        Ok(Box::pin(output.body.into_async_read().compat()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await;
        if let Err(e) = self.client.delete_object().bucket(&self.bucket).key(&key).send().await {
            if e.code() == Some("NoSuchKey") {
                exn::bail!(ErrorKind::NotFound(path.to_string()));
            }
            exn::bail!(Self::sdk_error(e));
        }
        self.client
            .wait_until_object_not_exists()
            .bucket(&self.bucket)
            .key(&key)
            .wait(DELETE_CONFIRMATION_WAIT)
            .await
            .map_err(|e| ErrorKind::BackendError(format!("deletion of {path} not confirmed: {e}")))?;
        Ok(())
    }

    async fn batch_delete(&self, paths: &[String]) -> Result<Vec<NotDeleted>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        // Keys that fail validation never reach S3 but are still reported.
        let mut not_deleted = Vec::new();
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            match self.full_key(path) {
                Ok(key) => keys.push((path.clone(), key)),
                Err(e) => not_deleted.push(NotDeleted::new(path.clone(), e)),
            }
        }
        for (index, chunk) in keys.chunks(MAX_KEYS_PER_DELETE).enumerate() {
            match self.delete_chunk(chunk).await {
                Ok(failed) => not_deleted.extend(failed),
                // Nothing at all has been attempted yet: the whole call failed.
                Err(e) if index == 0 => return Err(e),
                Err(e) => {
                    let reason = e.to_string();
                    not_deleted.extend(chunk.iter().map(|(path, _)| {
                        NotDeleted::new(path.clone(), Error::from(ErrorKind::BackendError(reason.clone())))
                    }));
                },
            }
        }
        Ok(not_deleted)
    }
}
