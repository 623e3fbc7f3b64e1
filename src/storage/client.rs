//! The remote-store client seam.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::sync::Arc;

use super::ClientResult;

/// Object body as a stream of chunks.
pub type ObjectBody = BoxStream<'static, ClientResult<Bytes>>;

/// One entry of a bucket listing or a `HeadObject` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of `ListObjectsV2`.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectInfo>,
    /// Set while more pages remain.
    pub next_continuation_token: Option<String>,
}

/// A part accepted by the store, as needed by `CompleteMultipartUpload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// A multipart upload that was created and neither completed nor aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenUpload {
    pub key: String,
    pub upload_id: String,
}

/// S3-protocol operations against a single bucket.
///
/// Implementations are owned by the storage worker; nothing else calls them
/// directly.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_bucket(&self) -> ClientResult<()>;

    async fn put_object(&self, key: &str, body: Bytes) -> ClientResult<()>;

    async fn get_object(&self, key: &str) -> ClientResult<ObjectBody>;

    /// `Ok(None)` when the key does not exist.
    async fn head_object(&self, key: &str) -> ClientResult<Option<ObjectInfo>>;

    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ClientResult<ObjectPage>;

    /// Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> ClientResult<()>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, key: &str) -> ClientResult<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<CompletedPart>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ClientResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ClientResult<()>;

    async fn list_multipart_uploads(&self, prefix: &str) -> ClientResult<Vec<OpenUpload>>;

    /// Release connections before the worker goes away.
    async fn close(&self) -> ClientResult<()> {
        Ok(())
    }
}

/// Builds an [`ObjectClient`]. Called once, on the storage worker.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self) -> ClientResult<Arc<dyn ObjectClient>>;
}
