// cloudstash/src/agent/mod.rs
//! Backup archive agent: store, list, fetch and remove backups in one bucket.

mod layout;
mod translate;

pub use layout::{
    ARCHIVE_SUFFIX, LayoutEntry, METADATA_SUFFIX, ObjectLayout, STORAGE_DIR, validate_backup_id,
};
pub use translate::{translate, translate_transfer};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ConnectionDescriptor;
use crate::errors::{AgentError, Result};
use crate::listing::{self, BackupRecord, ListingCache, MetadataSidecar};
use crate::storage::{ClientFactory, S3ClientFactory, StorageGateway};
use crate::upload;

/// Archive bytes as returned by [`BackupAgent::fetch`].
pub type ArchiveStream = BoxStream<'static, Result<Bytes>>;

pub struct BackupAgent {
    descriptor: ConnectionDescriptor,
    layout: ObjectLayout,
    gateway: StorageGateway,
    cache: ListingCache,
}

impl BackupAgent {
    /// Connect to the descriptor's bucket with the S3 client.
    pub async fn start(descriptor: ConnectionDescriptor) -> Result<Self> {
        let factory = Arc::new(S3ClientFactory::new(descriptor.clone()));
        Self::start_with_factory(descriptor, factory).await
    }

    /// Launch the storage gateway over `factory`. Fails if the client cannot be
    /// built or the bucket is not reachable with the given credentials.
    pub async fn start_with_factory(
        descriptor: ConnectionDescriptor,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        let gateway = StorageGateway::new(descriptor.bucket_name(), factory);
        gateway.launch().await.map_err(|e| {
            translate(e, &format!("opening bucket {}", descriptor.bucket_name()))
        })?;

        let layout = ObjectLayout::new(descriptor.prefix());
        info!(
            bucket = descriptor.bucket_name(),
            root = layout.root(),
            "🔌 backup agent connected"
        );
        Ok(BackupAgent {
            descriptor,
            layout,
            gateway,
            cache: ListingCache::default(),
        })
    }

    /// The bucket this agent writes to.
    pub fn name(&self) -> &str {
        self.descriptor.bucket_name()
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// Check the bucket is reachable with the agent's credentials.
    pub async fn check(&self) -> Result<()> {
        self.gateway
            .head_bucket()
            .await
            .map_err(|e| translate(e, &format!("checking bucket {}", self.name())))
    }

    /// Upload an archive and its metadata sidecar.
    ///
    /// Storing the same id again overwrites both objects. If the sidecar write
    /// fails after the archive landed the whole call fails; the archive alone
    /// is never listed and a retry replaces it.
    pub async fn store(
        &self,
        backup_id: &str,
        archive: Bytes,
        metadata: Map<String, Value>,
    ) -> Result<BackupRecord> {
        validate_backup_id(backup_id)?;
        let archive_key = self.layout.archive_key(backup_id);
        let metadata_key = self.layout.metadata_key(backup_id);
        let size = archive.len() as u64;
        let created_at = Utc::now();

        let sidecar = MetadataSidecar::new(backup_id, size, created_at, metadata);
        let document = sidecar.to_bytes().map_err(|e| {
            AgentError::InvalidConfiguration(format!(
                "metadata for {} is not serializable: {}",
                backup_id, e
            ))
        })?;

        let plan = upload::upload_archive(&self.gateway, &archive_key, archive)
            .await
            .map_err(|e| {
                translate_transfer(e, &format!("uploading archive {}", archive_key))
            })?;
        // The bucket changed even if the sidecar write below fails.
        self.cache.invalidate();

        self.gateway
            .put_object(&metadata_key, document)
            .await
            .map_err(|e| {
                translate_transfer(e, &format!("writing metadata {}", metadata_key))
            })?;
        self.cache.invalidate();

        info!(
            backup_id,
            size,
            chunked = plan.is_chunked(),
            "✅ backup stored"
        );
        Ok(sidecar.into_record(&self.layout))
    }

    /// All complete backups, newest first. Served from the listing cache while
    /// it is fresh.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let snapshot = self
            .cache
            .get_or_refresh(|| async {
                listing::enumerate(&self.gateway, &self.layout)
                    .await
                    .map_err(|e| translate(e, &format!("listing {}", self.layout.root())))
            })
            .await?;
        Ok(snapshot.records().to_vec())
    }

    pub async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        validate_backup_id(backup_id)?;
        self.list()
            .await?
            .into_iter()
            .find(|r| r.backup_id == backup_id)
            .ok_or_else(|| AgentError::NotFound(backup_id.to_string()))
    }

    /// Stream a backup's archive.
    ///
    /// The key comes from the cached listing when it is fresh and holds the
    /// id; otherwise it is derived from the layout and fetched directly.
    pub async fn fetch(&self, backup_id: &str) -> Result<ArchiveStream> {
        validate_backup_id(backup_id)?;
        let key = self
            .cache
            .peek()
            .and_then(|snapshot| snapshot.find(backup_id).map(|r| r.archive_key.clone()))
            .unwrap_or_else(|| self.layout.archive_key(backup_id));
        debug!(backup_id, key = %key, "fetching archive");

        let body = self.gateway.get_object(&key).await.map_err(|e| {
            if e.is_not_found() {
                AgentError::NotFound(backup_id.to_string())
            } else {
                translate(e, &format!("downloading {}", key))
            }
        })?;

        let context = format!("downloading {}", key);
        Ok(body.map_err(move |e| translate(e, &context)).boxed())
    }

    /// [`fetch`](Self::fetch) collected into memory.
    pub async fn fetch_bytes(&self, backup_id: &str) -> Result<Bytes> {
        let mut stream = self.fetch(backup_id).await?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Delete a backup's archive and sidecar. Either one missing is tolerated;
    /// both missing is [`AgentError::NotFound`].
    pub async fn remove(&self, backup_id: &str) -> Result<()> {
        validate_backup_id(backup_id)?;
        let archive_key = self.layout.archive_key(backup_id);
        let metadata_key = self.layout.metadata_key(backup_id);

        let (archive, sidecar) = futures::try_join!(
            self.gateway.head_object(&archive_key),
            self.gateway.head_object(&metadata_key),
        )
        .map_err(|e| translate(e, &format!("looking up backup {}", backup_id)))?;

        if archive.is_none() && sidecar.is_none() {
            return Err(AgentError::NotFound(backup_id.to_string()));
        }

        // Sidecar first: an interrupted removal leaves an unlisted archive,
        // never a listed backup without one.
        if sidecar.is_some() {
            self.delete(&metadata_key).await?;
        } else {
            debug!(backup_id, "metadata sidecar already gone");
        }
        if archive.is_some() {
            self.delete(&archive_key).await?;
        } else {
            debug!(backup_id, "archive already gone");
        }

        info!(backup_id, "🗑️ backup removed");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let outcome = self
            .gateway
            .delete_object(key)
            .await
            .map_err(|e| translate_transfer(e, &format!("deleting {}", key)));
        self.cache.invalidate();
        outcome
    }

    /// Stop the storage gateway, waiting for operations already submitted.
    pub async fn shutdown(&self) -> Result<()> {
        self.gateway
            .shutdown()
            .await
            .map_err(|e| translate(e, &format!("closing bucket {}", self.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::errors::ErrorKind;
    use crate::listing::LISTING_TTL;
    use crate::storage::memory::Operation;
    use crate::storage::{ClientError, MemoryObjectClient};
    use serde_json::json;
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    fn descriptor(prefix: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor::new(ConnectionSettings {
            endpoint_url: "http://localhost:9000".to_string(),
            access_key_id: "minio".to_string(),
            secret_access_key: "minio-secret".to_string(),
            bucket_name: "home-backups".to_string(),
            prefix: prefix.map(str::to_string),
            ..Default::default()
        })
        .expect("test descriptor is valid")
    }

    async fn agent(client: &MemoryObjectClient) -> Result<BackupAgent> {
        BackupAgent::start_with_factory(descriptor(Some("site")), Arc::new(client.clone())).await
    }

    fn archive(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 241) as u8).collect::<Vec<u8>>())
    }

    fn meta(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_store_list_remove_large_backup() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;
        assert_eq!(agent.name(), "home-backups");

        let before = Utc::now();
        let stored = agent
            .store("full-2026", archive(45 * MIB), meta(json!({ "name": "Full" })))
            .await?;
        assert_eq!(stored.size, 47_185_920);

        let mut parts = client.uploaded_parts();
        parts.sort();
        assert_eq!(parts, vec![(1, 20 * MIB), (2, 20 * MIB), (3, 5 * MIB)]);

        let records = agent.list().await?;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.backup_id, "full-2026");
        assert_eq!(record.size, 47_185_920);
        assert_eq!(record.archive_key, "site/backups/full-2026.tar");
        assert!(record.created_at >= before && record.created_at <= Utc::now());
        assert_eq!(record.metadata.get("name"), Some(&json!("Full")));

        agent.remove("full-2026").await?;
        assert!(client.keys().is_empty());
        assert!(agent.list().await?.is_empty());
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_mutations_invalidate_listing() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;

        assert!(agent.list().await?.is_empty());
        // Written by another agent; not visible until the cache is dropped.
        let foreign = MetadataSidecar::new("foreign", 1, Utc::now(), Map::new());
        client.insert("site/backups/foreign.tar", vec![0u8]);
        client.insert("site/backups/foreign.metadata.json", foreign.to_bytes()?);
        assert!(agent.list().await?.is_empty());

        agent.store("mine", archive(16), Map::new()).await?;
        let ids: Vec<String> = agent.list().await?.into_iter().map(|r| r.backup_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"foreign".to_string()));

        agent.remove("foreign").await?;
        let ids: Vec<String> = agent.list().await?.into_iter().map(|r| r.backup_id).collect();
        assert_eq!(ids, vec!["mine".to_string()]);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_expires_after_ttl() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;
        assert!(agent.list().await?.is_empty());

        let foreign = MetadataSidecar::new("late", 1, Utc::now(), Map::new());
        client.insert("site/backups/late.tar", vec![0u8]);
        client.insert("site/backups/late.metadata.json", foreign.to_bytes()?);

        tokio::time::advance(LISTING_TTL - Duration::from_secs(1)).await;
        assert!(agent.list().await?.is_empty());
        assert_eq!(client.call_count(Operation::ListObjects), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(agent.list().await?.len(), 1);
        assert_eq!(client.call_count(Operation::ListObjects), 2);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_store_twice_leaves_one_pair() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;

        for _ in 0..2 {
            agent.store("same", archive(21 * MIB), Map::new()).await?;
        }
        assert_eq!(
            client.keys(),
            vec![
                "site/backups/same.metadata.json".to_string(),
                "site/backups/same.tar".to_string(),
            ]
        );
        assert!(client.open_uploads().is_empty());
        assert_eq!(agent.list().await?.len(), 1);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_metadata_failure_fails_store_and_retry_recovers() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        client.fail_for_key(
            Operation::PutObject,
            ".metadata.json",
            ClientError::service(500, "InternalError", "try again"),
        );
        let agent = agent(&client).await?;

        let err = agent.store("b1", archive(128), Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert!(agent.list().await?.is_empty());

        client.clear_faults();
        agent.store("b1", archive(128), Map::new()).await?;
        assert_eq!(client.keys().len(), 2);
        assert_eq!(agent.list().await?.len(), 1);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_part_leaves_no_open_upload() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        client.fail_part(3, ClientError::Unreachable("connection reset".into()));
        let agent = agent(&client).await?;

        let err = agent.store("big", archive(41 * MIB), Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(client.open_uploads().is_empty());
        assert!(client.keys().is_empty());
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_upload_is_a_transfer_failure() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        client.fail_part(2, ClientError::service(404, "NoSuchUpload", "upload expired"));
        let agent = agent(&client).await?;

        let err = agent.store("x", archive(45 * MIB), Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert!(client.open_uploads().is_empty());

        client.clear_faults();
        client.fail_for_key(
            Operation::PutObject,
            ".metadata.json",
            ClientError::service(404, "NoSuchKey", "gone"),
        );
        let err = agent.store("y", archive(8), Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_tolerates_half_written_backup() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;

        client.insert("site/backups/archive-only.tar", vec![1u8]);
        agent.remove("archive-only").await?;
        client.insert("site/backups/sidecar-only.metadata.json", b"{}".to_vec());
        agent.remove("sidecar-only").await?;
        assert!(client.keys().is_empty());

        let err = agent.remove("never-existed").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;
        let payload = archive(300_000);
        agent.store("f1", payload.clone(), Map::new()).await?;

        // Direct lookup, then through the cached listing.
        assert_eq!(agent.fetch_bytes("f1").await?, payload);
        agent.list().await?;
        let chunks: Vec<Bytes> = agent.fetch("f1").await?.try_collect().await?;
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), payload.to_vec());

        let err = agent.fetch("missing").await.err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::NotFound));
        assert_eq!(agent.get("missing").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(agent.get("f1").await?.size, 300_000);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_start() {
        let client = MemoryObjectClient::new();
        client.fail(
            Operation::HeadBucket,
            ClientError::service(403, "InvalidAccessKeyId", "unknown key"),
        );
        let err = agent(&client).await.err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::AuthenticationFailed));
    }

    #[tokio::test]
    async fn test_missing_bucket_is_configuration_error() {
        let client = MemoryObjectClient::new();
        client.fail(
            Operation::HeadBucket,
            ClientError::service(404, "NoSuchBucket", "no bucket"),
        );
        let err = agent(&client).await.err().map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::InvalidConfiguration));
    }

    #[tokio::test]
    async fn test_timeout_kind() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        client.fail(Operation::PutObject, ClientError::Timeout("operation timeout".into()));
        let agent = agent(&client).await?;
        let err = agent.store("slow", archive(10), Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_ids_never_reach_the_store() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;
        for id in ["", "../escape", "a/b"] {
            let err = agent.store(id, archive(1), Map::new()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        }
        assert_eq!(client.call_count(Operation::PutObject), 0);
        agent.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent = agent(&client).await?;
        agent.check().await?;
        agent.shutdown().await?;
        assert!(client.is_closed());

        let err = agent.list().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_prefix_layout() -> anyhow::Result<()> {
        let client = MemoryObjectClient::new();
        let agent =
            BackupAgent::start_with_factory(descriptor(Some("")), Arc::new(client.clone())).await?;
        agent.store("root", archive(4), Map::new()).await?;
        assert!(client.object("backups/root.tar").is_some());

        let defaulted =
            BackupAgent::start_with_factory(descriptor(None), Arc::new(client.clone())).await?;
        assert_eq!(defaulted.layout().root(), "homeassistant/backups/");
        agent.shutdown().await?;
        defaulted.shutdown().await?;
        Ok(())
    }
}
