//! Backup enumeration and the time-bounded listing cache.

mod cache;
mod record;

pub use cache::{LISTING_TTL, ListingCache, ListingSnapshot};
pub use record::{BackupRecord, MetadataSidecar, RESERVED_FIELDS};

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use tracing::{debug, warn};

use crate::agent::{LayoutEntry, ObjectLayout};
use crate::storage::{ClientResult, StorageGateway};

/// Sidecars downloaded at once while enumerating.
const SIDECAR_FETCH_CONCURRENCY: usize = 8;

/// List every complete backup under the layout's root, newest first.
///
/// A backup is complete when both its archive and its sidecar exist. Sidecars
/// that disappear mid-listing, fail to parse, or name a different id than
/// their key are skipped with a warning; any other failure is returned.
pub async fn enumerate(
    gateway: &StorageGateway,
    layout: &ObjectLayout,
) -> ClientResult<Vec<BackupRecord>> {
    let root = layout.root();
    let mut archives = BTreeSet::new();
    let mut sidecars = BTreeSet::new();
    let mut token = None;
    let mut pages = 0;

    loop {
        let page = gateway.list_objects(root, token).await?;
        pages += 1;
        for object in page.objects {
            match layout.classify(&object.key) {
                Some(LayoutEntry::Archive(id)) => {
                    archives.insert(id);
                }
                Some(LayoutEntry::Metadata(id)) => {
                    sidecars.insert(id);
                }
                None => {}
            }
        }
        token = page.next_continuation_token;
        if token.is_none() {
            break;
        }
    }

    for orphan in sidecars.difference(&archives) {
        debug!(backup_id = %orphan, "sidecar without archive, skipping");
    }
    let complete: Vec<String> = sidecars.intersection(&archives).cloned().collect();
    debug!(pages, complete = complete.len(), "enumerated backup objects");

    let loaded: Vec<Option<BackupRecord>> = stream::iter(complete)
        .map(|id| load_record(gateway, layout, id))
        .buffer_unordered(SIDECAR_FETCH_CONCURRENCY)
        .try_collect()
        .await?;

    let mut records: Vec<BackupRecord> = loaded.into_iter().flatten().collect();
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.backup_id.cmp(&b.backup_id))
    });
    Ok(records)
}

async fn load_record(
    gateway: &StorageGateway,
    layout: &ObjectLayout,
    backup_id: String,
) -> ClientResult<Option<BackupRecord>> {
    let key = layout.metadata_key(&backup_id);
    let raw = match gateway.get_object_bytes(&key).await {
        Ok(raw) => raw,
        Err(e) if e.is_not_found() => {
            warn!(key = %key, "metadata sidecar vanished during listing, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let sidecar = match MetadataSidecar::from_slice(&raw) {
        Ok(sidecar) => sidecar,
        Err(e) => {
            warn!(key = %key, error = %e, "unreadable metadata sidecar, skipping");
            return Ok(None);
        }
    };
    if sidecar.backup_id != backup_id {
        warn!(
            key = %key,
            found = %sidecar.backup_id,
            "metadata sidecar names another backup, skipping"
        );
        return Ok(None);
    }
    Ok(Some(sidecar.into_record(layout)))
}
