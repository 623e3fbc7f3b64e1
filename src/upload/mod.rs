//! Archive upload: single PutObject below the chunk threshold, multipart at
//! or above it.

mod plan;

pub use plan::{CHUNK_THRESHOLD_BYTES, PART_SIZE_BYTES, PartSpec, TransferPlan};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use crate::storage::{ClientResult, CompletedPart, StorageGateway};

/// Parts in flight at once during a multipart upload.
pub const MAX_CONCURRENT_PARTS: usize = 4;

/// Upload `payload` to `key` using the plan for its size.
///
/// A failed multipart upload is aborted before the failure is returned, so no
/// incomplete upload is left on the store.
pub async fn upload_archive(
    gateway: &StorageGateway,
    key: &str,
    payload: Bytes,
) -> ClientResult<TransferPlan> {
    let plan = TransferPlan::for_size(payload.len() as u64);
    match plan {
        TransferPlan::Single { length } => {
            debug!(key, length, "single-part upload");
            gateway.put_object(key, payload).await?;
        }
        TransferPlan::Chunked { part_count, .. } => {
            debug!(key, part_count, "multipart upload");
            upload_chunked(gateway, key, &plan, payload).await?;
        }
    }
    Ok(plan)
}

async fn upload_chunked(
    gateway: &StorageGateway,
    key: &str,
    plan: &TransferPlan,
    payload: Bytes,
) -> ClientResult<()> {
    let upload_id = gateway.create_multipart_upload(key).await?;

    let outcome = match upload_parts(gateway, key, &upload_id, plan, &payload).await {
        Ok(parts) => {
            gateway
                .complete_multipart_upload(key, &upload_id, parts)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = outcome {
        warn!(key, upload_id = %upload_id, error = %e, "multipart upload failed, aborting");
        if let Err(abort_err) = gateway.abort_multipart_upload(key, &upload_id).await {
            warn!(
                key,
                upload_id = %upload_id,
                error = %abort_err,
                "could not abort multipart upload"
            );
        }
        return Err(e);
    }
    Ok(())
}

/// Send every part with bounded concurrency. After the first failure no new
/// part is started and the ones in flight are drained. The returned parts are
/// in ascending part-number order regardless of completion order.
async fn upload_parts(
    gateway: &StorageGateway,
    key: &str,
    upload_id: &str,
    plan: &TransferPlan,
    payload: &Bytes,
) -> ClientResult<Vec<CompletedPart>> {
    let mut pending = plan.parts().into_iter();
    let mut in_flight = FuturesUnordered::new();
    let mut completed = Vec::new();
    let mut failure = None;

    loop {
        while failure.is_none() && in_flight.len() < MAX_CONCURRENT_PARTS {
            let Some(part) = pending.next() else {
                break;
            };
            in_flight.push(upload_part(gateway, key, upload_id, part, payload.slice(part.range())));
        }

        match in_flight.next().await {
            Some(Ok(part)) => completed.push(part),
            Some(Err(e)) => {
                failure.get_or_insert(e);
            }
            None => break,
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }
    completed.sort_by_key(|part: &CompletedPart| part.part_number);
    Ok(completed)
}

async fn upload_part(
    gateway: &StorageGateway,
    key: &str,
    upload_id: &str,
    part: PartSpec,
    body: Bytes,
) -> ClientResult<CompletedPart> {
    debug!(key, part = part.number, size = part.length, "uploading part");
    gateway.upload_part(key, upload_id, part.number, body).await
}
