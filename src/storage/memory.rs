//! In-memory object client for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::client::{
    ClientFactory, CompletedPart, ObjectBody, ObjectClient, ObjectInfo, ObjectPage, OpenUpload,
};
use super::{ClientError, ClientResult};

/// Operation names used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    HeadBucket,
    PutObject,
    GetObject,
    HeadObject,
    ListObjects,
    DeleteObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    ListMultipartUploads,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    key_suffix: Option<String>,
    part_number: Option<i32>,
    error: ClientError,
}

impl Fault {
    fn matches(&self, operation: Operation, key: Option<&str>, part_number: Option<i32>) -> bool {
        if self.operation != operation {
            return false;
        }
        if let Some(suffix) = &self.key_suffix {
            if !key.is_some_and(|k| k.ends_with(suffix.as_str())) {
                return false;
            }
        }
        match self.part_number {
            Some(expected) => part_number == Some(expected),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (Bytes, String)>,
}

#[derive(Debug)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    page_size: usize,
    chunk_size: usize,
    faults: Vec<Fault>,
    calls: HashMap<Operation, usize>,
    part_log: Vec<(i32, usize)>,
    closed: bool,
}

impl Default for MemoryState {
    fn default() -> Self {
        MemoryState {
            objects: BTreeMap::new(),
            uploads: HashMap::new(),
            next_upload_id: 1,
            page_size: 1000,
            chunk_size: 64 * 1024,
            faults: Vec::new(),
            calls: HashMap::new(),
            part_log: Vec::new(),
            closed: false,
        }
    }
}

/// A bucket held in process memory.
///
/// Clones share the same bucket, so a test can keep one handle for
/// inspection while the storage worker owns another. Faults stay armed until
/// [`MemoryObjectClient::clear_faults`].
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectClient {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how many keys a single `list_objects` page returns.
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state().page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every call of `operation`.
    pub fn fail(&self, operation: Operation, error: ClientError) {
        self.state().faults.push(Fault {
            operation,
            key_suffix: None,
            part_number: None,
            error,
        });
    }

    /// Fail calls of `operation` whose key ends with `key_suffix`.
    pub fn fail_for_key(&self, operation: Operation, key_suffix: &str, error: ClientError) {
        self.state().faults.push(Fault {
            operation,
            key_suffix: Some(key_suffix.to_string()),
            part_number: None,
            error,
        });
    }

    /// Fail uploads of one part number.
    pub fn fail_part(&self, part_number: i32, error: ClientError) {
        self.state().faults.push(Fault {
            operation: Operation::UploadPart,
            key_suffix: None,
            part_number: Some(part_number),
            error,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.state().calls.get(&operation).copied().unwrap_or(0)
    }

    /// `(part_number, size)` of every accepted part, in arrival order.
    pub fn uploaded_parts(&self) -> Vec<(i32, usize)> {
        self.state().part_log.clone()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Place an object directly, bypassing fault injection.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.state().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn open_uploads(&self) -> Vec<OpenUpload> {
        let mut uploads: Vec<OpenUpload> = self
            .state()
            .uploads
            .iter()
            .map(|(upload_id, upload)| OpenUpload {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
            })
            .collect();
        uploads.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        uploads
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Count the call and return the first matching fault.
    fn enter(
        &self,
        operation: Operation,
        key: Option<&str>,
        part_number: Option<i32>,
    ) -> ClientResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        *state.calls.entry(operation).or_insert(0) += 1;
        if let Some(fault) = state
            .faults
            .iter()
            .find(|f| f.matches(operation, key, part_number))
        {
            return Err(fault.error.clone());
        }
        Ok(state)
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn head_bucket(&self) -> ClientResult<()> {
        self.enter(Operation::HeadBucket, None, None)?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes) -> ClientResult<()> {
        let mut state = self.enter(Operation::PutObject, Some(key), None)?;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ClientResult<ObjectBody> {
        let state = self.enter(Operation::GetObject, Some(key), None)?;
        let data = state
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| ClientError::not_found(key))?;

        let chunk_size = state.chunk_size;
        let chunks: Vec<ClientResult<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn head_object(&self, key: &str) -> ClientResult<Option<ObjectInfo>> {
        let state = self.enter(Operation::HeadObject, Some(key), None)?;
        Ok(state.objects.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size: o.data.len() as u64,
            last_modified: Some(o.last_modified),
        }))
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ClientResult<ObjectPage> {
        let state = self.enter(Operation::ListObjects, Some(prefix), None)?;
        // The token is the last key of the previous page.
        let mut matching = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| {
                continuation_token
                    .as_deref()
                    .is_none_or(|after| key.as_str() > after)
            });

        let objects: Vec<ObjectInfo> = matching
            .by_ref()
            .take(state.page_size)
            .map(|(key, o)| ObjectInfo {
                key: key.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
            })
            .collect();
        let next_continuation_token = match matching.next() {
            Some(_) => objects.last().map(|o| o.key.clone()),
            None => None,
        };

        Ok(ObjectPage {
            objects,
            next_continuation_token,
        })
    }

    async fn delete_object(&self, key: &str) -> ClientResult<()> {
        let mut state = self.enter(Operation::DeleteObject, Some(key), None)?;
        state.objects.remove(key);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> ClientResult<String> {
        let mut state = self.enter(Operation::CreateMultipartUpload, Some(key), None)?;
        let upload_id = format!("upload-{:06}", state.next_upload_id);
        state.next_upload_id += 1;
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<CompletedPart> {
        let mut state = self.enter(Operation::UploadPart, Some(key), Some(part_number))?;
        let size = body.len();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| {
                ClientError::service(404, "NoSuchUpload", format!("no upload {}", upload_id))
            })?;
        let e_tag = format!("\"{}-{}\"", upload_id, part_number);
        upload.parts.insert(part_number, (body, e_tag.clone()));
        state.part_log.push((part_number, size));
        Ok(CompletedPart { part_number, e_tag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ClientResult<()> {
        let mut state = self.enter(Operation::CompleteMultipartUpload, Some(key), None)?;
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| {
                ClientError::service(404, "NoSuchUpload", format!("no upload {}", upload_id))
            })?;

        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(ClientError::service(
                400,
                "InvalidPartOrder",
                "parts must be listed in ascending order",
            ));
        }

        let mut assembled = Vec::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((data, e_tag)) if *e_tag == part.e_tag => assembled.extend_from_slice(data),
                _ => {
                    return Err(ClientError::service(
                        400,
                        "InvalidPart",
                        format!("part {} was not uploaded", part.part_number),
                    ));
                }
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: Bytes::from(assembled),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ClientResult<()> {
        let mut state = self.enter(Operation::AbortMultipartUpload, Some(key), None)?;
        match state.uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(ClientError::service(
                404,
                "NoSuchUpload",
                format!("no upload {}", upload_id),
            )),
        }
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> ClientResult<Vec<OpenUpload>> {
        drop(self.enter(Operation::ListMultipartUploads, Some(prefix), None)?);
        Ok(self
            .open_uploads()
            .into_iter()
            .filter(|u| u.key.starts_with(prefix))
            .collect())
    }

    async fn close(&self) -> ClientResult<()> {
        self.state().closed = true;
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for MemoryObjectClient {
    async fn connect(&self) -> ClientResult<Arc<dyn ObjectClient>> {
        Ok(Arc::new(self.clone()))
    }
}
