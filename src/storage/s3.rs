// cloudstash/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::config::{Credentials, Region};
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use std::sync::Arc;
use tracing::debug;

use super::client::{
    ClientFactory, CompletedPart, ObjectBody, ObjectClient, ObjectInfo, ObjectPage, OpenUpload,
};
use super::{ClientError, ClientResult};
use crate::config::ConnectionDescriptor;

/// Builds an [`S3ObjectClient`] for an S3-compatible endpoint (DigitalOcean
/// Spaces, MinIO, R2, AWS) with static credentials.
#[derive(Debug, Clone)]
pub struct S3ClientFactory {
    descriptor: ConnectionDescriptor,
}

impl S3ClientFactory {
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        S3ClientFactory { descriptor }
    }
}

#[async_trait]
impl ClientFactory for S3ClientFactory {
    async fn connect(&self) -> ClientResult<Arc<dyn ObjectClient>> {
        let descriptor = &self.descriptor;
        debug!(
            endpoint = descriptor.endpoint_url(),
            region = descriptor.region(),
            bucket = descriptor.bucket_name(),
            "building S3 client"
        );

        let mut timeouts = aws_config::timeout::TimeoutConfig::builder();
        if let Some(operation) = descriptor.timeouts().operation {
            timeouts = timeouts.operation_timeout(operation);
        }
        if let Some(connect) = descriptor.timeouts().connect {
            timeouts = timeouts.connect_timeout(connect);
        }

        // Loading reads profile files and trust roots from disk.
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(descriptor.endpoint_url())
            .region(Region::new(descriptor.region().to_string()))
            .credentials_provider(Credentials::new(
                descriptor.access_key_id(),
                descriptor.secret_access_key(),
                None, // session_token
                None, // expiry
                "Static",
            ))
            .timeout_config(timeouts.build())
            .load()
            .await;

        // Path-style addressing works with every S3-compatible provider.
        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Ok(Arc::new(S3ObjectClient {
            client: s3::Client::from_conf(s3_config),
            bucket: descriptor.bucket_name().to_string(),
        }))
    }
}

pub struct S3ObjectClient {
    client: s3::Client,
    bucket: String,
}

/// Sorts an SDK failure into timeout / unreachable / service rejection / bad request.
fn classify<E>(err: SdkError<E>) -> ClientError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => ClientError::Timeout(detail),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => ClientError::Timeout(detail),
        SdkError::DispatchFailure(failure) if failure.is_user() => {
            ClientError::InvalidRequest(detail)
        }
        SdkError::DispatchFailure(_) => ClientError::Unreachable(detail),
        SdkError::ConstructionFailure(_) => ClientError::InvalidRequest(detail),
        SdkError::ServiceError(service) => ClientError::Service {
            status: service.raw().status().as_u16(),
            code: service.err().code().unwrap_or("Unknown").to_string(),
            message: service
                .err()
                .message()
                .map(str::to_string)
                .unwrap_or(detail),
        },
        SdkError::ResponseError(_) => ClientError::MalformedResponse(detail),
        _ => ClientError::Unreachable(detail),
    }
}

fn to_utc(timestamp: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

fn body_stream(body: ByteStream) -> ObjectBody {
    Box::pin(futures::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        match body.try_next().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
            Ok(None) => None,
            // Nothing more can be read after a body error.
            Err(e) => Some((
                Err(ClientError::Unreachable(format!(
                    "connection lost while reading object body: {}",
                    e
                ))),
                None,
            )),
        }
    }))
}

#[async_trait]
impl ObjectClient for S3ObjectClient {
    async fn head_bucket(&self) -> ClientResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service)) if service.raw().status().as_u16() == 404 => {
                Err(ClientError::service(
                    404,
                    "NoSuchBucket",
                    format!("bucket {} does not exist", self.bucket),
                ))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn put_object(&self, key: &str, body: Bytes) -> ClientResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> ClientResult<ObjectBody> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(body_stream(object.body))
    }

    async fn head_object(&self, key: &str) -> ClientResult<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                last_modified: output.last_modified().and_then(to_utc),
            })),
            Err(SdkError::ServiceError(service)) if service.raw().status().as_u16() == 404 => {
                Ok(None)
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> ClientResult<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(classify)?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectInfo {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_utc),
                })
            })
            .collect();

        let next_continuation_token = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage {
            objects,
            next_continuation_token,
        })
    }

    async fn delete_object(&self, key: &str) -> ClientResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> ClientResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        output.upload_id().map(str::to_string).ok_or_else(|| {
            ClientError::MalformedResponse(format!(
                "CreateMultipartUpload for {} returned no upload id",
                key
            ))
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;

        let e_tag = output.e_tag().map(str::to_string).ok_or_else(|| {
            ClientError::MalformedResponse(format!(
                "UploadPart {} for {} returned no ETag",
                part_number, key
            ))
        })?;
        Ok(CompletedPart { part_number, e_tag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> ClientResult<()> {
        let parts = parts
            .into_iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .e_tag(part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ClientResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> ClientResult<Vec<OpenUpload>> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_multipart_uploads()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_key_marker(key_marker.take())
                .set_upload_id_marker(upload_id_marker.take())
                .send()
                .await
                .map_err(classify)?;

            uploads.extend(output.uploads().iter().filter_map(|upload| {
                Some(OpenUpload {
                    key: upload.key()?.to_string(),
                    upload_id: upload.upload_id()?.to_string(),
                })
            }));

            if output.is_truncated() != Some(true) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            upload_id_marker = output.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() && upload_id_marker.is_none() {
                break;
            }
        }
        Ok(uploads)
    }
}
