//! S3-compatible object store adapter.

use super::{ObjectStore, StoreError, StoredObject, DIGEST_METADATA_KEY};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Multipart part size. S3 rejects non-final parts smaller than 5 MiB.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// Upper bound on concurrently uploading parts.
const MAX_PARTS_IN_FLIGHT: usize = 3;

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
    ) -> Self {
        let credentials = Credentials::from_keys(access_key, secret_key, None);
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut completed: Vec<CompletedPart> = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut part_number: i32 = 1;
        let mut eof = false;

        while !eof {
            let mut buf = Vec::with_capacity(PART_SIZE);
            while buf.len() < PART_SIZE {
                let mut chunk = vec![0u8; (PART_SIZE - buf.len()).min(64 * 1024)];
                let n = reader
                    .read(&mut chunk)
                    .await
                    .map_err(|e| StoreError::Transient(format!("read upload stream: {e}")))?;
                if n == 0 {
                    eof = true;
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            // S3 requires at least one part, so an empty first part is uploaded
            if buf.is_empty() && part_number > 1 {
                break;
            }

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let number = part_number;
            part_number += 1;

            in_flight.push(async move {
                let part = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(number)
                    .body(ByteStream::from(buf))
                    .send()
                    .await
                    .map_err(|e| classify("upload_part", e))?;
                Ok::<_, StoreError>(
                    CompletedPart::builder()
                        .part_number(number)
                        .set_e_tag(part.e_tag().map(str::to_string))
                        .build(),
                )
            });

            if in_flight.len() >= MAX_PARTS_IN_FLIGHT {
                if let Some(result) = in_flight.next().await {
                    completed.push(result?);
                }
            }
        }

        while let Some(result) = in_flight.next().await {
            completed.push(result?);
        }

        completed.sort_by_key(|p| p.part_number());
        Ok(completed)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("get_object", e))?;

        let content_type = resp
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let digest = resp
            .metadata()
            .and_then(|m| m.get(DIGEST_METADATA_KEY))
            .cloned();

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("read object body: {e}")))?
            .into_bytes();

        Ok(StoredObject {
            bytes,
            content_type,
            digest,
        })
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .metadata(DIGEST_METADATA_KEY, digest)
            .send()
            .await
            .map_err(|e| classify("put_object", e))?;
        Ok(())
    }

    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
        digest: &str,
    ) -> Result<(), StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .metadata(DIGEST_METADATA_KEY, digest)
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", e))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| StoreError::Permanent("multipart upload id missing".to_string()))?
            .to_string();

        let parts = match self.upload_parts(key, &upload_id, reader).await {
            Ok(parts) => parts,
            Err(err) => {
                // Abort so no orphaned parts remain billable in the bucket
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key = %key,
                        error = %DisplayErr(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                return Err(err);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", e))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match classify("delete_object", e) {
                StoreError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }
}

struct DisplayErr<'a, E>(&'a E);

impl<E: std::fmt::Debug> std::fmt::Display for DisplayErr<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Map an SDK error into the store failure classes.
fn classify<E>(operation: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or_default().to_string();
            let detail = format!("{operation}: {code} (status {status})");

            if status == 404 || code == "NoSuchKey" {
                StoreError::NotFound
            } else if status == 429
                || matches!(
                    code.as_str(),
                    "Throttling" | "ThrottlingException" | "SlowDown" | "RequestLimitExceeded"
                )
            {
                StoreError::Throttled(detail)
            } else if status == 413 || code == "EntityTooLarge" {
                StoreError::PayloadTooLarge(detail)
            } else if status >= 500 {
                StoreError::Transient(detail)
            } else {
                StoreError::Permanent(detail)
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(format!("{operation}: {err:?}"))
        }
        _ => StoreError::Permanent(format!("{operation}: {err:?}")),
    }
}
