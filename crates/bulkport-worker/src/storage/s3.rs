use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
    Client,
};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::StorageConfig;

use super::{
    CompletedPart, MultipartUpload, ObjectReader, ObjectStore, StorageError, StorageResult,
};

/// S3-compatible object store (AWS, MinIO)
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

fn sdk_error<E: std::error::Error>(operation: &'static str, key: &str, err: E) -> StorageError {
    StorageError::request(operation, key, DisplayErrorContext(err).to_string())
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bulkport-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            "Storage client initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[instrument(skip(self))]
    async fn open_read(&self, key: &str) -> StorageResult<ObjectReader> {
        debug!("Opening stream from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    sdk_error("get_object", key, e)
                }
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<MultipartUpload> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type.map(str::to_string))
            .send()
            .await
            .map_err(|e| sdk_error("create_multipart_upload", key, e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StorageError::request("create_multipart_upload", key, "no upload id returned"))?;

        debug!(upload_id, "Multipart upload initiated for s3://{}/{}", self.bucket, key);

        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        })
    }

    #[instrument(skip(self, upload), fields(key = %upload.key, upload_id = %upload.upload_id))]
    async fn presign_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| sdk_error("presign_upload_part", &upload.key, e))?;

        let presigned_request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .presigned(presigning_config)
            .await
            .map_err(|e| sdk_error("presign_upload_part", &upload.key, e))?;

        Ok(presigned_request.uri().to_string())
    }

    #[instrument(skip(self, upload, parts), fields(key = %upload.key, upload_id = %upload.upload_id, parts = parts.len()))]
    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>> {
        let s3_parts = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(s3_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error("complete_multipart_upload", &upload.key, e))?;

        info!("Multipart upload completed: s3://{}/{}", self.bucket, upload.key);

        Ok(response.e_tag().map(str::to_string))
    }

    #[instrument(skip(self, upload), fields(key = %upload.key, upload_id = %upload.upload_id))]
    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abort_multipart_upload", &upload.key, e))?;

        warn!("Multipart upload aborted: s3://{}/{}", self.bucket, upload.key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(false)
                } else {
                    Err(sdk_error("head_object", key, e))
                }
            },
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("delete_object", key, e))?;

        info!("Deleted s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_folder(&self, prefix: &str) -> StorageResult<()> {
        let key = format!("{}/", prefix.trim_end_matches('/'));

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|e| sdk_error("put_object", &key, e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presign_part_targets_upload() {
        let storage = S3Storage::new(&StorageConfig {
            bucket: "media".to_string(),
            ..StorageConfig::default()
        });
        let upload = MultipartUpload {
            key: "companies/acme/logo.png".to_string(),
            upload_id: "abc123".to_string(),
        };

        let url = storage
            .presign_part(&upload, 3, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:9000/media/companies/acme/logo.png"));
        assert!(url.contains("partNumber=3"));
        assert!(url.contains("uploadId=abc123"));
        assert!(url.contains("X-Amz-Signature="));
    }
}
