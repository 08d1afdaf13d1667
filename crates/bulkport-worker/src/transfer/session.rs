use async_trait::async_trait;
use reqwest::header::ETAG;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{Result, TransferError};
use crate::storage::{CompletedPart, MultipartUpload, ObjectStore};

/// Sends one part body to a pre-signed URL and returns the part's ETag
#[async_trait]
pub trait PartUploader: Send + Sync {
    async fn put_part(&self, url: &str, body: Vec<u8>) -> Result<String>;
}

/// [`PartUploader`] issuing plain HTTP `PUT`s
#[derive(Debug, Clone)]
pub struct PresignedPartUploader {
    client: reqwest::Client,
    timeout: Duration,
}

impl PresignedPartUploader {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl PartUploader for PresignedPartUploader {
    async fn put_part(&self, url: &str, body: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .put(url)
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: strip_query(url),
            });
        }

        response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Network("part upload returned no ETag".to_string()))
    }
}

/// Pre-signed URLs carry credentials in the query string
fn strip_query(url: &str) -> String {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url).to_string()
}

/// One open multipart upload
///
/// Parts are numbered from 1 in upload order. The session is consumed by
/// [`complete`](Self::complete) or [`abort`](Self::abort), so it is
/// finalized at most once.
pub struct MultipartSession {
    store: Arc<dyn ObjectStore>,
    uploader: Arc<dyn PartUploader>,
    upload: MultipartUpload,
    parts: Vec<CompletedPart>,
    presign_ttl: Duration,
}

impl MultipartSession {
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        uploader: Arc<dyn PartUploader>,
        key: &str,
        content_type: Option<&str>,
        presign_ttl: Duration,
    ) -> Result<Self> {
        let upload = store.initiate_multipart(key, content_type).await?;
        debug!(key, upload_id = %upload.upload_id, "Multipart upload initiated");
        Ok(Self {
            store,
            uploader,
            upload,
            parts: Vec::new(),
            presign_ttl,
        })
    }

    pub fn upload(&self) -> &MultipartUpload {
        &self.upload
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    #[instrument(skip(self, body), fields(upload_id = %self.upload.upload_id, part_number, bytes = body.len()))]
    pub async fn upload_part(&mut self, body: Vec<u8>) -> Result<()> {
        let part_number = i32::try_from(self.parts.len() + 1)
            .map_err(|_| TransferError::Validation("too many parts".to_string()))?;
        tracing::Span::current().record("part_number", part_number);

        let url = self
            .store
            .presign_part(&self.upload, part_number, self.presign_ttl)
            .await?;
        let etag = self.uploader.put_part(&url, body).await?;

        self.parts.push(CompletedPart { part_number, etag });
        Ok(())
    }

    /// Assemble the object; a failed completion aborts the session
    pub async fn complete(self) -> Result<Option<String>> {
        match self
            .store
            .complete_multipart(&self.upload, &self.parts)
            .await
        {
            Ok(etag) => {
                debug!(
                    key = %self.upload.key,
                    parts = self.parts.len(),
                    "Multipart upload completed"
                );
                Ok(etag)
            },
            Err(e) => {
                self.abort().await;
                Err(e.into())
            },
        }
    }

    /// Discard the upload; failures are logged and left to bucket lifecycle rules
    pub async fn abort(self) {
        match self.store.abort_multipart(&self.upload).await {
            Ok(()) => debug!(
                key = %self.upload.key,
                upload_id = %self.upload.upload_id,
                "Multipart upload aborted"
            ),
            Err(e) => warn!(
                key = %self.upload.key,
                upload_id = %self.upload.upload_id,
                error = %e,
                "Failed to abort multipart upload"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        puts: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl PartUploader for Recorder {
        async fn put_part(&self, url: &str, body: Vec<u8>) -> Result<String> {
            let mut puts = self.puts.lock().unwrap();
            puts.push((url.to_string(), body.len()));
            Ok(format!("\"etag-{}\"", puts.len()))
        }
    }

    #[tokio::test]
    async fn test_parts_are_numbered_in_order() {
        let store = Arc::new(MemoryObjectStore::new("http://parts.local"));
        let recorder = Arc::new(Recorder::default());
        let mut session = MultipartSession::open(
            store.clone(),
            recorder.clone(),
            "media/a.png",
            Some("image/png"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let upload_id = session.upload().upload_id.clone();
        session.upload_part(vec![0; 5]).await.unwrap();
        session.upload_part(vec![0; 3]).await.unwrap();
        session.complete().await.unwrap();

        let puts = recorder.puts.lock().unwrap().clone();
        assert_eq!(puts[0].0, format!("http://parts.local/{}/1", upload_id));
        assert_eq!(puts[1].0, format!("http://parts.local/{}/2", upload_id));

        let parts = store.parts_of("media/a.png");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].etag, "\"etag-2\"");
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.content_type("media/a.png").as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_abort_closes_session() {
        let store = Arc::new(MemoryObjectStore::new("http://parts.local"));
        let session = MultipartSession::open(
            store.clone(),
            Arc::new(Recorder::default()),
            "media/b.png",
            None,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        session.abort().await;
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.abort_calls(), 1);
        assert!(!store.contains("media/b.png"));
    }

    #[test]
    fn test_strip_query_hides_signature() {
        assert_eq!(
            strip_query("https://s3.local/b/k?partNumber=1&X-Amz-Signature=abc"),
            "https://s3.local/b/k"
        );
    }
}
