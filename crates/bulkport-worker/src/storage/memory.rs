use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{
    CompletedPart, MultipartUpload, ObjectReader, ObjectStore, StorageError, StorageResult,
};

#[derive(Debug, Clone)]
struct OpenUpload {
    key: String,
    content_type: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
    parts: Vec<CompletedPart>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, OpenUpload>,
    aborts: HashMap<String, usize>,
    deleted: Vec<String>,
    initiated: usize,
}

/// In-process object store
///
/// Part bytes never reach this store: they are `PUT` to the URL returned by
/// [`presign_part`](ObjectStore::presign_part), which points at
/// `{presign_base}/{upload_id}/{part_number}`. Completed multipart objects
/// therefore record their part list but hold no data; objects added with
/// [`put_object`](MemoryObjectStore::put_object) carry real bytes and can be
/// streamed back.
#[derive(Debug, Clone)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<State>>,
    presign_base: String,
}

impl MemoryObjectStore {
    pub fn new(presign_base: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            presign_base: presign_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object directly
    pub fn put_object(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: None,
                parts: Vec::new(),
            },
        );
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.lock()
            .objects
            .get(key)
            .and_then(|o| o.content_type.clone())
    }

    /// Parts an object was assembled from, in part-number order
    pub fn parts_of(&self, key: &str) -> Vec<CompletedPart> {
        self.lock()
            .objects
            .get(key)
            .map(|o| o.parts.clone())
            .unwrap_or_default()
    }

    /// Multipart uploads initiated but neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    pub fn initiated_uploads(&self) -> usize {
        self.lock().initiated
    }

    /// Total abort calls, including repeats for the same upload
    pub fn abort_calls(&self) -> usize {
        self.lock().aborts.values().sum()
    }

    pub fn deleted_keys(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_read(&self, key: &str) -> StorageResult<ObjectReader> {
        let data = self
            .lock()
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<MultipartUpload> {
        let upload_id = Uuid::new_v4().simple().to_string();
        let mut state = self.lock();
        state.initiated += 1;
        state.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
        })
    }

    async fn presign_part(
        &self,
        upload: &MultipartUpload,
        part_number: i32,
        _expires_in: Duration,
    ) -> StorageResult<String> {
        if !self.lock().uploads.contains_key(&upload.upload_id) {
            return Err(StorageError::UnknownUpload {
                key: upload.key.clone(),
                upload_id: upload.upload_id.clone(),
            });
        }
        Ok(format!(
            "{}/{}/{}",
            self.presign_base, upload.upload_id, part_number
        ))
    }

    async fn complete_multipart(
        &self,
        upload: &MultipartUpload,
        parts: &[CompletedPart],
    ) -> StorageResult<Option<String>> {
        let mut state = self.lock();
        let open = state.uploads.remove(&upload.upload_id).ok_or_else(|| {
            StorageError::UnknownUpload {
                key: upload.key.clone(),
                upload_id: upload.upload_id.clone(),
            }
        })?;

        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);
        state.objects.insert(
            open.key,
            StoredObject {
                data: Vec::new(),
                content_type: open.content_type,
                parts: ordered,
            },
        );
        Ok(Some(format!("\"{}-{}\"", upload.upload_id, parts.len())))
    }

    async fn abort_multipart(&self, upload: &MultipartUpload) -> StorageResult<()> {
        let mut state = self.lock();
        *state.aborts.entry(upload.upload_id.clone()).or_insert(0) += 1;
        state.uploads.remove(&upload.upload_id);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.lock().objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let mut state = self.lock();
        state.objects.remove(key);
        state.deleted.push(key.to_string());
        Ok(())
    }

    async fn create_folder(&self, prefix: &str) -> StorageResult<()> {
        self.put_object(&format!("{}/", prefix.trim_end_matches('/')), Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_open_read_streams_object() {
        let store = MemoryObjectStore::new("http://localhost/parts");
        store.put_object("uploads/rows.csv", b"sku,title\n".to_vec());

        let mut reader = store.open_read("uploads/rows.csv").await.unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "sku,title\n");

        assert!(matches!(
            store.open_read("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_multipart_lifecycle_tracks_sessions() {
        let store = MemoryObjectStore::new("http://localhost/parts/");
        let upload = store.initiate_multipart("a/b.png", Some("image/png")).await.unwrap();
        assert_eq!(store.open_uploads(), 1);

        let url = store.presign_part(&upload, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(url, format!("http://localhost/parts/{}/1", upload.upload_id));

        let parts = vec![
            CompletedPart { part_number: 2, etag: "b".into() },
            CompletedPart { part_number: 1, etag: "a".into() },
        ];
        store.complete_multipart(&upload, &parts).await.unwrap();
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.parts_of("a/b.png")[0].etag, "a");
        assert_eq!(store.content_type("a/b.png").as_deref(), Some("image/png"));

        assert!(store.presign_part(&upload, 3, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_and_delete_are_recorded() {
        let store = MemoryObjectStore::new("http://localhost");
        let upload = store.initiate_multipart("x", None).await.unwrap();
        store.abort_multipart(&upload).await.unwrap();
        assert_eq!(store.abort_calls(), 1);
        assert_eq!(store.open_uploads(), 0);

        store.put_object("y", vec![1, 2, 3]);
        store.delete("y").await.unwrap();
        assert!(!store.exists("y").await.unwrap());
        assert_eq!(store.deleted_keys(), vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn test_create_folder_writes_one_marker() {
        let store = MemoryObjectStore::new("http://localhost");
        store.create_folder("companies/acme/catalog/sku-1/").await.unwrap();
        store.create_folder("companies/acme/catalog/sku-1").await.unwrap();

        assert_eq!(store.object_keys(), vec!["companies/acme/catalog/sku-1/".to_string()]);
        assert!(store.exists("companies/acme/catalog/sku-1/").await.unwrap());
    }
}
