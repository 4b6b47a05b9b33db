use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::models::work_item::ObjectRef;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, object: &ObjectRef, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    /// Fails with [`StorageError::NotFound`] when the object does not exist.
    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError>;

    /// Keys under `prefix`, in lexicographic order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn get_optional(&self, object: &ObjectRef) -> Result<Option<Vec<u8>>, StorageError> {
        match self.get(object).await {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Client for S3-compatible object storage.
pub struct S3ObjectStore {
    region: Region,
    credentials: Credentials,
}

impl S3ObjectStore {
    pub fn new(endpoint: &str, region: &str, access_key: &str, secret_key: &str) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { region, credentials })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(bucket.with_path_style())
    }
}

fn check_status(status: u16, object: &ObjectRef) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(object.to_string())),
        code => Err(StorageError::Status {
            code,
            object: object.to_string(),
        }),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, object: &ObjectRef, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket(&object.bucket)?
            .put_object_with_content_type(&object.key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), object)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket(&object.bucket)?
            .get_object(&object.key)
            .await
            .map_err(StorageError::S3)?;
        check_status(response.status_code(), object)?;
        Ok(response.bytes().to_vec())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pages = self
            .bucket(bucket)?
            .list(prefix.to_string(), None)
            .await
            .map_err(StorageError::S3)?;
        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents.into_iter().map(|object| object.key))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-process object store for local runs and tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects across all buckets.
    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an object, as a bucket lifecycle rule would.
    pub fn remove(&self, object: &ObjectRef) -> bool {
        self.objects
            .write()
            .map(|mut objects| objects.remove(&(object.bucket.clone(), object.key.clone())).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, object: &ObjectRef, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::Config("object map lock poisoned".into()))?;
        objects.insert((object.bucket.clone(), object.key.clone()), data.to_vec());
        Ok(())
    }

    async fn get(&self, object: &ObjectRef) -> Result<Vec<u8>, StorageError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StorageError::Config("object map lock poisoned".into()))?;
        objects
            .get(&(object.bucket.clone(), object.key.clone()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(object.to_string()))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StorageError::Config("object map lock poisoned".into()))?;
        Ok(objects
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {code} for {object}")]
    Status { code: u16, object: String },

    #[error("Artifact {0} already exists with different content")]
    ArtifactConflict(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok, block_on};

    #[test]
    fn test_memory_store_put_get_list() {
        let store = MemoryObjectStore::new();
        let a = ObjectRef::new("internal", "batch_input/p/p-batch1.jsonl");
        let b = ObjectRef::new("internal", "batch_output/j/p-batch1.jsonl.out");
        assert_ok!(block_on(store.put(&a, b"one", "application/jsonl")));
        assert_ok!(block_on(store.put(&b, b"two", "application/jsonl")));

        assert_eq!(assert_ok!(block_on(store.get(&a))), b"one");
        assert_eq!(
            assert_ok!(block_on(store.list("internal", "batch_output/"))),
            vec!["batch_output/j/p-batch1.jsonl.out".to_string()]
        );
        assert!(assert_ok!(block_on(store.list("customer", ""))).is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_object() {
        let store = MemoryObjectStore::new();
        let missing = ObjectRef::new("internal", "nope");
        assert!(matches!(assert_err!(block_on(store.get(&missing))), StorageError::NotFound(_)));
        assert_eq!(assert_ok!(block_on(store.get_optional(&missing))), None);
    }

    #[test]
    fn test_remove_object() {
        let store = MemoryObjectStore::new();
        let object = ObjectRef::new("internal", "batch_output/j/p-batch1.jsonl.out");
        assert_ok!(block_on(store.put(&object, b"x", "application/jsonl")));

        assert!(store.remove(&object));
        assert!(!store.remove(&object));
        assert!(store.is_empty());
    }
}
