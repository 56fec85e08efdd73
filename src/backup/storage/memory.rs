use crate::backup::result_error::error::{Error, StorageOp};
use crate::backup::result_error::result::Result;
use crate::backup::storage::{content_etag, RemoteObject, StorageProvider};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// Blob storage held in process memory
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, (Vec<u8>, RemoteObject)>>,
}

impl MemoryStorage {
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageProvider for MemoryStorage {
    fn upload(&self, blob: &[u8], path: &str) -> Result<String> {
        let meta = RemoteObject {
            path: path.to_string(),
            size: blob.len() as u64,
            modified_at: Utc::now(),
            etag: content_etag(blob),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), (blob.to_vec(), meta));
        Ok(path.to_string())
    }

    fn download(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|(blob, _)| blob.clone())
            .ok_or_else(|| Error::not_found(StorageOp::Download, path))
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(_, (_, meta))| meta.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_download_delete() {
        let storage = MemoryStorage::default();
        assert_eq!(storage.upload(b"abc", "s1/f1").unwrap(), "s1/f1");
        assert_eq!(storage.download("s1/f1").unwrap(), b"abc");

        storage.delete("s1/f1").unwrap();
        let err = storage.download("s1/f1").unwrap_err();
        assert!(!err.is_retryable());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_list_by_prefix() {
        let storage = MemoryStorage::default();
        storage.upload(b"1", "a/1").unwrap();
        storage.upload(b"22", "a/2").unwrap();
        storage.upload(b"333", "b/1").unwrap();

        let listed = storage.list("a/").unwrap();
        assert_eq!(
            listed.iter().map(|o| (o.path.as_str(), o.size)).collect::<Vec<_>>(),
            vec![("a/1", 1), ("a/2", 2)]
        );
        assert_eq!(storage.list("").unwrap().len(), 3);
        assert_ne!(listed[0].etag, listed[1].etag);
    }
}
