//! Opaque blob storage the transfer pipeline writes artifacts to.
//!
//! Implementations report unreachable backends and I/O failures as retryable
//! transfer errors and missing objects as non-retryable ones.

pub mod fs;
pub mod memory;

use crate::backup::result_error::result::Result;
use crate::backup::transfer::digest::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Listing entry for a stored blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Changes whenever the blob does; format is provider specific
    pub etag: String,
}

pub trait StorageProvider: Send + Sync {
    /// Stores `blob` at `path`, returning the path it is reachable under.
    fn upload(&self, blob: &[u8], path: &str) -> Result<String>;

    fn download(&self, path: &str) -> Result<Vec<u8>>;

    fn delete(&self, path: &str) -> Result<()>;

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
}

impl<T: StorageProvider + ?Sized> StorageProvider for Arc<T> {
    fn upload(&self, blob: &[u8], path: &str) -> Result<String> {
        (**self).upload(blob, path)
    }

    fn download(&self, path: &str) -> Result<Vec<u8>> {
        (**self).download(path)
    }

    fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        (**self).list(prefix)
    }
}

/// Content tag for a stored blob
pub(crate) fn content_etag(blob: &[u8]) -> String {
    let mut digest = sha256_hex(blob);
    digest.truncate(16);
    digest
}
