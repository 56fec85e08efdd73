use crate::backup::result_error::error::{Error, StorageOp};
use crate::backup::result_error::result::Result;
use crate::backup::storage::{RemoteObject, StorageProvider};
use chrono::{DateTime, Utc};
use sanitize_filename::is_sanitized;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

/// Stores blobs as files below a root directory. Logical paths use `/` as
/// separator and every segment must be a plain file name.
#[derive(Clone, Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, op: StorageOp, path: &str) -> Result<PathBuf> {
        let segments: Vec<&str> = path.split('/').collect();
        let valid = segments
            .iter()
            .all(|s| !s.is_empty() && *s != "." && *s != ".." && is_sanitized(s));
        if !valid {
            return Err(Error::Transfer {
                op,
                path: path.to_string(),
                retryable: false,
                reason: "invalid logical path".into(),
            });
        }
        Ok(segments
            .iter()
            .fold(self.root.clone(), |acc, segment| acc.join(segment)))
    }

    fn logical_path(&self, file: &Path) -> Option<String> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
        Some(segments?.join("/"))
    }
}

/// Cheap change marker from metadata, so listing never reads blob content
fn metadata_etag(size: u64, modified_at: DateTime<Utc>) -> String {
    format!(
        "{:x}-{:x}",
        modified_at.timestamp_nanos_opt().unwrap_or_default(),
        size
    )
}

fn io_error(op: StorageOp, path: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::not_found(op, path)
    } else {
        Error::transfer(op, path, e)
    }
}

impl StorageProvider for FsStorage {
    fn upload(&self, blob: &[u8], path: &str) -> Result<String> {
        let target = self.resolve(StorageOp::Upload, path)?;
        let parent = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(parent).map_err(|e| Error::transfer(StorageOp::Upload, path, e))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|e| Error::transfer(StorageOp::Upload, path, e))?;
        tmp.write_all(blob)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::transfer(StorageOp::Upload, path, e))?;
        tmp.persist(&target)
            .map_err(|e| Error::transfer(StorageOp::Upload, path, e.error))?;
        tracing::debug!("Stored {} bytes at {:?}", blob.len(), target);
        Ok(path.to_string())
    }

    fn download(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(StorageOp::Download, path)?;
        std::fs::read(target).map_err(|e| io_error(StorageOp::Download, path, e))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(StorageOp::Delete, path)?;
        match std::fs::remove_file(target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::transfer(StorageOp::Delete, path, e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = vec![];
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::transfer(StorageOp::List, prefix, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = self.logical_path(entry.path()) else {
                continue;
            };
            // uploads still in flight
            let in_flight = path.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp"));
            if in_flight || !path.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| Error::transfer(StorageOp::List, prefix, e))?;
            let modified_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            objects.push(RemoteObject {
                size: meta.len(),
                modified_at,
                etag: metadata_etag(meta.len(), modified_at),
                path,
            });
        }
        Ok(objects)
    }
}
