//! Local files as backup input.
//!
//! [`FsSource::scan`] walks a schedule's include paths, drops whatever an
//! exclude glob matches and describes the rest; [`FileSource::read`] loads
//! the content of an ingested record when the tracker gets to it.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::session::{BackupFileRecord, FileDescriptor};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

pub trait FileSource: Send + Sync {
    fn read(&self, record: &BackupFileRecord) -> Result<Vec<u8>>;
}

/// What a scan found, plus the entries it could not look at
#[derive(Debug, Default)]
pub struct Scan {
    pub files: Vec<FileDescriptor>,
    pub errors: Vec<Error>,
}

#[derive(Clone, Debug)]
pub struct FsSource {
    follow_links: bool,
}

impl Default for FsSource {
    fn default() -> Self {
        Self { follow_links: true }
    }
}

impl FsSource {
    pub fn new(follow_links: bool) -> Self {
        Self { follow_links }
    }

    /// Resolves include paths (files or directories) into descriptors sorted
    /// by path. Excludes are globs over the full path, `*` does not cross `/`.
    pub fn scan<S: AsRef<str>>(&self, include: &[S], exclude: &[S]) -> Result<Scan> {
        let excludes = build_globset(exclude)?;
        let mut found = BTreeMap::new();
        let mut errors = vec![];

        for root in include.iter().map(|p| PathBuf::from(p.as_ref())) {
            if !root.exists() {
                tracing::warn!("Include path {:?} does not exist", root);
                errors.push(Error::from(std::io::Error::other(format!(
                    "include path {root:?} does not exist"
                ))));
                continue;
            }
            tracing::debug!("Scanning {:?}", root);
            for entry in WalkDir::new(&root).follow_links(self.follow_links) {
                match entry {
                    Ok(entry) => {
                        if let Some(res) = describe(&root, entry, &excludes) {
                            match res {
                                Ok(descriptor) => {
                                    found.insert(descriptor.path().clone(), descriptor);
                                }
                                Err(e) => errors.push(e),
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Skipping unreadable entry under {:?}: {}", root, e);
                        errors.push(e.into());
                    }
                }
            }
        }

        tracing::info!(
            "Scan found {} files ({} errors)",
            found.len(),
            errors.len()
        );
        Ok(Scan {
            files: found.into_values().collect(),
            errors,
        })
    }
}

impl FileSource for FsSource {
    fn read(&self, record: &BackupFileRecord) -> Result<Vec<u8>> {
        let data = std::fs::read(record.path())
            .map_err(Error::from)
            .with_msg(format!("Reading {:?} failed", record.path()))?;
        if data.len() as u64 != record.size() {
            tracing::debug!(
                "{:?} changed size since ingestion: {} -> {}",
                record.path(),
                record.size(),
                data.len()
            );
        }
        Ok(data)
    }
}

fn build_globset<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            GlobBuilder::new(pattern.as_ref())
                .literal_separator(true)
                .build()?,
        );
    }
    Ok(builder.build()?)
}

fn describe(root: &Path, entry: DirEntry, excludes: &GlobSet) -> Option<Result<FileDescriptor>> {
    let path = entry.path();
    if excludes.is_match(path) {
        tracing::trace!("Skipping {:?}, excluded", path);
        return None;
    }
    if !entry.file_type().is_file() && !(entry.path_is_symlink() && path.is_file()) {
        return None;
    }

    let res = entry.metadata().map_err(Error::from).map(|meta| {
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        FileDescriptor::builder()
            .name(display_name(root, path))
            .size(meta.len())
            .content_type(content_type(path))
            .path(path)
            .last_modified(last_modified)
            .build()
    });
    Some(res.with_msg(format!("Reading metadata of {path:?} failed")))
}

/// Path relative to the include root's parent, so the root's own name stays
fn display_name(root: &Path, path: &Path) -> String {
    let base = root.parent().unwrap_or(root);
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<_> = relative
        .iter()
        .map(|s| s.to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_files(dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join("docs/sub"))?;
        std::fs::write(dir.join("docs/file1.txt"), "content1")?;
        std::fs::write(dir.join("docs/file2.json"), "content22")?;
        std::fs::write(dir.join("docs/sub/file3.txt"), "content333")?;
        std::fs::write(dir.join("docs/sub/file4.tmp"), "scratch")?;
        std::fs::write(dir.join("single.md"), "# readme")?;
        Ok(())
    }

    fn path_str(dir: &TempDir, rel: &str) -> String {
        dir.path().join(rel).to_string_lossy().into_owned()
    }

    #[test]
    fn test_scan_directory_and_file() {
        let dir = TempDir::new().unwrap();
        create_test_files(dir.path()).unwrap();

        let scan = FsSource::default()
            .scan(&[path_str(&dir, "docs"), path_str(&dir, "single.md")], &[])
            .unwrap();
        assert!(scan.errors.is_empty());

        let names: Vec<_> = scan.files.iter().map(|f| f.name().as_str()).collect();
        assert_eq!(
            names,
            vec![
                "docs/file1.txt",
                "docs/file2.json",
                "docs/sub/file3.txt",
                "docs/sub/file4.tmp",
                "single.md"
            ]
        );
        let json = &scan.files[1];
        assert_eq!(json.size(), 9);
        assert_eq!(json.content_type(), "application/json");
        assert!(scan.files[4].content_type().starts_with("text/"));
    }

    #[test]
    fn test_scan_applies_excludes() {
        let dir = TempDir::new().unwrap();
        create_test_files(dir.path()).unwrap();

        let scan = FsSource::default()
            .scan(&[path_str(&dir, "docs")], &["**/*.tmp".to_string()])
            .unwrap();
        assert_eq!(scan.files.len(), 3);
        assert!(scan
            .files
            .iter()
            .all(|f| !f.name().ends_with(".tmp")));

        // excluding a directory drops everything below it
        let sub = format!("{}/**", path_str(&dir, "docs/sub"));
        let scan = FsSource::default()
            .scan(&[path_str(&dir, "docs")], &[sub])
            .unwrap();
        assert_eq!(scan.files.len(), 2);
    }

    #[test]
    fn test_overlapping_includes_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        create_test_files(dir.path()).unwrap();

        let scan = FsSource::default()
            .scan(&[path_str(&dir, "docs"), path_str(&dir, "docs/sub")], &[])
            .unwrap();
        assert_eq!(scan.files.len(), 4);
    }

    #[test]
    fn test_missing_include_is_reported() {
        let dir = TempDir::new().unwrap();
        create_test_files(dir.path()).unwrap();

        let scan = FsSource::default()
            .scan(&[path_str(&dir, "nope"), path_str(&dir, "single.md")], &[])
            .unwrap();
        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.errors.len(), 1);
    }

    #[test]
    fn test_invalid_exclude_is_an_error() {
        let err = FsSource::default()
            .scan(&["/tmp".to_string()], &["[oops".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Globset(_)));
    }

    #[test]
    fn test_content_type_from_extension() {
        assert_eq!(content_type(Path::new("a/B.PNG")), "image/png");
        assert_eq!(content_type(Path::new("a/notes.txt")), "text/plain");
        assert_eq!(content_type(Path::new("a/noext")), "application/octet-stream");
        assert_eq!(content_type(Path::new("a/blob.k-vault-unknown")), "application/octet-stream");
    }
}
