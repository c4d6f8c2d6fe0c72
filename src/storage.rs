//! Storage backends for the archive.
//!
//! Paths are the partition paths built by [`crate::partition`]. The local
//! backend uses them as filesystem paths; S3 joins their normal components
//! with `/` to form object keys.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Recursive and idempotent.
    async fn create_dir_all(&self, dir: &Path) -> Result<()>;

    /// Files directly inside `dir` whose name ends with `suffix`, in
    /// lexicographic order. A missing directory lists as empty.
    async fn list(&self, dir: &Path, suffix: &str) -> Result<Vec<PathBuf>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Replaces the whole object. Readers never observe a partial write.
    async fn write(&self, path: &Path, contents: Bytes) -> Result<()>;

    /// Rejects an archive root that can never hold partitions, with
    /// [`Error::Config`]. Creates nothing.
    async fn check_base(&self, _base: &Path) -> Result<()> {
        Ok(())
    }
}

fn name_matches(name: Option<&OsStr>, suffix: &str) -> bool {
    name.and_then(OsStr::to_str)
        .is_some_and(|n| n.len() > suffix.len() && n.ends_with(suffix))
}

/// Archive on the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn create_dir_all(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn list(&self, dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && name_matches(path.file_name(), suffix) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    async fn write(&self, path: &Path, contents: Bytes) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| Error::storage(path, "destination has no file name"))?;
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

        tokio::fs::write(&tmp, &contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// The base, or its nearest existing ancestor, must be a directory.
    async fn check_base(&self, base: &Path) -> Result<()> {
        for dir in base.ancestors().filter(|d| !d.as_os_str().is_empty()) {
            match tokio::fs::metadata(dir).await {
                Ok(meta) if meta.is_dir() => return Ok(()),
                Ok(_) => {
                    return Err(Error::Config(format!(
                        "archive directory {} is unusable: {} is not a directory",
                        base.display(),
                        dir.display()
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Config(format!(
                        "archive directory {} is not accessible: {e}",
                        base.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Archive in an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Uses the ambient AWS configuration (env vars, instance profile, ...).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

/// Object key for a partition path: its normal components joined with `/`.
pub fn object_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Storage for S3Storage {
    async fn create_dir_all(&self, _dir: &Path) -> Result<()> {
        // Prefixes exist implicitly.
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
        let mut prefix = object_key(dir);
        if !prefix.is_empty() {
            prefix.push('/');
        }

        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Error::storage(dir, e.into_service_error()))?;

            keys.extend(
                resp.contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter(|key| key.ends_with(suffix) && key.len() > prefix.len() + suffix.len())
                    .map(PathBuf::from),
            );

            match resp.next_continuation_token() {
                Some(token) if resp.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        debug!(count = keys.len(), prefix = %prefix, "Listed S3 partition");
        Ok(keys)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key(path))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = e.into_service_error();
                if e.is_not_found() {
                    Ok(false)
                } else {
                    Err(Error::storage(path, e))
                }
            }
        }
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key(path))
            .send()
            .await
            .map_err(|e| Error::storage(path, e.into_service_error()))?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::storage(path, e))?;
        Ok(body.into_bytes())
    }

    async fn write(&self, path: &Path, contents: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key(path))
            .content_type("application/gzip")
            .body(ByteStream::from(contents))
            .send()
            .await
            .map_err(|e| Error::storage(path, e.into_service_error()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Bytes>,
}

/// In-process archive, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored file path, sorted.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().await.files.keys().cloned().collect()
    }

    pub async fn dirs(&self) -> Vec<PathBuf> {
        self.state.lock().await.dirs.iter().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_dir_all(&self, dir: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        for ancestor in dir.ancestors().filter(|a| !a.as_os_str().is_empty()) {
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn list(&self, dir: &Path, suffix: &str) -> Result<Vec<PathBuf>> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir) && name_matches(p.file_name(), suffix))
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        self.state
            .lock()
            .await
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::storage(path, "no such file"))
    }

    async fn write(&self, path: &Path, contents: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !state.dirs.contains(parent) {
                return Err(Error::storage(path, "parent directory does not exist"));
            }
        }
        state.files.insert(path.to_path_buf(), contents);
        Ok(())
    }
}
