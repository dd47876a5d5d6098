//! Object storage adapter
//!
//! Objects live under a per-application prefix (`<user>/<app>`) and are
//! addressed by workspace-relative paths. [`LocalObjectStore`] keeps them on
//! the local filesystem; [`RetryingStore`] bounds every call with a timeout and
//! retries transient failures; [`mock::MockObjectStore`] injects failures for
//! tests.

use crate::config::StorageConfig;
use crate::errors::StorageError;
use crate::retry::{retry_async, storage_classifier, RetryConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// SHA-256 of `data` as lowercase hex
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Listing entry for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// put/get/list/delete against a prefix
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, prefix: &str, path: &str, data: Bytes) -> StorageResult<ObjectMeta>;

    /// Fails with `NotFound` for a missing object
    async fn get(&self, prefix: &str, path: &str) -> StorageResult<Bytes>;

    async fn exists(&self, prefix: &str, path: &str) -> StorageResult<bool>;

    /// All objects under `prefix`, ordered by path
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    /// Deleting a missing object succeeds
    async fn delete(&self, prefix: &str, path: &str) -> StorageResult<()>;

    /// Remove every object under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let objects = self.list(prefix).await?;
        for object in &objects {
            self.delete(prefix, &object.path).await?;
        }
        Ok(objects.len())
    }
}

/// Reject empty, absolute, and parent-escaping keys
pub fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidKey {
        key: key.to_string(),
    };
    if key.trim().is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

/// Directory under the store root holding in-flight writes. Prefixes are
/// `user/app` with user ids that never start with a dot, so it is never
/// inside a listed prefix.
const STAGING_DIR: &str = ".staging";

/// Filesystem-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(root: PathBuf) -> StorageResult<Self> {
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(Self { root })
    }

    fn prefix_dir(&self, prefix: &str) -> StorageResult<PathBuf> {
        validate_key(prefix)?;
        Ok(self.root.join(prefix))
    }

    fn path_for(&self, prefix: &str, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.prefix_dir(prefix)?.join(key))
    }

    async fn meta_for(base: &Path, path: &Path) -> StorageResult<Option<ObjectMeta>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = tokio::fs::metadata(path).await?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let Ok(rel) = path.strip_prefix(base) else {
            return Ok(None);
        };
        Ok(Some(ObjectMeta {
            path: rel.to_string_lossy().replace('\\', "/"),
            hash: content_hash(&data),
            size: metadata.len(),
            modified,
        }))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(level = "debug", skip(self, data), fields(size = data.len()))]
    async fn put(&self, prefix: &str, path: &str, data: Bytes) -> StorageResult<ObjectMeta> {
        let target = self.path_for(prefix, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a torn object
        let staging = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &data).await?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        let base = self.prefix_dir(prefix)?;
        Self::meta_for(&base, &target)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                prefix: prefix.to_string(),
                path: path.to_string(),
            })
    }

    #[instrument(level = "debug", skip(self))]
    async fn get(&self, prefix: &str, path: &str) -> StorageResult<Bytes> {
        let target = self.path_for(prefix, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                prefix: prefix.to_string(),
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, prefix: &str, path: &str) -> StorageResult<bool> {
        let target = self.path_for(prefix, path)?;
        match tokio::fs::metadata(&target).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let base = self.prefix_dir(prefix)?;
        let mut out = Vec::new();
        if tokio::fs::metadata(&base).await.is_err() {
            return Ok(out);
        }

        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if let Some(meta) = Self::meta_for(&base, &path).await? {
                        out.push(meta);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, prefix: &str, path: &str) -> StorageResult<()> {
        let target = self.path_for(prefix, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(StorageError::Rejected {
                    path: path.to_string(),
                    operation: "delete",
                    message: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let count = self.list(prefix).await?.len();
        let base = self.prefix_dir(prefix)?;
        match tokio::fs::remove_dir_all(&base).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Adds a per-call timeout and retry on transient failures
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    timeout: Duration,
    retry: RetryConfig,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            inner,
            timeout,
            retry,
        }
    }

    pub fn from_config(inner: Arc<dyn ObjectStore>, config: &StorageConfig) -> Self {
        Self::new(inner, config.operation_timeout, config.retry.clone())
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> StorageResult<T>
    where
        F: FnMut(Arc<dyn ObjectStore>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let timeout = self.timeout;
        retry_async(
            &self.retry,
            || {
                let attempt = f(Arc::clone(&self.inner));
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => {
                            debug!("Storage {} exceeded {:?}", operation, timeout);
                            Err(StorageError::Timeout { operation, timeout })
                        }
                    }
                }
            },
            storage_classifier,
        )
        .await
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    async fn put(&self, prefix: &str, path: &str, data: Bytes) -> StorageResult<ObjectMeta> {
        self.call("put", |store| {
            let data = data.clone();
            async move { store.put(prefix, path, data).await }
        })
        .await
    }

    async fn get(&self, prefix: &str, path: &str) -> StorageResult<Bytes> {
        self.call("get", |store| async move { store.get(prefix, path).await })
            .await
    }

    async fn exists(&self, prefix: &str, path: &str) -> StorageResult<bool> {
        self.call("exists", |store| async move { store.exists(prefix, path).await })
            .await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        self.call("list", |store| async move { store.list(prefix).await })
            .await
    }

    async fn delete(&self, prefix: &str, path: &str) -> StorageResult<()> {
        self.call("delete", |store| async move { store.delete(prefix, path).await })
            .await
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        self.call("delete_prefix", |store| async move {
            store.delete_prefix(prefix).await
        })
        .await
    }
}

pub mod mock {
    //! In-memory object store with failure injection

    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct StoredObject {
        data: Bytes,
        modified: DateTime<Utc>,
    }

    #[derive(Default)]
    struct Inner {
        objects: BTreeMap<(String, String), StoredObject>,
        locked: BTreeSet<String>,
        unavailable: bool,
        transient_failures: usize,
    }

    /// Mock object store
    #[derive(Default)]
    pub struct MockObjectStore {
        inner: Mutex<Inner>,
        puts: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl MockObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Writes and deletes of `path` fail with `Rejected`
        pub fn lock_path(&self, path: &str) {
            self.inner.lock().unwrap().locked.insert(path.to_string());
        }

        /// Every call fails with a transient error until cleared
        pub fn set_unavailable(&self, unavailable: bool) {
            self.inner.lock().unwrap().unavailable = unavailable;
        }

        /// The next `count` calls fail with a transient error
        pub fn fail_next(&self, count: usize) {
            self.inner.lock().unwrap().transient_failures = count;
        }

        /// Insert an object directly, bypassing counters
        pub fn seed(&self, prefix: &str, path: &str, data: &[u8], modified: DateTime<Utc>) {
            self.inner.lock().unwrap().objects.insert(
                (prefix.to_string(), path.to_string()),
                StoredObject {
                    data: Bytes::copy_from_slice(data),
                    modified,
                },
            );
        }

        pub fn contents(&self, prefix: &str, path: &str) -> Option<Bytes> {
            self.inner
                .lock()
                .unwrap()
                .objects
                .get(&(prefix.to_string(), path.to_string()))
                .map(|o| o.data.clone())
        }

        pub fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }

        pub fn delete_count(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }

        fn check_available(inner: &mut Inner) -> StorageResult<()> {
            if inner.unavailable {
                return Err(StorageError::Transient {
                    message: "mock storage unavailable".to_string(),
                });
            }
            if inner.transient_failures > 0 {
                inner.transient_failures -= 1;
                return Err(StorageError::Transient {
                    message: "mock transient failure".to_string(),
                });
            }
            Ok(())
        }

        fn check_locked(inner: &Inner, path: &str, operation: &'static str) -> StorageResult<()> {
            if inner.locked.contains(path) {
                return Err(StorageError::Rejected {
                    path: path.to_string(),
                    operation,
                    message: "object is locked".to_string(),
                });
            }
            Ok(())
        }

        fn meta(path: &str, object: &StoredObject) -> ObjectMeta {
            ObjectMeta {
                path: path.to_string(),
                hash: content_hash(&object.data),
                size: object.data.len() as u64,
                modified: object.modified,
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MockObjectStore {
        async fn put(&self, prefix: &str, path: &str, data: Bytes) -> StorageResult<ObjectMeta> {
            validate_key(path)?;
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            Self::check_locked(&inner, path, "put")?;
            let object = StoredObject {
                data,
                modified: Utc::now(),
            };
            let meta = Self::meta(path, &object);
            inner
                .objects
                .insert((prefix.to_string(), path.to_string()), object);
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(meta)
        }

        async fn get(&self, prefix: &str, path: &str) -> StorageResult<Bytes> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            inner
                .objects
                .get(&(prefix.to_string(), path.to_string()))
                .map(|o| o.data.clone())
                .ok_or_else(|| StorageError::NotFound {
                    prefix: prefix.to_string(),
                    path: path.to_string(),
                })
        }

        async fn exists(&self, prefix: &str, path: &str) -> StorageResult<bool> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            Ok(inner
                .objects
                .contains_key(&(prefix.to_string(), path.to_string())))
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            Ok(inner
                .objects
                .iter()
                .filter(|((p, _), _)| p == prefix)
                .map(|((_, path), object)| Self::meta(path, object))
                .collect())
        }

        async fn delete(&self, prefix: &str, path: &str) -> StorageResult<()> {
            let mut inner = self.inner.lock().unwrap();
            Self::check_available(&mut inner)?;
            Self::check_locked(&inner, path, "delete")?;
            if inner
                .objects
                .remove(&(prefix.to_string(), path.to_string()))
                .is_some()
            {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
