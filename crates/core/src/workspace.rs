//! Per-application workspace directories
//!
//! Each application's container bind-mounts `<workspace_root>/<appId>`, so the
//! container's working directory is readable and writable from the host. The
//! sync engine treats this directory as the container side of reconciliation.

use crate::application::AppId;
use crate::errors::SyncError;
use crate::storage::{content_hash, ObjectMeta};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directories never synchronized (installed dependencies, caches)
pub const IGNORED_DIRS: &[&str] = &["node_modules", "__pycache__", ".venv"];

type WorkspaceResult<T> = std::result::Result<T, SyncError>;

/// Validate a workspace-relative path and return it in canonical form
pub fn normalize_path(path: &str) -> WorkspaceResult<String> {
    let invalid = |reason: &str| SyncError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(invalid("path is empty"));
    }
    if trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(invalid("path must be relative"));
    }
    let segments: Vec<&str> = trimmed
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return Err(invalid("path names the workspace root"));
    }
    if segments.contains(&"..") {
        return Err(invalid("path escapes the workspace"));
    }
    if segments.iter().any(|s| IGNORED_DIRS.contains(s)) {
        return Err(invalid("path is inside an unsynchronized directory"));
    }
    Ok(segments.join("/"))
}

fn io_error(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Workspace {
        path: path.display().to_string(),
        source,
    }
}

/// Root holding every application's workspace directory
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Host directory mounted into the application's container
    pub fn dir(&self, app_id: &AppId) -> PathBuf {
        self.root.join(app_id.as_str())
    }

    pub async fn ensure(&self, app_id: &AppId) -> WorkspaceResult<PathBuf> {
        let dir = self.dir(app_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        Ok(dir)
    }

    pub async fn remove(&self, app_id: &AppId) -> WorkspaceResult<()> {
        let dir = self.dir(app_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir, e)),
        }
    }

    /// True when the workspace has no synchronized files
    pub async fn is_empty(&self, app_id: &AppId) -> WorkspaceResult<bool> {
        Ok(self.list(app_id).await?.is_empty())
    }

    /// Every synchronized file, ordered by path
    pub async fn list(&self, app_id: &AppId) -> WorkspaceResult<Vec<ObjectMeta>> {
        let base = self.dir(app_id);
        let mut out = Vec::new();
        if tokio::fs::metadata(&base).await.is_err() {
            return Ok(out);
        }

        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                let name = entry.file_name();
                if file_type.is_dir() {
                    if !IGNORED_DIRS.contains(&name.to_string_lossy().as_ref()) {
                        stack.push(path);
                    }
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

    async fn meta_for(base: &Path, path: &Path) -> WorkspaceResult<Option<ObjectMeta>> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path, e)),
        };
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;
        let modified: DateTime<Utc> = metadata
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

    pub async fn stat(&self, app_id: &AppId, path: &str) -> WorkspaceResult<Option<ObjectMeta>> {
        let path = normalize_path(path)?;
        let base = self.dir(app_id);
        Self::meta_for(&base, &base.join(&path)).await
    }

    /// `None` when the file does not exist
    pub async fn read(&self, app_id: &AppId, path: &str) -> WorkspaceResult<Option<Bytes>> {
        let target = self.dir(app_id).join(normalize_path(path)?);
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&target, e)),
        }
    }

    pub async fn write(&self, app_id: &AppId, path: &str, data: &[u8]) -> WorkspaceResult<()> {
        let target = self.dir(app_id).join(normalize_path(path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&target, data)
            .await
            .map_err(|e| io_error(&target, e))?;
        debug!("Wrote {} bytes to {}", data.len(), target.display());
        Ok(())
    }

    /// Remove a file; returns whether it existed. Empty parent directories are pruned.
    pub async fn remove_file(&self, app_id: &AppId, path: &str) -> WorkspaceResult<bool> {
        let base = self.dir(app_id);
        let target = base.join(normalize_path(path)?);
        let existed = match tokio::fs::remove_file(&target).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_error(&target, e)),
        };
        let mut parent = target.parent().map(Path::to_path_buf);
        while let Some(dir) = parent {
            if dir == base || tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            parent = dir.parent().map(Path::to_path_buf);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("src/./main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_path("a//b").unwrap(), "a/b");
        for bad in ["", "/abs", "../up", "a/../../b", ".", "node_modules/x/index.js"] {
            assert!(normalize_path(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_write_list_remove() {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path().to_path_buf());
        let app = AppId::from("app1");
        assert!(workspace.is_empty(&app).await.unwrap());

        workspace.write(&app, "src/lib/util.js", b"x").await.unwrap();
        workspace.write(&app, "README.md", b"hi").await.unwrap();
        workspace
            .write(&app, "package.json", b"{}")
            .await
            .unwrap();
        tokio::fs::create_dir_all(workspace.dir(&app).join("node_modules/left-pad"))
            .await
            .unwrap();
        tokio::fs::write(workspace.dir(&app).join("node_modules/left-pad/index.js"), b"")
            .await
            .unwrap();

        let paths: Vec<String> = workspace
            .list(&app)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(paths, vec!["README.md", "package.json", "src/lib/util.js"]);

        assert!(workspace.remove_file(&app, "src/lib/util.js").await.unwrap());
        assert!(!workspace.remove_file(&app, "src/lib/util.js").await.unwrap());
        assert!(!workspace.dir(&app).join("src").exists());
        assert_eq!(
            workspace.read(&app, "README.md").await.unwrap().unwrap(),
            Bytes::from_static(b"hi")
        );
        assert!(workspace.read(&app, "missing").await.unwrap().is_none());
    }
}
