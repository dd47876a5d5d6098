//! Persistence of application records and sync baselines
//!
//! Layout under the state directory:
//!
//! - `apps/<appId>.json`: one [`Application`] record per file
//! - `sync/<appId>.json`: path → content hash at the last point both sides agreed
//!
//! Writes go to a temp file and are renamed into place. Unreadable or corrupt
//! files are logged and treated as missing so one bad record cannot block
//! startup.

use crate::application::{AppId, Application};
use crate::errors::{CradleError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Path → hash map recorded after each successful sync
pub type SyncBaseline = BTreeMap<String, String>;

fn state_error(action: &str, path: &Path, e: impl std::fmt::Display) -> CradleError {
    CradleError::State {
        message: format!("Failed to {} {}: {}", action, path.display(), e),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| state_error("create", parent, e))?;
    }
    let content =
        serde_json::to_string_pretty(value).map_err(|e| state_error("serialize", path, e))?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content).map_err(|e| state_error("write", &temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| state_error("rename", &temp_path, e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read {}: {}. Treating as missing.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "Failed to parse {}: {}. Treating as missing.",
                path.display(),
                e
            );
            None
        }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(state_error("remove", path, e)),
    }
}

/// JSON-file store rooted at the state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn app_path(&self, app_id: &AppId) -> PathBuf {
        self.root.join("apps").join(format!("{}.json", app_id))
    }

    fn baseline_path(&self, app_id: &AppId) -> PathBuf {
        self.root.join("sync").join(format!("{}.json", app_id))
    }

    #[instrument(skip_all, fields(app_id = %app.app_id, status = %app.status))]
    pub fn save_app(&self, app: &Application) -> Result<()> {
        write_json(&self.app_path(&app.app_id), app)?;
        debug!("Saved application record");
        Ok(())
    }

    pub fn load_app(&self, app_id: &AppId) -> Option<Application> {
        read_json(&self.app_path(app_id))
    }

    pub fn remove_app(&self, app_id: &AppId) -> Result<()> {
        remove_if_present(&self.app_path(app_id))?;
        remove_if_present(&self.baseline_path(app_id))
    }

    /// Every readable record, ordered by creation time
    #[instrument(skip(self))]
    pub fn load_all(&self) -> Result<Vec<Application>> {
        let dir = self.root.join("apps");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(state_error("read", &dir, e)),
        };
        let mut apps: Vec<Application> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| read_json(&path))
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!("Loaded {} application records", apps.len());
        Ok(apps)
    }

    pub fn load_baseline(&self, app_id: &AppId) -> SyncBaseline {
        read_json(&self.baseline_path(app_id)).unwrap_or_default()
    }

    pub fn save_baseline(&self, app_id: &AppId, baseline: &SyncBaseline) -> Result<()> {
        write_json(&self.baseline_path(app_id), baseline)
    }
}
