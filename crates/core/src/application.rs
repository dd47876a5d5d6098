//! Application records and the value types shared between components
//!
//! The lifecycle manager owns [`Application`]; every other component receives
//! an [`AppContext`] snapshot and returns results instead of mutating records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque application identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Allocate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Creating,
    Running,
    Stopped,
    Deleting,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }

    /// Statuses from which `start` may proceed
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last dependency manifest the resolver acted on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredManifest {
    /// Workspace-relative manifest path (`package.json`, `requirements.txt`)
    pub path: String,
    /// SHA-256 of the manifest content
    pub hash: String,
    /// Package name → version constraint
    pub packages: BTreeMap<String, String>,
}

/// Authoritative per-application record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: AppId,
    pub user_id: String,
    pub name: String,
    pub image: String,
    pub status: AppStatus,
    pub container_id: Option<String>,
    /// Durable root of the application's files in object storage
    pub storage_prefix: String,
    pub manifest: Option<DeclaredManifest>,
    /// Caller-supplied environment, without the system-injected variables
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_started_at: Option<DateTime<Utc>>,
    /// Last failure that moved the app to `error`
    pub last_error: Option<String>,
}

impl Application {
    pub fn new(
        app_id: AppId,
        user_id: &str,
        name: &str,
        image: &str,
        env: BTreeMap<String, String>,
    ) -> Self {
        let storage_prefix = format!("{}/{}", user_id, app_id);
        Self {
            app_id,
            user_id: user_id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            status: AppStatus::Creating,
            container_id: None,
            storage_prefix,
            manifest: None,
            env,
            created_at: Utc::now(),
            last_started_at: None,
            last_error: None,
        }
    }

    /// Update status and container reference in one step
    pub fn transition(&mut self, status: AppStatus, container_id: Option<String>) {
        self.status = status;
        self.container_id = container_id;
        if status != AppStatus::Error {
            self.last_error = None;
        }
    }

    /// Read-only view handed to other components
    pub fn context(&self) -> AppContext {
        AppContext {
            app_id: self.app_id.clone(),
            container_id: self.container_id.clone(),
            storage_prefix: self.storage_prefix.clone(),
        }
    }
}

/// Immutable snapshot of the fields components need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppContext {
    pub app_id: AppId,
    pub container_id: Option<String>,
    pub storage_prefix: String,
}

/// Which side of a sync a file currently exists on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    ContainerOnly,
    StorageOnly,
    Both,
}

/// File as observed on one or both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub location: Location,
}

/// Log source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One buffered log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic per container start, beginning at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub payload: Vec<u8>,
}
