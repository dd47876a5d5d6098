//! Error types and handling
//!
//! Domain-specific error enums (runtime, storage, workspace sync, dependencies,
//! configuration) are wrapped by [`CradleError`], whose top-level variants form
//! the lifecycle manager's error taxonomy. Conditions that never fail an
//! operation (a sync conflict that was resolved, a final sync that failed while
//! stopping) are modelled as [`Warning`] values returned next to the result.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Container runtime errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or the daemon is unreachable
    #[error("Container runtime is not installed or not accessible")]
    NotInstalled,

    /// Runtime CLI returned an error
    #[error("Container runtime CLI error: {0}")]
    CLIError(String),

    /// Container does not exist
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// Container exists but is not running
    #[error("Container {id} is not running")]
    NotRunning { id: String },

    /// Runtime could not allocate resources for the container
    #[error("Container runtime cannot allocate resources: {0}")]
    Capacity(String),

    /// Image reference or container spec rejected before reaching the runtime
    #[error("Invalid container spec: {0}")]
    InvalidSpec(String),
}

/// Object storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object does not exist
    #[error("Object not found: {prefix}/{path}")]
    NotFound { prefix: String, path: String },

    /// Object key is empty, absolute, or escapes its prefix
    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    /// Transient backend failure (network blip, throttling)
    #[error("Transient storage failure: {message}")]
    Transient { message: String },

    /// Operation exceeded its time budget
    #[error("Storage {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Object is locked or otherwise refuses the operation
    #[error("Object {path} rejected {operation}: {message}")]
    Rejected {
        path: String,
        operation: &'static str,
        message: String,
    },

    /// Underlying I/O failure
    #[error("Storage I/O error")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the failure is worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Local workspace and reconciliation errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// Relative path failed validation
    #[error("Invalid workspace path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// File already exists where a create was requested
    #[error("File already exists: {path}")]
    AlreadyExists { path: String },

    /// File does not exist on either side
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// Workspace directory I/O failure
    #[error("Workspace I/O error on {path}")]
    Workspace {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Dependency manifest errors
#[derive(Error, Debug)]
pub enum DependencyError {
    /// Manifest could not be parsed
    #[error("Failed to parse {manifest}: {message}")]
    Parsing { manifest: String, message: String },

    /// Installed-package listing could not be parsed
    #[error("Failed to read installed packages: {message}")]
    Inventory { message: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration value rejected
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Main error enum for lifecycle manager operations
#[derive(Error, Debug)]
pub enum CradleError {
    /// Bad input; never retried
    #[error("Invalid spec: {message}")]
    InvalidSpec { message: String },

    /// Runtime capacity exhausted; caller retries with backoff
    #[error("Resource exhausted for application {app_id}: {message}")]
    ResourceExhausted { app_id: String, message: String },

    /// Container did not pass the readiness probe in time
    #[error("Application {app_id} did not become ready within {timeout:?}")]
    StartupTimeout { app_id: String, timeout: Duration },

    /// Container is not in the state the operation needs
    #[error("Container unavailable for application {app_id}: {message}")]
    ContainerUnavailable { app_id: String, message: String },

    /// Some items of a batch failed; the rest completed
    #[error("{operation} failed for {failed} of {total} items in application {app_id}")]
    PartialBatchFailure {
        app_id: String,
        operation: &'static str,
        failed: usize,
        total: usize,
    },

    /// Language server could not be started; the application is unaffected
    #[error("Language server unavailable for application {app_id}: {message}")]
    LspUnavailable { app_id: String, message: String },

    /// Identity expired or does not own the application
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Unknown application
    #[error("Application not found: {app_id}")]
    NotFound { app_id: String },

    /// Operation not allowed in the application's current status
    #[error("Application {app_id} cannot {operation} while {status}")]
    InvalidState {
        app_id: String,
        operation: &'static str,
        status: String,
    },

    /// Operation abandoned because the application was deleted
    #[error("{operation} cancelled for application {app_id}")]
    Cancelled {
        app_id: String,
        operation: &'static str,
    },

    /// Failure of an adapter call, annotated with the application and operation
    #[error("{operation} failed for application {app_id}: {source}")]
    Operation {
        app_id: String,
        operation: &'static str,
        #[source]
        source: Box<CradleError>,
    },

    /// Container runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Object storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Workspace sync errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Dependency manifest errors
    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State persistence errors
    #[error("State error: {message}")]
    State { message: String },
}

impl CradleError {
    /// Wrap an adapter failure with the application and operation it happened in.
    ///
    /// Taxonomy variants already carry an application id and are returned as-is.
    pub fn in_operation(self, app_id: &str, operation: &'static str) -> Self {
        match self {
            Self::Runtime(_) | Self::Storage(_) | Self::Sync(_) | Self::Dependency(_) => {
                Self::Operation {
                    app_id: app_id.to_string(),
                    operation,
                    source: Box::new(self),
                }
            }
            other => other,
        }
    }

    /// The innermost error, skipping `Operation` annotations
    pub fn root(&self) -> &CradleError {
        match self {
            Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Non-fatal conditions reported alongside a successful result
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Final container → storage sync failed while stopping; storage may be stale
    #[error("Final sync failed while stopping application {app_id}: {cause}")]
    SyncOnStopFailed { app_id: String, cause: String },

    /// A reconciliation conflict was resolved automatically
    #[error("Sync conflict on {path} in application {app_id} resolved: {resolution}")]
    SyncConflictResolved {
        app_id: String,
        path: String,
        resolution: String,
    },
}

/// Convenience type alias for Results with CradleError
pub type Result<T> = std::result::Result<T, CradleError>;
