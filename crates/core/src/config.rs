//! Manager configuration
//!
//! [`ManagerConfig`] is read from an optional TOML file, then overridden by
//! `CRADLE_*` environment variables, then validated. Every field has a default
//! so an empty file (or no file) yields a working local setup.

use crate::errors::{ConfigError, CradleError, Result};
use crate::retry::RetryConfig;
use crate::runtime::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Serde adapter storing a [`Duration`] as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Top-level configuration for the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub runtime: RuntimeConfig,
    /// Where application records are persisted
    pub state_dir: PathBuf,
    /// Host directory holding one bind-mounted workspace per application
    pub workspace_root: PathBuf,
    pub storage: StorageConfig,
    pub logs: LogConfig,
    pub lsp: LspConfig,
}

/// Container runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    /// Override for the runtime CLI binary
    pub binary: Option<String>,
    /// Mount point of the workspace inside every container
    pub container_workspace: String,
    /// Network containers join; each gets its app id as alias
    pub network: Option<String>,
    #[serde(with = "duration_ms", rename = "start_timeout_ms")]
    pub start_timeout: Duration,
    #[serde(with = "duration_ms", rename = "readiness_interval_ms")]
    pub readiness_interval: Duration,
    /// Grace period handed to the runtime's stop command
    pub stop_timeout_secs: u32,
}

/// Object storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem-backed object store
    pub root: PathBuf,
    #[serde(with = "duration_ms", rename = "operation_timeout_ms")]
    pub operation_timeout: Duration,
    pub retry: RetryConfig,
}

/// Log multiplexer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Entries retained per application for replay
    pub buffer_capacity: usize,
    /// Live entries queued per subscriber before it starts dropping
    pub subscriber_capacity: usize,
}

/// Language server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Command run inside the container, speaking LSP on stdio
    pub command: Vec<String>,
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    /// Bytes read from the server per relay chunk
    pub chunk_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            binary: None,
            container_workspace: "/workspace".to_string(),
            network: None,
            start_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_millis(250),
            stop_timeout_secs: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("objects"),
            operation_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            subscriber_capacity: 256,
        }
    }
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "typescript-language-server".to_string(),
                "--stdio".to_string(),
            ],
            idle_timeout: Duration::from_secs(600),
            chunk_size: 16 * 1024,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            runtime: RuntimeConfig::default(),
            state_dir: data_dir.join("state"),
            workspace_root: data_dir.join("workspaces"),
            storage: StorageConfig::default(),
            logs: LogConfig::default(),
            lsp: LspConfig::default(),
        }
    }
}

/// Platform data directory, falling back to the temp dir
fn default_data_dir() -> PathBuf {
    directories_next::ProjectDirs::from("", "", "cradle")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("cradle"))
}

impl ManagerConfig {
    /// Load configuration from `path` (if any), apply environment overrides, validate
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config = toml::from_str(&raw).map_err(|e| ConfigError::Parsing {
            message: format!("{}: {}", path.display(), e),
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Root every directory under `root`; used by tests and the CLI's `--data-dir`
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            state_dir: root.join("state"),
            workspace_root: root.join("workspaces"),
            storage: StorageConfig {
                root: root.join("objects"),
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    /// Apply `CRADLE_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("CRADLE_RUNTIME") {
            self.runtime.kind = kind.parse()?;
        }
        if let Some(binary) = lookup("CRADLE_RUNTIME_PATH") {
            self.runtime.binary = Some(binary);
        }
        if let Some(network) = lookup("CRADLE_NETWORK") {
            self.runtime.network = Some(network);
        }
        if let Some(dir) = lookup("CRADLE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CRADLE_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CRADLE_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Reject values that would make the manager hang or drop everything
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> CradleError {
            ConfigError::Validation {
                message: message.to_string(),
            }
            .into()
        };
        if self.runtime.start_timeout.is_zero() {
            return Err(invalid("runtime.start_timeout_ms must be greater than zero"));
        }
        if self.runtime.readiness_interval.is_zero() {
            return Err(invalid(
                "runtime.readiness_interval_ms must be greater than zero",
            ));
        }
        if !self.runtime.container_workspace.starts_with('/') {
            return Err(invalid("runtime.container_workspace must be an absolute path"));
        }
        if self.storage.operation_timeout.is_zero() {
            return Err(invalid("storage.operation_timeout_ms must be greater than zero"));
        }
        if self.logs.buffer_capacity == 0 || self.logs.subscriber_capacity == 0 {
            return Err(invalid("log capacities must be greater than zero"));
        }
        if self.lsp.command.is_empty() {
            return Err(invalid("lsp.command must not be empty"));
        }
        if self.lsp.idle_timeout.is_zero() || self.lsp.chunk_size == 0 {
            return Err(invalid("lsp idle timeout and chunk size must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.container_workspace, "/workspace");
        assert_eq!(config.logs.buffer_capacity, 1000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ManagerConfig = toml::from_str(
            r#"
            state_dir = "/var/lib/cradle/state"

            [runtime]
            kind = "podman"
            start_timeout_ms = 5000

            [logs]
            buffer_capacity = 50

            [lsp]
            command = ["pyright-langserver", "--stdio"]
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/cradle/state"));
        assert_eq!(config.runtime.kind, RuntimeKind::Podman);
        assert_eq!(config.runtime.start_timeout, Duration::from_secs(5));
        assert_eq!(config.runtime.stop_timeout_secs, 10);
        assert_eq!(config.logs.buffer_capacity, 50);
        assert_eq!(config.logs.subscriber_capacity, 256);
        assert_eq!(config.lsp.command[0], "pyright-langserver");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CRADLE_RUNTIME", "podman"),
            ("CRADLE_STORAGE_ROOT", "/srv/objects"),
            ("CRADLE_NETWORK", "apps"),
        ]
        .into_iter()
        .collect();
        let mut config = ManagerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime.kind, RuntimeKind::Podman);
        assert_eq!(config.storage.root, PathBuf::from("/srv/objects"));
        assert_eq!(config.runtime.network.as_deref(), Some("apps"));
    }

    #[test]
    fn test_unknown_runtime_override_is_rejected() {
        let mut config = ManagerConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "CRADLE_RUNTIME").then(|| "lxc".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let mut config = ManagerConfig::default();
        config.logs.buffer_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(CradleError::Config(ConfigError::Validation { .. }))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cradle.toml");
        std::fs::write(&path, "[storage]\noperation_timeout_ms = 2000\n").unwrap();
        let config = ManagerConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.operation_timeout, Duration::from_secs(2));

        std::fs::write(&path, "[storage\n").unwrap();
        assert!(ManagerConfig::from_file(&path).is_err());
    }
}
