use crate::commands::{self, Output};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cradle_core::application::AppId;
use cradle_core::auth::Identity;
use cradle_core::config::ManagerConfig;
use cradle_core::manager::Manager;
use std::path::{Path, PathBuf};

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for cradle_core::runtime::RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => cradle_core::runtime::RuntimeKind::Docker,
            RuntimeOption::Podman => cradle_core::runtime::RuntimeKind::Podman,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Parse `KEY=VALUE`
fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[derive(Parser, Debug)]
#[command(name = "cradle")]
#[command(about = "Manage per-application containers, their files, logs and language servers")]
#[command(version)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via CRADLE_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level (CRADLE_LOG or RUST_LOG take precedence when set)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Configuration file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Keep state, workspaces and objects under this directory
    #[arg(long, global = true, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Container runtime to use (overrides configuration)
    #[arg(long, global = true, value_enum)]
    pub runtime: Option<RuntimeOption>,

    /// User the commands act for
    #[arg(long, global = true, default_value = "local")]
    pub user: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an application and its (stopped) container
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: String,
        /// Environment variable for the container (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },
    /// Start an application and sync its workspace
    Start { app: String },
    /// Sync the workspace to storage and stop the container
    Stop { app: String },
    /// Stop then start
    Restart { app: String },
    /// Delete an application and its container
    Delete {
        app: String,
        /// Also delete the application's files from object storage
        #[arg(long)]
        purge_storage: bool,
    },
    /// Show one application (after a health check) or all of them
    Status { app: Option<String> },
    /// List applications
    List,
    /// Work with application files
    Files {
        #[command(subcommand)]
        command: FilesCommand,
    },
    /// Reconcile the workspace with object storage
    Sync { app: String },
    /// Install, upgrade and remove packages to match the manifest
    Deps {
        app: String,
        /// Resolve even when the manifest is unchanged
        #[arg(long)]
        force: bool,
        /// Only show requested and installed versions
        #[arg(long)]
        show: bool,
    },
    /// Print container logs
    Logs {
        app: String,
        /// First sequence number to print
        #[arg(long, default_value_t = 1)]
        from: u64,
        /// Keep printing new entries until the container stops
        #[arg(long)]
        follow: bool,
    },
    /// Relay stdin/stdout to the application's language server
    Lsp { app: String },
}

#[derive(Subcommand, Debug)]
pub enum FilesCommand {
    /// List files and where they live
    Ls { app: String },
    /// Print a file
    Read { app: String, path: String },
    /// Write a file from stdin or --from
    Write {
        app: String,
        path: String,
        #[arg(long, value_name = "PATH")]
        from: Option<PathBuf>,
    },
    /// Create a file; fails if it exists
    Create {
        app: String,
        path: String,
        #[arg(long, value_name = "PATH")]
        from: Option<PathBuf>,
    },
    /// Delete one or more files
    Rm {
        app: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Rename a file
    Mv { app: String, from: String, to: String },
}

impl Cli {
    /// Configuration after file, environment and flag overrides
    fn manager_config(&self) -> Result<ManagerConfig> {
        let mut config = ManagerConfig::load(self.config.as_deref())?;
        if let Some(root) = &self.data_dir {
            relocate(&mut config, root);
        }
        if let Some(runtime) = self.runtime {
            config.runtime.kind = runtime.into();
        }
        Ok(config)
    }

    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };
        cradle_core::logging::init(log_format, Some(self.log_level.as_str()))?;
        tracing::debug!("CLI initialized with log level: {}", self.log_level.as_str());

        let config = self.manager_config()?;
        let manager = Manager::open(config)
            .await
            .context("Failed to open the application store")?;
        let identity = Identity::local(&self.user);
        let out = Output::new(self.json);

        match self.command {
            Commands::Create { name, image, env } => {
                let env = env.into_iter().collect();
                let app = manager.create(&identity, &name, &image, env).await?;
                out.app(&app)
            }
            Commands::Start { app } => {
                let outcome = manager.start(&identity, &AppId::from(app)).await?;
                out.outcome(&outcome)
            }
            Commands::Stop { app } => {
                let outcome = manager.stop(&identity, &AppId::from(app)).await?;
                out.outcome(&outcome)
            }
            Commands::Restart { app } => {
                let outcome = manager.restart(&identity, &AppId::from(app)).await?;
                out.outcome(&outcome)
            }
            Commands::Delete { app, purge_storage } => {
                manager
                    .delete(&identity, &AppId::from(app.as_str()), purge_storage)
                    .await?;
                out.message(&serde_json::json!({ "deleted": app }), || {
                    format!("Deleted {}", app)
                })
            }
            Commands::Status { app: Some(app) } => {
                let app = manager.check_health(&identity, &AppId::from(app)).await?;
                out.app(&app)
            }
            Commands::Status { app: None } | Commands::List => {
                out.apps(&manager.list(&identity)?)
            }
            Commands::Files { command } => commands::files::execute(&manager, &identity, &out, command).await,
            Commands::Sync { app } => {
                let outcome = manager.sync(&identity, &AppId::from(app)).await?;
                out.outcome(&outcome)
            }
            Commands::Deps { app, force, show } => {
                commands::deps::execute(&manager, &identity, &out, AppId::from(app), force, show).await
            }
            Commands::Logs { app, from, follow } => {
                commands::logs::execute(&manager, &identity, &out, AppId::from(app), from, follow).await
            }
            Commands::Lsp { app } => commands::lsp::execute(&manager, &identity, AppId::from(app)).await,
        }
    }
}

/// Move every data directory under `root`
fn relocate(config: &mut ManagerConfig, root: &Path) {
    let rooted = ManagerConfig::rooted_at(root);
    config.state_dir = rooted.state_dir;
    config.workspace_root = rooted.workspace_root;
    config.storage.root = rooted.storage.root;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_env_pairs() {
        let cli = Cli::parse_from([
            "cradle", "create", "--name", "demo", "--image", "node:20", "--env", "A=1", "--env",
            "B=x=y",
        ]);
        match cli.command {
            Commands::Create { env, .. } => {
                assert_eq!(
                    env,
                    vec![
                        ("A".to_string(), "1".to_string()),
                        ("B".to_string(), "x=y".to_string())
                    ]
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(parse_env("NOVALUE").is_err());
    }

    #[test]
    fn test_data_dir_relocates_everything() {
        let mut config = ManagerConfig::default();
        relocate(&mut config, Path::new("/tmp/cradle-test"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/cradle-test/state"));
        assert_eq!(config.storage.root, PathBuf::from("/tmp/cradle-test/objects"));
        assert_eq!(
            config.workspace_root,
            PathBuf::from("/tmp/cradle-test/workspaces")
        );
    }
}
