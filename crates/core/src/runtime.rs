//! Container runtime abstraction
//!
//! [`ContainerRuntime`] is the contract the lifecycle manager needs from a
//! container engine. [`crate::docker::CliRuntime`] implements it over the
//! Docker/Podman CLI; [`mock::MockRuntime`] implements it in memory for tests.

use crate::application::LogStream;
use crate::config::RuntimeConfig;
use crate::docker::CliRuntime;
use crate::errors::{CradleError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Label carrying the owning application id
pub const LABEL_APP_ID: &str = "cradle.app-id";
/// Label carrying the owning user id
pub const LABEL_USER_ID: &str = "cradle.user-id";

/// Bind mount from the host into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
    /// Overrides the image's default command
    pub command: Option<Vec<String>>,
}

/// Observed container state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Engine state string (`created`, `running`, `exited`, ...)
    pub state: String,
    pub running: bool,
    /// Mount destinations inside the container
    pub mounts: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Result of a one-shot command in a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One line from a container's log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

/// Lazy, non-restartable log stream; ends when the container stops
pub type LogLines = BoxStream<'static, Result<LogLine>>;

/// Termination handle for an interactive process
#[async_trait]
pub trait ProcessControl: Send {
    /// Kill the process; idempotent
    async fn kill(&mut self) -> Result<()>;
}

/// Interactive process attached to a container
pub struct ProcessHandle {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").finish_non_exhaustive()
    }
}

/// Container engine operations used by the lifecycle manager
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Name of this runtime (e.g. "docker", "podman", "mock")
    fn runtime_name(&self) -> &'static str;

    /// Health check for engine availability
    async fn ping(&self) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop with an optional grace period in seconds
    async fn stop_container(&self, id: &str, timeout_secs: Option<u32>) -> Result<()>;

    /// Remove a container; removing a missing container succeeds
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect a container; `None` when it does not exist
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>>;

    /// Run a command to completion in a running container
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult>;

    /// Follow the container's stdout/stderr
    async fn logs(&self, id: &str) -> Result<LogLines>;

    /// Start an interactive process with piped stdin/stdout
    async fn spawn(&self, id: &str, command: &[String]) -> Result<ProcessHandle>;
}

/// Runtime selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = CradleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(CradleError::InvalidSpec {
                message: format!("Unknown runtime: {}. Supported runtimes: docker, podman", s),
            }),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds the configured runtime
pub struct RuntimeFactory;

impl RuntimeFactory {
    pub fn create(config: &RuntimeConfig) -> Arc<dyn ContainerRuntime> {
        let runtime = match (&config.binary, config.kind) {
            (Some(binary), kind) => CliRuntime::with_runtime_path(binary.clone(), kind),
            (None, RuntimeKind::Docker) => CliRuntime::docker(),
            (None, RuntimeKind::Podman) => CliRuntime::podman(),
        };
        Arc::new(runtime)
    }
}

pub mod mock {
    //! In-memory container runtime for tests
    //!
    //! Containers are records with a state string. Exec responses are looked up
    //! by the space-joined command. Spawned processes are echo servers over
    //! in-memory pipes, and the number still alive is tracked so tests can
    //! assert single-session invariants.

    use super::*;
    use crate::errors::RuntimeError;
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tracing::debug;

    /// Canned response for an exec command
    #[derive(Debug, Clone, Default)]
    pub struct MockExecResponse {
        pub exit_code: i32,
        pub stdout: String,
        pub stderr: String,
        pub delay: Option<Duration>,
    }

    impl MockExecResponse {
        pub fn ok(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                ..Self::default()
            }
        }

        pub fn failed(exit_code: i32, stderr: &str) -> Self {
            Self {
                exit_code,
                stderr: stderr.to_string(),
                ..Self::default()
            }
        }
    }

    /// Failure injection switches
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntimeConfig {
        /// `create_container` fails with `Capacity`
        pub exhausted: bool,
        /// `start_container` succeeds but the container never reports running
        pub never_running: bool,
        /// `spawn` fails
        pub spawn_fails: bool,
        pub default_exec_response: MockExecResponse,
        pub exec_responses: HashMap<String, MockExecResponse>,
    }

    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub id: String,
        pub spec: ContainerSpec,
        pub state: String,
    }

    #[derive(Default)]
    struct Inner {
        containers: HashMap<String, MockContainer>,
        log_senders: HashMap<String, mpsc::UnboundedSender<LogLine>>,
        exec_history: Vec<(String, Vec<String>)>,
        next_id: u64,
    }

    /// Mock runtime
    #[derive(Default)]
    pub struct MockRuntime {
        config: Mutex<MockRuntimeConfig>,
        inner: Mutex<Inner>,
        live_processes: Arc<AtomicUsize>,
        spawned_processes: AtomicUsize,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_config(config: MockRuntimeConfig) -> Self {
            Self {
                config: Mutex::new(config),
                ..Self::default()
            }
        }

        pub fn update_config<F>(&self, f: F)
        where
            F: FnOnce(&mut MockRuntimeConfig),
        {
            let mut config = self.config.lock().unwrap();
            f(&mut config);
        }

        pub fn set_exec_response(&self, command: &str, response: MockExecResponse) {
            self.update_config(|c| {
                c.exec_responses.insert(command.to_string(), response);
            });
        }

        pub fn container(&self, id: &str) -> Option<MockContainer> {
            self.inner.lock().unwrap().containers.get(id).cloned()
        }

        pub fn container_count(&self) -> usize {
            self.inner.lock().unwrap().containers.len()
        }

        /// Running containers labelled with `app_id`
        pub fn running_for_app(&self, app_id: &str) -> usize {
            self.inner
                .lock()
                .unwrap()
                .containers
                .values()
                .filter(|c| {
                    c.state == "running"
                        && c.spec.labels.get(LABEL_APP_ID).map(String::as_str) == Some(app_id)
                })
                .count()
        }

        pub fn exec_history(&self) -> Vec<(String, Vec<String>)> {
            self.inner.lock().unwrap().exec_history.clone()
        }

        /// Interactive processes not yet killed
        pub fn live_processes(&self) -> usize {
            self.live_processes.load(Ordering::SeqCst)
        }

        /// Interactive processes ever spawned
        pub fn spawned_processes(&self) -> usize {
            self.spawned_processes.load(Ordering::SeqCst)
        }

        /// Push a log line to a running container's log stream
        pub fn emit_log(&self, id: &str, stream: LogStream, payload: &str) -> bool {
            let inner = self.inner.lock().unwrap();
            inner
                .log_senders
                .get(id)
                .map(|tx| {
                    tx.send(LogLine {
                        stream,
                        timestamp: Some(Utc::now()),
                        payload: payload.as_bytes().to_vec(),
                    })
                    .is_ok()
                })
                .unwrap_or(false)
        }

        /// Simulate the container process dying
        pub fn crash(&self, id: &str) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(container) = inner.containers.get_mut(id) {
                container.state = "exited".to_string();
            }
            inner.log_senders.remove(id);
        }

        fn running_check(inner: &Inner, id: &str) -> Result<()> {
            match inner.containers.get(id) {
                None => Err(RuntimeError::ContainerNotFound { id: id.to_string() }.into()),
                Some(c) if c.state != "running" => {
                    Err(RuntimeError::NotRunning { id: id.to_string() }.into())
                }
                Some(_) => Ok(()),
            }
        }
    }

    struct MockProcessControl {
        live: Arc<AtomicUsize>,
        server: Option<tokio::task::JoinHandle<()>>,
    }

    impl MockProcessControl {
        fn release(&mut self) {
            if let Some(server) = self.server.take() {
                server.abort();
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl ProcessControl for MockProcessControl {
        async fn kill(&mut self) -> Result<()> {
            self.release();
            Ok(())
        }
    }

    impl Drop for MockProcessControl {
        fn drop(&mut self) {
            self.release();
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        fn runtime_name(&self) -> &'static str {
            "mock"
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            if self.config.lock().unwrap().exhausted {
                return Err(RuntimeError::Capacity("mock host is full".to_string()).into());
            }
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = format!("mock-{}", inner.next_id);
            inner.containers.insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    state: "created".to_string(),
                },
            );
            debug!("MockRuntime created container {}", id);
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            let never_running = self.config.lock().unwrap().never_running;
            let mut inner = self.inner.lock().unwrap();
            let container = inner
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() })?;
            if never_running {
                container.state = "restarting".to_string();
                return Ok(());
            }
            container.state = "running".to_string();
            let (tx, _rx) = mpsc::unbounded_channel();
            inner.log_senders.insert(id.to_string(), tx);
            Ok(())
        }

        async fn stop_container(&self, id: &str, _timeout_secs: Option<u32>) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            let container = inner
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() })?;
            container.state = "exited".to_string();
            inner.log_senders.remove(id);
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.containers.remove(id);
            inner.log_senders.remove(id);
            Ok(())
        }

        async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
            let inner = self.inner.lock().unwrap();
            Ok(inner.containers.get(id).map(|c| ContainerInfo {
                id: c.id.clone(),
                state: c.state.clone(),
                running: c.state == "running",
                mounts: c.spec.mounts.iter().map(|m| m.target.clone()).collect(),
                labels: c.spec.labels.clone(),
            }))
        }

        async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult> {
            let response = {
                let mut inner = self.inner.lock().unwrap();
                Self::running_check(&inner, id)?;
                inner
                    .exec_history
                    .push((id.to_string(), command.to_vec()));
                let config = self.config.lock().unwrap();
                config
                    .exec_responses
                    .get(&command.join(" "))
                    .cloned()
                    .unwrap_or_else(|| config.default_exec_response.clone())
            };
            if let Some(delay) = response.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ExecResult {
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
            })
        }

        async fn logs(&self, id: &str) -> Result<LogLines> {
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut inner = self.inner.lock().unwrap();
                Self::running_check(&inner, id)?;
                inner.log_senders.insert(id.to_string(), tx);
            }
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|line| (Ok(line), rx))
            });
            Ok(stream.boxed())
        }

        async fn spawn(&self, id: &str, command: &[String]) -> Result<ProcessHandle> {
            {
                let inner = self.inner.lock().unwrap();
                Self::running_check(&inner, id)?;
            }
            if self.config.lock().unwrap().spawn_fails {
                return Err(RuntimeError::CLIError(format!(
                    "executable not found: {}",
                    command.first().map(String::as_str).unwrap_or("")
                ))
                .into());
            }

            let (client_in, mut server_in) = tokio::io::duplex(64 * 1024);
            let (mut server_out, client_out) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match server_in.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if server_out.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            self.live_processes.fetch_add(1, Ordering::SeqCst);
            self.spawned_processes.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessHandle {
                stdin: Box::new(client_in),
                stdout: Box::new(client_out),
                control: Box::new(MockProcessControl {
                    live: Arc::clone(&self.live_processes),
                    server: Some(server),
                }),
            })
        }
    }
}
