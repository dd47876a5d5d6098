//! Docker/Podman CLI runtime
//!
//! One-shot commands run through `std::process::Command` on the blocking pool;
//! log following and interactive processes use `tokio::process` so their pipes
//! can be read asynchronously.

use crate::application::LogStream;
use crate::errors::{Result, RuntimeError};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExecResult, LogLine, LogLines,
    ProcessControl, ProcessHandle, RuntimeKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::process::{Command, Output, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Validates an image reference: `[registry[:port]/][namespace/]name[:tag][@digest]`
pub fn validate_image_ref(image: &str) -> Result<()> {
    let invalid = |message: String| -> crate::errors::CradleError {
        RuntimeError::InvalidSpec(message).into()
    };

    if image.trim().is_empty() {
        return Err(invalid("image reference cannot be empty".to_string()));
    }

    let (name_part, digest) = match image.rsplit_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    if let Some(digest) = digest {
        if !digest.starts_with("sha256:") && !digest.starts_with("sha512:") {
            return Err(invalid(format!(
                "image digest '{}' must start with 'sha256:' or 'sha512:'",
                digest
            )));
        }
    }

    // A colon followed by a slash belongs to a registry port, not a tag
    let (name_section, tag) = match name_part.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (name_part, None),
    };

    if let Some(tag) = tag {
        if tag.is_empty() || tag.len() > 128 {
            return Err(invalid(format!(
                "image tag '{}' must be 1 to 128 characters",
                tag
            )));
        }
        if tag.starts_with('.') || tag.starts_with('-') {
            return Err(invalid(format!("image tag '{}' cannot start with '.' or '-'", tag)));
        }
        if let Some(ch) = tag
            .chars()
            .find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '-' | '_'))
        {
            return Err(invalid(format!(
                "image tag '{}' contains invalid character '{}'",
                tag, ch
            )));
        }
    }

    if name_section.is_empty() {
        return Err(invalid("image name cannot be empty".to_string()));
    }

    for (idx, part) in name_section.split('/').enumerate() {
        if part.is_empty() {
            return Err(invalid(format!(
                "image reference '{}' contains an empty component",
                image
            )));
        }
        if idx == 0 && (part.contains('.') || part.contains(':')) && name_section.contains('/') {
            continue;
        }
        if let Some(ch) = part.chars().find(|ch| {
            !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && !matches!(ch, '.' | '-' | '_')
        }) {
            return Err(invalid(format!(
                "image name component '{}' contains invalid character '{}'",
                part, ch
            )));
        }
        let edge = |c: Option<char>| matches!(c, Some('.' | '-' | '_'));
        if edge(part.chars().next()) || edge(part.chars().last()) {
            return Err(invalid(format!(
                "image name component '{}' cannot start or end with '.', '-' or '_'",
                part
            )));
        }
    }

    Ok(())
}

/// Environment variable names must be shell identifiers
pub fn validate_env_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidSpec(format!("invalid environment variable name '{}'", key)).into())
    }
}

/// Map a failed CLI invocation onto the runtime error taxonomy
fn classify_failure(action: &str, id: &str, stderr: &str) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") || lower.contains("no container with name or id") {
        RuntimeError::ContainerNotFound { id: id.to_string() }
    } else if lower.contains("is not running") {
        RuntimeError::NotRunning { id: id.to_string() }
    } else if lower.contains("no space left")
        || lower.contains("cannot allocate memory")
        || lower.contains("resources exhausted")
        || lower.contains("too many")
    {
        RuntimeError::Capacity(stderr.trim().to_string())
    } else if lower.contains("invalid reference format")
        || lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("no such image")
    {
        RuntimeError::InvalidSpec(stderr.trim().to_string())
    } else {
        RuntimeError::CLIError(format!("{} failed: {}", action, stderr.trim()))
    }
}

/// Parse a `--timestamps` log line into its timestamp and payload
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    match line.split_once(' ') {
        Some((ts, rest)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), rest),
            Err(_) => (None, line),
        },
        None => (None, line),
    }
}

/// Generic CLI-based container runtime
///
/// Docker and Podman share a compatible CLI, so one implementation serves both.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
    kind: RuntimeKind,
}

impl CliRuntime {
    pub fn docker() -> Self {
        Self {
            runtime_path: "docker".to_string(),
            kind: RuntimeKind::Docker,
        }
    }

    pub fn podman() -> Self {
        Self {
            runtime_path: "podman".to_string(),
            kind: RuntimeKind::Podman,
        }
    }

    /// Custom binary path speaking the `kind` CLI dialect
    pub fn with_runtime_path(runtime_path: String, kind: RuntimeKind) -> Self {
        Self { runtime_path, kind }
    }

    /// Run the CLI to completion on the blocking pool
    async fn output(&self, args: Vec<String>) -> Result<Output> {
        let runtime_path = self.runtime_path.clone();
        debug!("Executing runtime command: {} {}", runtime_path, args.join(" "));
        tokio::task::spawn_blocking(move || {
            Command::new(&runtime_path).args(&args).output().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::NotInstalled
                } else {
                    RuntimeError::CLIError(format!("Failed to execute runtime command: {}", e))
                }
            })
        })
        .await
        .map_err(|e| RuntimeError::CLIError(format!("Task join error: {}", e)))?
        .map_err(Into::into)
    }

    /// Run the CLI and fail on a non-zero exit
    async fn run(&self, action: &str, id: &str, args: Vec<String>) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(action, id, &stderr).into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Arguments for `create`, after validating the container spec
    fn create_args(spec: &ContainerSpec) -> Result<Vec<String>> {
        validate_image_ref(&spec.image)?;

        let mut args = vec!["create".to_string()];
        if !spec.name.is_empty() {
            args.push("--name".to_string());
            args.push(spec.name.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            validate_env_key(key)?;
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            if mount.target.contains(',') || mount.source.to_string_lossy().contains(',') {
                return Err(RuntimeError::InvalidSpec(format!(
                    "mount paths cannot contain ',': {}",
                    mount.target
                ))
                .into());
            }
            let mut value = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target
            );
            if mount.read_only {
                value.push_str(",readonly");
            }
            args.push("--mount".to_string());
            args.push(value);
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
            if let Some(alias) = &spec.network_alias {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        }
        args.push(spec.image.clone());
        if let Some(command) = &spec.command {
            args.extend(command.iter().cloned());
        }
        Ok(args)
    }

    fn parse_inspect(json_output: &str) -> Result<Option<ContainerInfo>> {
        let parsed: serde_json::Value = serde_json::from_str(json_output).map_err(|e| {
            RuntimeError::CLIError(format!("Failed to parse inspect output: {}", e))
        })?;
        let Some(container) = parsed.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };

        let id = container["Id"].as_str().unwrap_or_default().to_string();
        let state = container["State"]["Status"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let running = container["State"]["Running"].as_bool().unwrap_or(false);
        let mounts = container["Mounts"]
            .as_array()
            .map(|mounts| {
                mounts
                    .iter()
                    .filter_map(|m| m["Destination"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let labels: BTreeMap<String, String> = container["Config"]["Labels"]
            .as_object()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(ContainerInfo {
            id,
            state,
            running,
            mounts,
            labels,
        }))
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

/// Kills an interactive `exec` client
struct ChildControl {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn kill(&mut self) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| RuntimeError::CLIError(format!("Failed to kill process: {}", e)).into())
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn runtime_name(&self) -> &'static str {
        self.kind.as_str()
    }

    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        let args = ["version", "--format", "json"].map(String::from).to_vec();
        self.run("ping", "", args).await.map(|_| ())
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let args = Self::create_args(spec)?;
        let stdout = self.run("create", &spec.name, args).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::CLIError("create returned no container id".to_string()).into());
        }
        debug!("Created container {}", id);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.run("start", id, vec!["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str, timeout_secs: Option<u32>) -> Result<()> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout_secs {
            args.push("-t".to_string());
            args.push(timeout.to_string());
        }
        args.push(id.to_string());
        self.run("stop", id, args).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.run("remove", id, args).await {
            Err(crate::errors::CradleError::Runtime(RuntimeError::ContainerNotFound { .. })) => {
                debug!("Container {} already removed", id);
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let output = self
            .output(vec!["inspect".to_string(), id.to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match classify_failure("inspect", id, &stderr) {
                RuntimeError::ContainerNotFound { .. } => Ok(None),
                other => Err(other.into()),
            };
        }
        Self::parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    #[instrument(skip(self))]
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(command.iter().cloned());
        let output = self.output(args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // The CLI itself exits 125+ when it could not run the command at all
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code >= 125 || exit_code < 0 {
            if let err @ (RuntimeError::ContainerNotFound { .. } | RuntimeError::NotRunning { .. }) =
                classify_failure("exec", id, &stderr)
            {
                return Err(err.into());
            }
        }
        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    #[instrument(skip(self))]
    async fn logs(&self, id: &str) -> Result<LogLines> {
        let mut child = tokio::process::Command::new(&self.runtime_path)
            .args(["logs", "--follow", "--timestamps", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::CLIError(format!("Failed to follow logs: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RuntimeError::CLIError("log pipes unavailable".to_string()).into());
        };

        let (tx, rx) = mpsc::channel::<LogLine>(256);
        let container = id.to_string();
        tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_open, mut err_open) = (true, true);
            while out_open || err_open {
                let (stream, next) = tokio::select! {
                    line = out.next_line(), if out_open => (LogStream::Stdout, line),
                    line = err.next_line(), if err_open => (LogStream::Stderr, line),
                };
                match next {
                    Ok(Some(line)) => {
                        let (timestamp, payload) = split_timestamp(&line);
                        let entry = LogLine {
                            stream,
                            timestamp,
                            payload: payload.as_bytes().to_vec(),
                        };
                        if tx.send(entry).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => match stream {
                        LogStream::Stdout => out_open = false,
                        LogStream::Stderr => err_open = false,
                    },
                    Err(e) => {
                        warn!("Log stream for {} failed: {}", container, e);
                        break;
                    }
                }
            }
            // Dropping the child kills `logs --follow` if the reader went away first
            drop(child);
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (Ok(line), rx))
        });
        Ok(stream.boxed())
    }

    #[instrument(skip(self))]
    async fn spawn(&self, id: &str, command: &[String]) -> Result<ProcessHandle> {
        let mut child = tokio::process::Command::new(&self.runtime_path)
            .arg("exec")
            .arg("-i")
            .arg(id)
            .args(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::CLIError(format!("Failed to spawn process: {}", e)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::CLIError("process pipes unavailable".to_string()).into());
        };

        Ok(ProcessHandle {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Box::new(ChildControl { child }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MountSpec;
    use std::path::PathBuf;

    #[test]
    fn test_validate_image_ref() {
        for valid in [
            "node:20",
            "python:3.12-slim",
            "ghcr.io/acme/app:v1.2",
            "localhost:5000/app",
            "alpine@sha256:abc",
        ] {
            assert!(validate_image_ref(valid).is_ok(), "{}", valid);
        }
        for invalid in ["", "Node:20", "app:", "app:-x", "a//b", "_app", "alpine@md5:abc"] {
            assert!(validate_image_ref(invalid).is_err(), "{}", invalid);
        }
    }

    #[test]
    fn test_validate_env_key() {
        assert!(validate_env_key("CRADLE_APP_ID").is_ok());
        assert!(validate_env_key("_x1").is_ok());
        assert!(validate_env_key("1X").is_err());
        assert!(validate_env_key("A-B").is_err());
        assert!(validate_env_key("").is_err());
    }

    #[test]
    fn test_create_args() {
        let spec = ContainerSpec {
            name: "cradle-app1".to_string(),
            image: "node:20".to_string(),
            env: [("PORT".to_string(), "3000".to_string())].into_iter().collect(),
            mounts: vec![MountSpec {
                source: PathBuf::from("/data/ws/app1"),
                target: "/workspace".to_string(),
                read_only: false,
            }],
            labels: [("cradle.app-id".to_string(), "app1".to_string())]
                .into_iter()
                .collect(),
            network: Some("apps".to_string()),
            network_alias: Some("app1".to_string()),
            command: None,
        };
        let args = CliRuntime::create_args(&spec).unwrap();
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w == ["--env", "PORT=3000"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--mount", "type=bind,source=/data/ws/app1,target=/workspace"]));
        assert!(args.windows(2).any(|w| w == ["--network-alias", "app1"]));
        assert_eq!(args.last().map(String::as_str), Some("node:20"));
    }

    #[test]
    fn test_create_args_rejects_bad_env() {
        let spec = ContainerSpec {
            image: "node:20".to_string(),
            env: [("BAD-KEY".to_string(), "1".to_string())].into_iter().collect(),
            ..ContainerSpec::default()
        };
        assert!(CliRuntime::create_args(&spec).is_err());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("stop", "c1", "Error: No such container: c1"),
            RuntimeError::ContainerNotFound { .. }
        ));
        assert!(matches!(
            classify_failure("create", "c1", "no space left on device"),
            RuntimeError::Capacity(_)
        ));
        assert!(matches!(
            classify_failure("exec", "c1", "Container c1 is not running"),
            RuntimeError::NotRunning { .. }
        ));
        assert!(matches!(
            classify_failure("start", "c1", "boom"),
            RuntimeError::CLIError(_)
        ));
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"[{
            "Id": "abc123",
            "State": {"Status": "running", "Running": true},
            "Mounts": [{"Destination": "/workspace"}],
            "Config": {"Labels": {"cradle.app-id": "app1"}}
        }]"#;
        let info = CliRuntime::parse_inspect(json).unwrap().unwrap();
        assert_eq!(info.id, "abc123");
        assert!(info.running);
        assert_eq!(info.mounts, vec!["/workspace".to_string()]);
        assert_eq!(info.labels.get("cradle.app-id").map(String::as_str), Some("app1"));
        assert!(CliRuntime::parse_inspect("[]").unwrap().is_none());
    }

    #[test]
    fn test_split_timestamp() {
        let (ts, payload) = split_timestamp("2024-05-01T10:00:00.123456789Z listening on 3000");
        assert!(ts.is_some());
        assert_eq!(payload, "listening on 3000");
        let (ts, payload) = split_timestamp("no timestamp here");
        assert!(ts.is_none());
        assert_eq!(payload, "no timestamp here");
    }
}
