//! Application lifecycle orchestration
//!
//! [`Manager`] is the only writer of application records. Every operation
//! validates the caller first, then takes the application's exclusion guard
//! from the [`AppRegistry`] before touching the runtime, the sync engine or the
//! record. Long-lived per-application work (log tail, LSP relay, dependency
//! installs, sync passes) is registered here so `stop` and `delete` can end it
//! deterministically.

use crate::application::{AppId, AppStatus, Application, FileEntry};
use crate::auth::Identity;
use crate::config::ManagerConfig;
use crate::deps::{DependencyResolver, DependencySet, Ecosystem, InstallReport};
use crate::docker::{validate_env_key, validate_image_ref};
use crate::errors::{CradleError, Result, RuntimeError, Warning};
use crate::logs::{LogMultiplexer, LogSubscription};
use crate::lsp::{LspBroker, LspClient, SessionInfo};
use crate::observability::{fields, lifecycle_span, spans, TimedSpan};
use crate::registry::{AppGuard, AppRegistry};
use crate::runtime::{
    ContainerRuntime, ContainerSpec, MountSpec, RuntimeFactory, LABEL_APP_ID, LABEL_USER_ID,
};
use crate::state::StateStore;
use crate::storage::{LocalObjectStore, ObjectStore, RetryingStore};
use crate::sync::{BatchReport, SyncEngine, SyncReport};
use crate::workspace::Workspace;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Environment variables injected into every container
pub const ENV_APP_ID: &str = "CRADLE_APP_ID";
pub const ENV_STORAGE_PREFIX: &str = "CRADLE_STORAGE_PREFIX";
pub const ENV_NETWORK_ALIAS: &str = "CRADLE_NETWORK_ALIAS";

const MAX_NAME_LEN: usize = 64;

/// Result of a lifecycle operation
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub app: Application,
    /// Sync pass run as part of the operation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    pub warnings: Vec<Warning>,
}

impl LifecycleOutcome {
    fn new(app: Application) -> Self {
        Self {
            app,
            sync: None,
            warnings: Vec::new(),
        }
    }

    fn with_sync(mut self, report: SyncReport) -> Self {
        self.warnings.extend(report.conflicts.iter().cloned());
        self.sync = Some(report);
        self
    }
}

/// Cancellation handles for one application's in-flight work
#[derive(Default)]
struct AppTasks {
    cancel: CancellationToken,
    installs: HashMap<u64, AbortHandle>,
}

/// Removes a created container unless it was handed to a committed record
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    fn disarm(mut self) -> String {
        self.id.take().unwrap_or_default()
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        warn!("Removing unregistered container {}", id);
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.remove_container(&id).await {
                        warn!("Failed to remove container {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No async runtime to remove container {}", id),
        }
    }
}

/// Map runtime failures onto the caller-facing taxonomy
fn runtime_failure(app_id: &AppId, operation: &'static str, error: CradleError) -> CradleError {
    match error {
        CradleError::Runtime(RuntimeError::Capacity(message)) => CradleError::ResourceExhausted {
            app_id: app_id.to_string(),
            message,
        },
        CradleError::Runtime(RuntimeError::InvalidSpec(message)) => {
            CradleError::InvalidSpec { message }
        }
        other => other.in_operation(app_id.as_str(), operation),
    }
}

fn validate_request(name: &str, image: &str, env: &BTreeMap<String, String>) -> Result<()> {
    let invalid = |message: String| CradleError::InvalidSpec { message };
    let name_ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '));
    if !name_ok {
        return Err(invalid(format!(
            "name '{}' must be 1-{} characters of letters, digits, space, '-', '_' or '.'",
            name, MAX_NAME_LEN
        )));
    }
    validate_image_ref(image).map_err(|e| match e {
        CradleError::Runtime(RuntimeError::InvalidSpec(message)) => invalid(message),
        other => other,
    })?;
    for key in env.keys() {
        validate_env_key(key).map_err(|_| invalid(format!("invalid environment variable '{}'", key)))?;
        if [ENV_APP_ID, ENV_STORAGE_PREFIX, ENV_NETWORK_ALIAS].contains(&key.as_str()) {
            return Err(invalid(format!("environment variable '{}' is reserved", key)));
        }
    }
    Ok(())
}

/// Orchestrates every component for all applications on one host
pub struct Manager {
    config: ManagerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    registry: AppRegistry,
    sync: SyncEngine,
    deps: Arc<DependencyResolver>,
    logs: LogMultiplexer,
    lsp: LspBroker,
    tasks: Mutex<HashMap<AppId, AppTasks>>,
    next_task: AtomicU64,
}

impl Manager {
    /// Manager over the configured runtime, a filesystem object store and persistent state
    pub async fn open(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = RuntimeFactory::create(&config.runtime);
        let local: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new(config.storage.root.clone()).await?);
        let store = Arc::new(RetryingStore::from_config(local, &config.storage));
        let state = StateStore::new(&config.state_dir);
        Self::with_components(config, runtime, store, Some(state))
    }

    /// Manager over explicit components; `state` = `None` keeps records in memory
    pub fn with_components(
        config: ManagerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ObjectStore>,
        state: Option<StateStore>,
    ) -> Result<Self> {
        let registry = match &state {
            Some(state) => AppRegistry::persistent(state.clone())?,
            None => AppRegistry::new(),
        };
        let workspace = Workspace::new(config.workspace_root.clone());
        let deps = DependencyResolver::new(
            Arc::clone(&runtime),
            workspace.clone(),
            &config.runtime.container_workspace,
        );
        Ok(Self {
            sync: SyncEngine::new(store, workspace, state),
            deps: Arc::new(deps),
            logs: LogMultiplexer::new(config.logs.clone()),
            lsp: LspBroker::new(Arc::clone(&runtime), config.lsp.clone()),
            registry,
            runtime,
            config,
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn cancel_token(&self, app_id: &AppId) -> CancellationToken {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.entry(app_id.clone()).or_default().cancel.clone()
    }

    /// Cancel sync passes and abort dependency installs without waiting for them
    fn cancel_tasks(&self, app_id: &AppId) {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_id);
        if let Some(tasks) = removed {
            tasks.cancel.cancel();
            for (_, install) in tasks.installs {
                install.abort();
            }
        }
    }

    fn track_install(&self, app_id: &AppId, handle: AbortHandle) -> u64 {
        let id = self.next_task.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.entry(app_id.clone()).or_default().installs.insert(id, handle);
        id
    }

    fn untrack_install(&self, app_id: &AppId, id: u64) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tasks) = tasks.get_mut(app_id) {
            tasks.installs.remove(&id);
        }
    }

    /// Lock an application and check the caller owns it
    async fn acquire(&self, identity: &Identity, app_id: &AppId) -> Result<(AppGuard, Application)> {
        identity.ensure_valid()?;
        let guard = self.registry.lock(app_id).await;
        let app = self
            .registry
            .get(app_id)
            .ok_or_else(|| CradleError::NotFound {
                app_id: app_id.to_string(),
            })?;
        identity.ensure_owner(&app)?;
        Ok((guard, app))
    }

    fn invalid_state(app: &Application, operation: &'static str) -> CradleError {
        CradleError::InvalidState {
            app_id: app.app_id.to_string(),
            operation,
            status: app.status.to_string(),
        }
    }

    fn container_spec(&self, app: &Application, workspace_dir: PathBuf) -> ContainerSpec {
        let mut env = app.env.clone();
        env.insert(ENV_APP_ID.to_string(), app.app_id.to_string());
        env.insert(ENV_STORAGE_PREFIX.to_string(), app.storage_prefix.clone());
        env.insert(ENV_NETWORK_ALIAS.to_string(), app.app_id.to_string());
        ContainerSpec {
            name: format!("cradle-{}", app.app_id),
            image: app.image.clone(),
            env,
            mounts: vec![MountSpec {
                source: workspace_dir,
                target: self.config.runtime.container_workspace.clone(),
                read_only: false,
            }],
            labels: BTreeMap::from([
                (LABEL_APP_ID.to_string(), app.app_id.to_string()),
                (LABEL_USER_ID.to_string(), app.user_id.clone()),
            ]),
            network: self.config.runtime.network.clone(),
            network_alias: self
                .config
                .runtime
                .network
                .as_ref()
                .map(|_| app.app_id.to_string()),
            command: None,
        }
    }

    /// Create a container for `app`; removed again if the caller never commits it
    async fn create_container(&self, app: &Application) -> Result<ContainerGuard> {
        let workspace_dir = self
            .sync
            .workspace()
            .ensure(&app.app_id)
            .await
            .map_err(|e| CradleError::from(e).in_operation(app.app_id.as_str(), "create"))?;
        let spec = self.container_spec(app, workspace_dir);
        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| runtime_failure(&app.app_id, "create", e))?;
        debug!(app_id = %app.app_id, container_id = %id, "Created container");
        Ok(ContainerGuard::new(Arc::clone(&self.runtime), id))
    }

    fn fail(&self, guard: &AppGuard, app: &mut Application, error: &CradleError) -> Result<()> {
        app.transition(AppStatus::Error, app.container_id.clone());
        app.last_error = Some(error.to_string());
        self.registry.commit(guard, app)
    }

    /// Allocate an application and its (stopped) container
    #[instrument(skip_all, fields(user_id = %identity.user_id, name = %name))]
    pub async fn create(
        &self,
        identity: &Identity,
        name: &str,
        image: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Application> {
        identity.ensure_valid()?;
        validate_request(name, image, &env)?;

        let mut app = Application::new(AppId::generate(), &identity.user_id, name, image, env);
        let timed = TimedSpan::new(lifecycle_span(spans::APP_CREATE, app.app_id.as_str()));
        let guard = self.registry.lock(&app.app_id).await;
        self.registry.commit(&guard, &app)?;

        match self.create_container(&app).await {
            Ok(container) => {
                timed.span().record(fields::CONTAINER_ID, container.id());
                app.transition(AppStatus::Stopped, Some(container.id().to_string()));
                self.registry.commit(&guard, &app)?;
                container.disarm();
            }
            Err(e @ CradleError::InvalidSpec { .. }) => {
                self.registry.remove(&guard)?;
                if let Err(cleanup) = self.sync.workspace().remove(&app.app_id).await {
                    warn!("Failed to remove workspace of rejected application: {}", cleanup);
                }
                return Err(e);
            }
            Err(e) => {
                self.fail(&guard, &mut app, &e)?;
                return Err(e);
            }
        }

        info!(app_id = %app.app_id, "Created application {}", app.name);
        timed.complete();
        Ok(app)
    }

    /// Poll until the container runs and the workspace mount is visible
    async fn wait_ready(&self, container_id: &str) -> bool {
        let probe = vec![
            "test".to_string(),
            "-d".to_string(),
            self.config.runtime.container_workspace.clone(),
        ];
        let poll = async {
            loop {
                match self.runtime.inspect_container(container_id).await {
                    Ok(Some(info)) if info.running => {
                        match self.runtime.exec(container_id, &probe).await {
                            Ok(result) if result.success() => return,
                            Ok(result) => debug!("Readiness probe exited with {}", result.exit_code),
                            Err(e) => debug!("Readiness probe failed: {}", e),
                        }
                    }
                    Ok(_) => debug!("Container {} not running yet", container_id),
                    Err(e) => debug!("Inspect failed while waiting for readiness: {}", e),
                }
                tokio::time::sleep(self.config.runtime.readiness_interval).await;
            }
        };
        tokio::time::timeout(self.config.runtime.start_timeout, poll)
            .await
            .is_ok()
    }

    async fn start_locked(&self, guard: &AppGuard, mut app: Application) -> Result<LifecycleOutcome> {
        let timed = TimedSpan::new(lifecycle_span(spans::APP_START, app.app_id.as_str()));

        let existing = match &app.container_id {
            Some(id) => self
                .runtime
                .inspect_container(id)
                .await
                .map_err(|e| runtime_failure(&app.app_id, "start", e))?
                .map(|_| id.clone()),
            None => None,
        };
        let container_id = match existing {
            Some(id) => id,
            None => {
                info!(app_id = %app.app_id, "Container missing, creating a fresh one");
                let container = match self.create_container(&app).await {
                    Ok(container) => container,
                    Err(e) => {
                        app.container_id = None;
                        self.fail(guard, &mut app, &e)?;
                        return Err(e);
                    }
                };
                app.container_id = Some(container.id().to_string());
                self.registry.commit(guard, &app)?;
                container.disarm()
            }
        };
        timed.span().record(fields::CONTAINER_ID, container_id.as_str());

        if let Err(e) = self.runtime.start_container(&container_id).await {
            let e = runtime_failure(&app.app_id, "start", e);
            self.fail(guard, &mut app, &e)?;
            return Err(e);
        }

        if !self.wait_ready(&container_id).await {
            let e = CradleError::StartupTimeout {
                app_id: app.app_id.to_string(),
                timeout: self.config.runtime.start_timeout,
            };
            warn!(app_id = %app.app_id, "{}", e);
            if let Err(stop) = self
                .runtime
                .stop_container(&container_id, Some(self.config.runtime.stop_timeout_secs))
                .await
            {
                warn!("Failed to stop container after readiness timeout: {}", stop);
            }
            self.fail(guard, &mut app, &e)?;
            return Err(e);
        }

        app.transition(AppStatus::Running, Some(container_id.clone()));
        app.last_started_at = Some(Utc::now());
        self.registry.commit(guard, &app)?;

        match self.runtime.logs(&container_id).await {
            Ok(lines) => self.logs.attach(&app.app_id, &container_id, lines),
            Err(e) => warn!(app_id = %app.app_id, "Log tail unavailable: {}", e),
        }

        let ctx = app.context();
        let cancel = self.cancel_token(&app.app_id);
        let empty = self
            .sync
            .workspace()
            .is_empty(&app.app_id)
            .await
            .map_err(|e| CradleError::from(e).in_operation(app.app_id.as_str(), "start"))?;
        let report = if empty {
            self.sync.initial_pull(&ctx, &cancel).await?
        } else {
            self.sync.reconcile(&ctx, &cancel).await?
        };

        info!(app_id = %app.app_id, container_id = %container_id, "Application running");
        timed.complete();
        Ok(LifecycleOutcome::new(app).with_sync(report))
    }

    /// Start a stopped or failed application; a running one is returned as-is
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn start(&self, identity: &Identity, app_id: &AppId) -> Result<LifecycleOutcome> {
        let (guard, app) = self.acquire(identity, app_id).await?;
        match app.status {
            AppStatus::Running => Ok(LifecycleOutcome::new(app)),
            status if status.can_start() => self.start_locked(&guard, app).await,
            _ => Err(Self::invalid_state(&app, "start")),
        }
    }

    async fn stop_locked(&self, guard: &AppGuard, mut app: Application) -> Result<LifecycleOutcome> {
        let timed = TimedSpan::new(lifecycle_span(spans::APP_STOP, app.app_id.as_str()));
        let mut warnings = Vec::new();

        // Final sync completes before the container is stopped
        let ctx = app.context();
        let cancel = self.cancel_token(&app.app_id);
        let sync = match self.sync.push(&ctx, &cancel).await {
            Ok(report) => {
                if let Some(failure) = report.failure(&app.app_id, "push") {
                    warnings.push(Warning::SyncOnStopFailed {
                        app_id: app.app_id.to_string(),
                        cause: failure.to_string(),
                    });
                }
                Some(report)
            }
            Err(e) => {
                warnings.push(Warning::SyncOnStopFailed {
                    app_id: app.app_id.to_string(),
                    cause: e.to_string(),
                });
                None
            }
        };
        for warning in &warnings {
            warn!(app_id = %app.app_id, "{}", warning);
        }

        self.lsp.terminate(&app.app_id).await;
        self.logs.detach(&app.app_id);

        let mut container_id = app.container_id.clone();
        if let Some(id) = container_id.clone() {
            timed.span().record(fields::CONTAINER_ID, id.as_str());
            match self
                .runtime
                .stop_container(&id, Some(self.config.runtime.stop_timeout_secs))
                .await
            {
                Ok(()) => {}
                Err(CradleError::Runtime(RuntimeError::ContainerNotFound { .. })) => {
                    warn!(app_id = %app.app_id, "Container {} already gone", id);
                    container_id = None;
                }
                Err(e) => {
                    let e = runtime_failure(&app.app_id, "stop", e);
                    self.fail(guard, &mut app, &e)?;
                    return Err(e);
                }
            }
        }

        app.transition(AppStatus::Stopped, container_id);
        self.registry.commit(guard, &app)?;
        info!(app_id = %app.app_id, "Application stopped");
        timed.complete();
        Ok(LifecycleOutcome {
            app,
            sync,
            warnings,
        })
    }

    /// Sync container → storage, then stop; a failed sync becomes a warning
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn stop(&self, identity: &Identity, app_id: &AppId) -> Result<LifecycleOutcome> {
        let (guard, app) = self.acquire(identity, app_id).await?;
        match app.status {
            AppStatus::Running => self.stop_locked(&guard, app).await,
            AppStatus::Stopped => Ok(LifecycleOutcome::new(app)),
            _ => Err(Self::invalid_state(&app, "stop")),
        }
    }

    /// Stop (if running) then start, under one exclusion scope
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn restart(&self, identity: &Identity, app_id: &AppId) -> Result<LifecycleOutcome> {
        let (guard, app) = self.acquire(identity, app_id).await?;
        let (app, warnings) = match app.status {
            AppStatus::Running => {
                let stopped = self.stop_locked(&guard, app).await?;
                (stopped.app, stopped.warnings)
            }
            status if status.can_start() => (app, Vec::new()),
            _ => return Err(Self::invalid_state(&app, "restart")),
        };
        let mut outcome = self.start_locked(&guard, app).await?;
        let mut all = warnings;
        all.append(&mut outcome.warnings);
        outcome.warnings = all;
        Ok(outcome)
    }

    /// Tear down an application; unknown ids succeed
    #[instrument(skip_all, fields(app_id = %app_id, purge_storage))]
    pub async fn delete(&self, identity: &Identity, app_id: &AppId, purge_storage: bool) -> Result<()> {
        identity.ensure_valid()?;
        let Some(snapshot) = self.registry.get(app_id) else {
            debug!("Application {} already gone", app_id);
            return Ok(());
        };
        identity.ensure_owner(&snapshot)?;

        // Abandon in-flight work before waiting for the guard it may hold
        self.cancel_tasks(app_id);
        let guard = self.registry.lock(app_id).await;
        let Some(mut app) = self.registry.get(app_id) else {
            return Ok(());
        };
        let timed = TimedSpan::new(lifecycle_span(spans::APP_DELETE, app_id.as_str()));
        app.transition(AppStatus::Deleting, app.container_id.clone());
        self.registry.commit(&guard, &app)?;

        self.lsp.remove(app_id).await;
        self.logs.detach(app_id);

        if let Some(id) = &app.container_id {
            timed.span().record(fields::CONTAINER_ID, id.as_str());
            match self
                .runtime
                .stop_container(id, Some(self.config.runtime.stop_timeout_secs))
                .await
            {
                Ok(())
                | Err(CradleError::Runtime(
                    RuntimeError::ContainerNotFound { .. } | RuntimeError::NotRunning { .. },
                )) => {}
                Err(e) => warn!("Stopping container {} before removal failed: {}", id, e),
            }
            self.runtime
                .remove_container(id)
                .await
                .map_err(|e| runtime_failure(app_id, "delete", e))?;
        }

        if purge_storage {
            let purged = self
                .sync
                .store()
                .delete_prefix(&app.storage_prefix)
                .await
                .map_err(|e| CradleError::from(e).in_operation(app_id.as_str(), "delete"))?;
            info!(app_id = %app_id, "Purged {} objects under {}", purged, app.storage_prefix);
        }
        self.sync
            .workspace()
            .remove(app_id)
            .await
            .map_err(|e| CradleError::from(e).in_operation(app_id.as_str(), "delete"))?;

        self.registry.remove(&guard)?;
        self.sync.forget(app_id);
        drop(guard);
        self.registry.forget_lock(app_id);
        self.cancel_tasks(app_id);
        info!(app_id = %app_id, "Application deleted");
        timed.complete();
        Ok(())
    }

    /// Move a running application whose container died to `error`
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn check_health(&self, identity: &Identity, app_id: &AppId) -> Result<Application> {
        let (guard, mut app) = self.acquire(identity, app_id).await?;
        if app.status != AppStatus::Running {
            return Ok(app);
        }
        let info = match &app.container_id {
            Some(id) => self
                .runtime
                .inspect_container(id)
                .await
                .map_err(|e| runtime_failure(app_id, "check_health", e))?,
            None => None,
        };
        if info.as_ref().is_some_and(|info| info.running) {
            return Ok(app);
        }

        warn!(app_id = %app_id, "Container is no longer running");
        self.lsp.terminate(app_id).await;
        self.logs.detach(app_id);
        let container_id = info.map(|info| info.id);
        app.transition(AppStatus::Error, container_id);
        app.last_error = Some("container exited unexpectedly".to_string());
        self.registry.commit(&guard, &app)?;
        Ok(app)
    }

    pub fn get(&self, identity: &Identity, app_id: &AppId) -> Result<Application> {
        identity.ensure_valid()?;
        let app = self
            .registry
            .get(app_id)
            .ok_or_else(|| CradleError::NotFound {
                app_id: app_id.to_string(),
            })?;
        identity.ensure_owner(&app)?;
        Ok(app)
    }

    /// The caller's applications, oldest first
    pub fn list(&self, identity: &Identity) -> Result<Vec<Application>> {
        identity.ensure_valid()?;
        Ok(self.registry.list_for(&identity.user_id))
    }

    /// Lock an application whose files may be touched (stopped or running)
    async fn acquire_files(
        &self,
        identity: &Identity,
        app_id: &AppId,
        operation: &'static str,
    ) -> Result<(AppGuard, Application)> {
        let (guard, app) = self.acquire(identity, app_id).await?;
        match app.status {
            AppStatus::Running | AppStatus::Stopped | AppStatus::Error => Ok((guard, app)),
            _ => Err(Self::invalid_state(&app, operation)),
        }
    }

    pub async fn list_files(&self, identity: &Identity, app_id: &AppId) -> Result<Vec<FileEntry>> {
        let (_guard, app) = self.acquire_files(identity, app_id, "list_files").await?;
        self.sync.list_files(&app.context()).await
    }

    pub async fn read_file(&self, identity: &Identity, app_id: &AppId, path: &str) -> Result<Bytes> {
        let (_guard, app) = self.acquire_files(identity, app_id, "read_file").await?;
        self.sync.read_file(&app.context(), path).await
    }

    pub async fn write_file(
        &self,
        identity: &Identity,
        app_id: &AppId,
        path: &str,
        data: Bytes,
    ) -> Result<FileEntry> {
        let (_guard, app) = self.acquire_files(identity, app_id, "write_file").await?;
        self.sync.write_file(&app.context(), path, data).await
    }

    /// Like `write_file`, but fails when the path exists on either side
    pub async fn create_file(
        &self,
        identity: &Identity,
        app_id: &AppId,
        path: &str,
        data: Bytes,
    ) -> Result<FileEntry> {
        let (_guard, app) = self.acquire_files(identity, app_id, "create_file").await?;
        self.sync.create_file(&app.context(), path, data).await
    }

    pub async fn rename_file(
        &self,
        identity: &Identity,
        app_id: &AppId,
        from: &str,
        to: &str,
    ) -> Result<FileEntry> {
        let (_guard, app) = self.acquire_files(identity, app_id, "rename_file").await?;
        self.sync.rename_file(&app.context(), from, to).await
    }

    /// Delete every path on both sides; failures are reported per path
    pub async fn delete_files(
        &self,
        identity: &Identity,
        app_id: &AppId,
        paths: &[String],
    ) -> Result<BatchReport> {
        let (_guard, app) = self.acquire_files(identity, app_id, "delete_files").await?;
        self.sync.delete_files(&app.context(), paths).await
    }

    /// Run a reconciliation pass on demand
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn sync(&self, identity: &Identity, app_id: &AppId) -> Result<LifecycleOutcome> {
        let (_guard, app) = self.acquire_files(identity, app_id, "sync").await?;
        let cancel = self.cancel_token(app_id);
        let report = self.sync.reconcile(&app.context(), &cancel).await?;
        Ok(LifecycleOutcome::new(app).with_sync(report))
    }

    /// Requested versus installed packages of a running application
    pub async fn dependencies(
        &self,
        identity: &Identity,
        app_id: &AppId,
    ) -> Result<Option<(Ecosystem, DependencySet)>> {
        let (_guard, app) = self.acquire(identity, app_id).await?;
        self.deps.dependency_set(&app.context()).await
    }

    /// Bring installed packages in line with the workspace manifest
    ///
    /// Runs outside the application's guard so a long install does not block
    /// other operations; `delete` aborts it. The manifest is recorded on the
    /// application only when every package succeeded.
    #[instrument(skip_all, fields(app_id = %app_id, force))]
    pub async fn install_dependencies(
        &self,
        identity: &Identity,
        app_id: &AppId,
        force: bool,
    ) -> Result<Option<InstallReport>> {
        let (ctx, previous) = {
            let (_guard, app) = self.acquire(identity, app_id).await?;
            if app.status != AppStatus::Running {
                return Err(CradleError::ContainerUnavailable {
                    app_id: app_id.to_string(),
                    message: format!("application is {}", app.status),
                });
            }
            (app.context(), app.manifest)
        };

        let resolver = Arc::clone(&self.deps);
        let install = tokio::spawn(async move { resolver.resolve(&ctx, previous.as_ref(), force).await });
        let task_id = self.track_install(app_id, install.abort_handle());
        let joined = install.await;
        self.untrack_install(app_id, task_id);

        let report = match joined {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => {
                return Err(CradleError::Cancelled {
                    app_id: app_id.to_string(),
                    operation: "install_dependencies",
                })
            }
            Err(e) => {
                return Err(CradleError::State {
                    message: format!("dependency install task failed: {}", e),
                })
            }
        };

        if let Some(report) = &report {
            if report.failed() == 0 {
                let guard = self.registry.lock(app_id).await;
                if let Some(mut app) = self.registry.get(app_id) {
                    app.manifest = Some(report.manifest.clone());
                    self.registry.commit(&guard, &app)?;
                }
            }
        }
        Ok(report)
    }

    /// Follow an application's logs from `from_seq`
    ///
    /// A running application whose tail is not attached in this process (for
    /// example after the manager was reopened) gets one attached first.
    pub async fn subscribe_logs(
        &self,
        identity: &Identity,
        app_id: &AppId,
        from_seq: u64,
    ) -> Result<LogSubscription> {
        let (_guard, app) = self.acquire(identity, app_id).await?;
        if let (AppStatus::Running, Some(container_id)) = (app.status, &app.container_id) {
            if !self.logs.is_attached(app_id) {
                let lines = self
                    .runtime
                    .logs(container_id)
                    .await
                    .map_err(|e| runtime_failure(app_id, "subscribe_logs", e))?;
                self.logs.attach(app_id, container_id, lines);
            }
        }
        self.logs.subscribe(app_id, from_seq)
    }

    /// Open the application's language server session, replacing any active one
    #[instrument(skip_all, fields(app_id = %app_id))]
    pub async fn attach_lsp(&self, identity: &Identity, app_id: &AppId) -> Result<LspClient> {
        let (_guard, app) = self.acquire(identity, app_id).await?;
        if app.status != AppStatus::Running {
            return Err(CradleError::ContainerUnavailable {
                app_id: app_id.to_string(),
                message: format!("application is {}", app.status),
            });
        }
        self.lsp.attach(&app.context()).await
    }

    pub async fn lsp_session(&self, identity: &Identity, app_id: &AppId) -> Result<Option<SessionInfo>> {
        self.get(identity, app_id)?;
        Ok(self.lsp.session(app_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_request() {
        let env = BTreeMap::from([("NODE_ENV".to_string(), "development".to_string())]);
        assert!(validate_request("my app", "node:20", &env).is_ok());
        assert!(matches!(
            validate_request("", "node:20", &env),
            Err(CradleError::InvalidSpec { .. })
        ));
        assert!(matches!(
            validate_request("demo", "Node:20", &env),
            Err(CradleError::InvalidSpec { .. })
        ));

        let reserved = BTreeMap::from([(ENV_APP_ID.to_string(), "x".to_string())]);
        assert!(validate_request("demo", "node:20", &reserved).is_err());
        let malformed = BTreeMap::from([("1BAD".to_string(), "x".to_string())]);
        assert!(validate_request("demo", "node:20", &malformed).is_err());
    }

    #[test]
    fn test_runtime_failure_mapping() {
        let app_id = AppId::from("a1");
        assert!(matches!(
            runtime_failure(&app_id, "create", RuntimeError::Capacity("full".into()).into()),
            CradleError::ResourceExhausted { .. }
        ));
        assert!(matches!(
            runtime_failure(&app_id, "create", RuntimeError::InvalidSpec("bad".into()).into()),
            CradleError::InvalidSpec { .. }
        ));
        let wrapped = runtime_failure(&app_id, "start", RuntimeError::NotInstalled.into());
        assert!(matches!(wrapped, CradleError::Operation { operation: "start", .. }));
    }
}
