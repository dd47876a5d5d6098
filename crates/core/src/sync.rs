//! File synchronization between a container workspace and object storage
//!
//! Reconciliation compares both sides by content hash against a per-application
//! baseline: the path → hash map recorded the last time both sides agreed. The
//! baseline is what tells "created on one side" apart from "deleted on the
//! other side".
//!
//! Conflict policy:
//! - a path that changed on one side only follows that side;
//! - a path edited on both sides follows the newer modification time, ties
//!   going to storage;
//! - a path in the baseline that disappeared from one side is deleted from the
//!   other side, even if it was edited there.
//!
//! Every resolved conflict is logged under the `cradle_core::sync::audit`
//! target and returned as a [`Warning::SyncConflictResolved`].

use crate::application::{AppContext, AppId, FileEntry, Location};
use crate::errors::{CradleError, Result, StorageError, SyncError, Warning};
use crate::observability::{sync_span, TimedSpan};
use crate::registry::KeyedLocks;
use crate::state::{StateStore, SyncBaseline};
use crate::storage::{content_hash, ObjectMeta, ObjectStore};
use crate::workspace::{normalize_path, Workspace};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result for one path of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ItemOutcome {
    Ok,
    Failed { reason: String },
}

/// Per-path report of a batch operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub results: BTreeMap<String, ItemOutcome>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.results
            .values()
            .filter(|outcome| matches!(outcome, ItemOutcome::Failed { .. }))
            .count()
    }

    /// `PartialBatchFailure` summarising failed items, if any
    pub fn failure(&self, app_id: &AppId, operation: &'static str) -> Option<CradleError> {
        let failed = self.failed();
        (failed > 0).then(|| CradleError::PartialBatchFailure {
            app_id: app_id.to_string(),
            operation,
            failed,
            total: self.results.len(),
        })
    }
}

/// What a sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Storage → container
    pub pulled: Vec<String>,
    /// Container → storage
    pub pushed: Vec<String>,
    pub deleted_in_container: Vec<String>,
    pub deleted_in_storage: Vec<String>,
    pub conflicts: Vec<Warning>,
    /// Path → reason for items that could not be applied
    pub failures: BTreeMap<String, String>,
}

impl SyncReport {
    /// Number of writes or deletes performed on either side
    pub fn changes(&self) -> usize {
        self.pulled.len()
            + self.pushed.len()
            + self.deleted_in_container.len()
            + self.deleted_in_storage.len()
    }

    pub fn failure(&self, app_id: &AppId, operation: &'static str) -> Option<CradleError> {
        let failed = self.failures.len();
        (failed > 0).then(|| CradleError::PartialBatchFailure {
            app_id: app_id.to_string(),
            operation,
            failed,
            total: failed + self.changes(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Pull,
    Push,
    DeleteInContainer,
    DeleteInStorage,
    /// Both sides hold this hash already
    Agree(String),
    /// Gone from both sides
    Forget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    path: String,
    action: Action,
    /// Set when the step resolves a conflict
    resolution: Option<&'static str>,
}

/// Decide what to do with every path seen on either side or in the baseline
fn plan(
    local: &BTreeMap<String, ObjectMeta>,
    remote: &BTreeMap<String, ObjectMeta>,
    baseline: &SyncBaseline,
) -> Vec<Step> {
    let paths: BTreeSet<&String> = local
        .keys()
        .chain(remote.keys())
        .chain(baseline.keys())
        .collect();

    paths
        .into_iter()
        .map(|path| {
            let base = baseline.get(path);
            let (action, resolution) = match (local.get(path), remote.get(path)) {
                (Some(l), Some(r)) if l.hash == r.hash => (Action::Agree(l.hash.clone()), None),
                (Some(l), Some(r)) => match base {
                    Some(b) if *b == l.hash => (Action::Pull, None),
                    Some(b) if *b == r.hash => (Action::Push, None),
                    _ if l.modified > r.modified => {
                        (Action::Push, Some("container copy is newer"))
                    }
                    _ => (Action::Pull, Some("storage copy is newer")),
                },
                (Some(l), None) => match base {
                    Some(b) if *b == l.hash => (Action::DeleteInContainer, None),
                    Some(_) => (
                        Action::DeleteInContainer,
                        Some("deleted in storage; deletion wins over container edit"),
                    ),
                    None => (Action::Push, None),
                },
                (None, Some(r)) => match base {
                    Some(b) if *b == r.hash => (Action::DeleteInStorage, None),
                    Some(_) => (
                        Action::DeleteInStorage,
                        Some("deleted in container; deletion wins over storage edit"),
                    ),
                    None => (Action::Pull, None),
                },
                (None, None) => (Action::Forget, None),
            };
            Step {
                path: path.clone(),
                action,
                resolution,
            }
        })
        .collect()
}

/// Bidirectional workspace ↔ storage synchronization
pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    workspace: Workspace,
    state: Option<StateStore>,
    baselines: Mutex<HashMap<AppId, SyncBaseline>>,
    locks: KeyedLocks,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>, workspace: Workspace, state: Option<StateStore>) -> Self {
        Self {
            store,
            workspace,
            state,
            baselines: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn baseline(&self, app_id: &AppId) -> SyncBaseline {
        let mut baselines = self.baselines.lock().unwrap_or_else(PoisonError::into_inner);
        baselines
            .entry(app_id.clone())
            .or_insert_with(|| {
                self.state
                    .as_ref()
                    .map(|state| state.load_baseline(app_id))
                    .unwrap_or_default()
            })
            .clone()
    }

    fn save_baseline(&self, app_id: &AppId, baseline: SyncBaseline) -> Result<()> {
        if let Some(state) = &self.state {
            state.save_baseline(app_id, &baseline)?;
        }
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app_id.clone(), baseline);
        Ok(())
    }

    /// Drop cached state for a deleted application
    pub fn forget(&self, app_id: &AppId) {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_id);
        self.locks.forget(app_id.as_str());
    }

    async fn sides(
        &self,
        ctx: &AppContext,
    ) -> Result<(BTreeMap<String, ObjectMeta>, BTreeMap<String, ObjectMeta>)> {
        let local = self
            .workspace
            .list(&ctx.app_id)
            .await?
            .into_iter()
            .map(|m| (m.path.clone(), m))
            .collect();
        let remote = self
            .store
            .list(&ctx.storage_prefix)
            .await?
            .into_iter()
            .map(|m| (m.path.clone(), m))
            .collect();
        Ok((local, remote))
    }

    async fn pull(&self, ctx: &AppContext, path: &str) -> Result<String> {
        let data = self.store.get(&ctx.storage_prefix, path).await?;
        self.workspace.write(&ctx.app_id, path, &data).await?;
        Ok(content_hash(&data))
    }

    async fn push_one(&self, ctx: &AppContext, path: &str) -> Result<String> {
        let data = self
            .workspace
            .read(&ctx.app_id, path)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                path: path.to_string(),
            })?;
        let meta = self.store.put(&ctx.storage_prefix, path, data).await?;
        Ok(meta.hash)
    }

    async fn apply(
        &self,
        ctx: &AppContext,
        step: &Step,
        baseline: &mut SyncBaseline,
        report: &mut SyncReport,
    ) -> Result<()> {
        match &step.action {
            Action::Agree(hash) => {
                baseline.insert(step.path.clone(), hash.clone());
            }
            Action::Forget => {
                baseline.remove(&step.path);
            }
            Action::Pull => {
                let hash = self.pull(ctx, &step.path).await?;
                baseline.insert(step.path.clone(), hash);
                report.pulled.push(step.path.clone());
            }
            Action::Push => {
                let hash = self.push_one(ctx, &step.path).await?;
                baseline.insert(step.path.clone(), hash);
                report.pushed.push(step.path.clone());
            }
            Action::DeleteInContainer => {
                self.workspace.remove_file(&ctx.app_id, &step.path).await?;
                baseline.remove(&step.path);
                report.deleted_in_container.push(step.path.clone());
            }
            Action::DeleteInStorage => {
                self.store.delete(&ctx.storage_prefix, &step.path).await?;
                baseline.remove(&step.path);
                report.deleted_in_storage.push(step.path.clone());
            }
        }

        if let Some(resolution) = step.resolution {
            info!(
                target: "cradle_core::sync::audit",
                app_id = %ctx.app_id,
                path = %step.path,
                resolution,
                "Sync conflict resolved"
            );
            report.conflicts.push(Warning::SyncConflictResolved {
                app_id: ctx.app_id.to_string(),
                path: step.path.clone(),
                resolution: resolution.to_string(),
            });
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        ctx: &AppContext,
        steps: Vec<Step>,
        mut baseline: SyncBaseline,
        cancel: &CancellationToken,
        operation: &'static str,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for step in &steps {
            if cancel.is_cancelled() {
                // Keep what was applied so far consistent with the baseline
                self.save_baseline(&ctx.app_id, baseline)?;
                return Err(CradleError::Cancelled {
                    app_id: ctx.app_id.to_string(),
                    operation,
                });
            }
            if let Err(e) = self.apply(ctx, step, &mut baseline, &mut report).await {
                warn!("{} of {} failed: {}", operation, step.path, e);
                report.failures.insert(step.path.clone(), e.to_string());
            }
        }
        self.save_baseline(&ctx.app_id, baseline)?;
        Ok(report)
    }

    /// Bring both sides into agreement
    #[instrument(skip_all, fields(app_id = %ctx.app_id))]
    pub async fn reconcile(&self, ctx: &AppContext, cancel: &CancellationToken) -> Result<SyncReport> {
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        let timed = TimedSpan::new(sync_span(ctx.app_id.as_str(), "reconcile"));

        let (local, remote) = self
            .sides(ctx)
            .await
            .map_err(|e| e.in_operation(ctx.app_id.as_str(), "reconcile"))?;
        let baseline = self.baseline(&ctx.app_id);
        let steps = plan(&local, &remote, &baseline);
        let report = self
            .run_steps(ctx, steps, baseline, cancel, "reconcile")
            .await?;

        debug!(
            "Reconciled: {} pulled, {} pushed, {} deleted, {} conflicts, {} failures",
            report.pulled.len(),
            report.pushed.len(),
            report.deleted_in_container.len() + report.deleted_in_storage.len(),
            report.conflicts.len(),
            report.failures.len()
        );
        timed.complete();
        Ok(report)
    }

    /// Copy every stored object into the (empty) workspace
    #[instrument(skip_all, fields(app_id = %ctx.app_id))]
    pub async fn initial_pull(
        &self,
        ctx: &AppContext,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        let timed = TimedSpan::new(sync_span(ctx.app_id.as_str(), "pull"));

        let remote = self
            .store
            .list(&ctx.storage_prefix)
            .await
            .map_err(|e| CradleError::from(e).in_operation(ctx.app_id.as_str(), "initial_pull"))?;
        let steps = remote
            .into_iter()
            .map(|meta| Step {
                path: meta.path,
                action: Action::Pull,
                resolution: None,
            })
            .collect();
        let report = self
            .run_steps(ctx, steps, SyncBaseline::new(), cancel, "initial_pull")
            .await?;
        timed.complete();
        Ok(report)
    }

    /// Container → storage only; used as the final sync before stopping
    ///
    /// Storage-only changes are left alone; paths the container deleted since
    /// the baseline are deleted from storage.
    #[instrument(skip_all, fields(app_id = %ctx.app_id))]
    pub async fn push(&self, ctx: &AppContext, cancel: &CancellationToken) -> Result<SyncReport> {
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        let timed = TimedSpan::new(sync_span(ctx.app_id.as_str(), "push"));

        let (local, remote) = self
            .sides(ctx)
            .await
            .map_err(|e| e.in_operation(ctx.app_id.as_str(), "push"))?;
        let baseline = self.baseline(&ctx.app_id);
        let steps = plan(&local, &remote, &baseline)
            .into_iter()
            .filter(|step| {
                matches!(
                    step.action,
                    Action::Push | Action::DeleteInStorage | Action::Agree(_) | Action::Forget
                )
            })
            .collect();
        let report = self.run_steps(ctx, steps, baseline, cancel, "push").await?;
        timed.complete();
        Ok(report)
    }

    /// Files on either side with their location
    pub async fn list_files(&self, ctx: &AppContext) -> Result<Vec<FileEntry>> {
        let (local, remote) = self.sides(ctx).await?;
        let paths: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
        Ok(paths
            .into_iter()
            .filter_map(|path| {
                let (meta, location) = match (local.get(path), remote.get(path)) {
                    (Some(l), Some(_)) => (l, Location::Both),
                    (Some(l), None) => (l, Location::ContainerOnly),
                    (None, Some(r)) => (r, Location::StorageOnly),
                    (None, None) => return None,
                };
                Some(FileEntry {
                    path: meta.path.clone(),
                    hash: meta.hash.clone(),
                    size: meta.size,
                    modified: meta.modified,
                    location,
                })
            })
            .collect())
    }

    /// Workspace copy if present, else the stored copy
    pub async fn read_file(&self, ctx: &AppContext, path: &str) -> Result<Bytes> {
        let path = normalize_path(path)?;
        if let Some(data) = self.workspace.read(&ctx.app_id, &path).await? {
            return Ok(data);
        }
        match self.store.get(&ctx.storage_prefix, &path).await {
            Ok(data) => Ok(data),
            Err(StorageError::NotFound { .. }) => Err(SyncError::NotFound { path }.into()),
            Err(e) => Err(CradleError::from(e).in_operation(ctx.app_id.as_str(), "read_file")),
        }
    }

    async fn write_through(&self, ctx: &AppContext, path: &str, data: Bytes) -> Result<FileEntry> {
        self.workspace.write(&ctx.app_id, path, &data).await?;
        let meta = self.store.put(&ctx.storage_prefix, path, data).await?;
        let mut baseline = self.baseline(&ctx.app_id);
        baseline.insert(meta.path.clone(), meta.hash.clone());
        self.save_baseline(&ctx.app_id, baseline)?;
        Ok(FileEntry {
            path: meta.path,
            hash: meta.hash,
            size: meta.size,
            modified: meta.modified,
            location: Location::Both,
        })
    }

    /// Write to the workspace and to storage before returning
    #[instrument(skip(self, ctx, data), fields(app_id = %ctx.app_id, size = data.len()))]
    pub async fn write_file(&self, ctx: &AppContext, path: &str, data: Bytes) -> Result<FileEntry> {
        let path = normalize_path(path)?;
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        self.write_through(ctx, &path, data)
            .await
            .map_err(|e| e.in_operation(ctx.app_id.as_str(), "write_file"))
    }

    async fn exists_anywhere(&self, ctx: &AppContext, path: &str) -> Result<bool> {
        if self.workspace.stat(&ctx.app_id, path).await?.is_some() {
            return Ok(true);
        }
        Ok(self.store.exists(&ctx.storage_prefix, path).await?)
    }

    /// Like `write_file`, but fails if the path exists on either side
    #[instrument(skip(self, ctx, data), fields(app_id = %ctx.app_id))]
    pub async fn create_file(&self, ctx: &AppContext, path: &str, data: Bytes) -> Result<FileEntry> {
        let path = normalize_path(path)?;
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        if self.exists_anywhere(ctx, &path).await? {
            return Err(SyncError::AlreadyExists { path }.into());
        }
        self.write_through(ctx, &path, data)
            .await
            .map_err(|e| e.in_operation(ctx.app_id.as_str(), "create_file"))
    }

    /// Move a file on both sides; the destination must not exist
    #[instrument(skip(self, ctx), fields(app_id = %ctx.app_id))]
    pub async fn rename_file(&self, ctx: &AppContext, from: &str, to: &str) -> Result<FileEntry> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        if self.exists_anywhere(ctx, &to).await? {
            return Err(SyncError::AlreadyExists { path: to }.into());
        }
        let data = match self.workspace.read(&ctx.app_id, &from).await? {
            Some(data) => data,
            None => match self.store.get(&ctx.storage_prefix, &from).await {
                Ok(data) => data,
                Err(StorageError::NotFound { .. }) => {
                    return Err(SyncError::NotFound { path: from }.into())
                }
                Err(e) => return Err(CradleError::from(e).in_operation(ctx.app_id.as_str(), "rename_file")),
            },
        };

        let entry = self
            .write_through(ctx, &to, data)
            .await
            .map_err(|e| e.in_operation(ctx.app_id.as_str(), "rename_file"))?;
        self.store
            .delete(&ctx.storage_prefix, &from)
            .await
            .map_err(|e| CradleError::from(e).in_operation(ctx.app_id.as_str(), "rename_file"))?;
        self.workspace.remove_file(&ctx.app_id, &from).await?;

        let mut baseline = self.baseline(&ctx.app_id);
        baseline.remove(&from);
        self.save_baseline(&ctx.app_id, baseline)?;
        Ok(entry)
    }

    /// `path` is already normalized
    async fn delete_one(&self, ctx: &AppContext, path: &str) -> Result<()> {
        if !self.exists_anywhere(ctx, path).await? {
            return Err(SyncError::NotFound {
                path: path.to_string(),
            }
            .into());
        }
        // Storage first: a path that survives in storage stays in the workspace too
        self.store.delete(&ctx.storage_prefix, path).await?;
        self.workspace.remove_file(&ctx.app_id, path).await?;
        let mut baseline = self.baseline(&ctx.app_id);
        baseline.remove(path);
        self.save_baseline(&ctx.app_id, baseline)
    }

    /// Delete every listed path from both sides, reporting each one
    #[instrument(skip(self, ctx, paths), fields(app_id = %ctx.app_id, count = paths.len()))]
    pub async fn delete_files(&self, ctx: &AppContext, paths: &[String]) -> Result<BatchReport> {
        let _lock = self.locks.lock(ctx.app_id.as_str()).await;
        let mut report = BatchReport::default();
        // Spellings of the same file collapse to one entry under its normalized path
        let mut targets = BTreeSet::new();
        for raw in paths {
            match normalize_path(raw) {
                Ok(path) => {
                    targets.insert(path);
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", raw, e);
                    report.results.insert(
                        raw.clone(),
                        ItemOutcome::Failed {
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
        for path in targets {
            let outcome = match self.delete_one(ctx, &path).await {
                Ok(()) => ItemOutcome::Ok,
                Err(e) => {
                    warn!("Failed to delete {}: {}", path, e);
                    ItemOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.results.insert(path, outcome);
        }
        Ok(report)
    }
}
