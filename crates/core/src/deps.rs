//! Dependency resolution inside application containers
//!
//! When the workspace manifest's hash differs from the one recorded on the
//! application, the resolver lists installed packages through `exec`, diffs
//! them against the declared constraints, and installs, upgrades or removes
//! only what differs. Each package gets its own outcome; a failed package never
//! stops the others.

use crate::application::{AppContext, DeclaredManifest};
use crate::errors::{CradleError, DependencyError, Result, RuntimeError};
use crate::observability::{deps_span, TimedSpan};
use crate::runtime::{ContainerRuntime, ExecResult};
use crate::storage::content_hash;
use crate::sync::ItemOutcome;
use crate::workspace::Workspace;
use semver::{Version, VersionReq};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Package ecosystem, identified by its manifest file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Pip,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 2] = [Ecosystem::Npm, Ecosystem::Pip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pip => "pip",
        }
    }

    pub fn manifest_path(&self) -> &'static str {
        match self {
            Self::Npm => "package.json",
            Self::Pip => "requirements.txt",
        }
    }

    /// Declared package → constraint
    pub fn parse_manifest(&self, content: &str) -> Result<BTreeMap<String, String>> {
        match self {
            Self::Npm => parse_package_json(content),
            Self::Pip => Ok(parse_requirements(content)),
        }
    }

    /// Installed package → version, from the listing command's stdout
    pub fn parse_installed(&self, stdout: &str) -> Result<BTreeMap<String, String>> {
        let inventory = |message: String| -> CradleError { DependencyError::Inventory { message }.into() };
        let value: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|e| inventory(format!("{} listing is not JSON: {}", self.as_str(), e)))?;
        match self {
            Self::Npm => Ok(value["dependencies"]
                .as_object()
                .map(|deps| {
                    deps.iter()
                        .filter_map(|(name, info)| {
                            info["version"].as_str().map(|v| (name.clone(), v.to_string()))
                        })
                        .collect()
                })
                .unwrap_or_default()),
            Self::Pip => value
                .as_array()
                .ok_or_else(|| inventory("pip listing is not an array".to_string()))
                .map(|packages| {
                    packages
                        .iter()
                        .filter_map(|p| {
                            let name = p["name"].as_str()?;
                            let version = p["version"].as_str()?;
                            Some((normalize_pip_name(name), version.to_string()))
                        })
                        .collect()
                }),
        }
    }

    /// Whether `installed` meets `constraint`
    pub fn satisfies(&self, constraint: &str, installed: &str) -> bool {
        match self {
            Self::Npm => npm_satisfies(constraint, installed),
            Self::Pip => pip_satisfies(constraint, installed),
        }
    }

    fn list_command(&self, workdir: &str) -> Vec<String> {
        match self {
            Self::Npm => ["npm", "ls", "--json", "--depth=0", "--prefix", workdir]
                .map(String::from)
                .to_vec(),
            Self::Pip => ["pip", "list", "--format=json"].map(String::from).to_vec(),
        }
    }

    fn install_command(&self, workdir: &str, packages: &[(&str, &str)]) -> Vec<String> {
        let mut command: Vec<String> = match self {
            Self::Npm => ["npm", "install", "--no-save", "--prefix", workdir]
                .map(String::from)
                .to_vec(),
            Self::Pip => ["pip", "install"].map(String::from).to_vec(),
        };
        command.extend(packages.iter().map(|(name, constraint)| match self {
            Self::Npm if constraint.is_empty() || *constraint == "*" => name.to_string(),
            Self::Npm => format!("{}@{}", name, constraint),
            Self::Pip => format!("{}{}", name, constraint),
        }));
        command
    }

    fn uninstall_command(&self, workdir: &str, packages: &[&str]) -> Vec<String> {
        let mut command: Vec<String> = match self {
            Self::Npm => ["npm", "uninstall", "--no-save", "--prefix", workdir]
                .map(String::from)
                .to_vec(),
            Self::Pip => ["pip", "uninstall", "-y"].map(String::from).to_vec(),
        };
        command.extend(packages.iter().map(|p| p.to_string()));
        command
    }
}

fn parse_package_json(content: &str) -> Result<BTreeMap<String, String>> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| DependencyError::Parsing {
            manifest: "package.json".to_string(),
            message: e.to_string(),
        })?;
    let mut declared = BTreeMap::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(deps) = value[section].as_object() {
            for (name, constraint) in deps {
                let constraint = constraint.as_str().ok_or_else(|| DependencyError::Parsing {
                    manifest: "package.json".to_string(),
                    message: format!("version of {} must be a string", name),
                })?;
                declared
                    .entry(name.clone())
                    .or_insert_with(|| constraint.to_string());
            }
        }
    }
    Ok(declared)
}

/// PEP 503 name normalization
fn normalize_pip_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

fn parse_requirements(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.split('#').next().unwrap_or("").trim();
            // Options (-r, -e, --index-url) and environment markers are not package lines
            if line.is_empty() || line.starts_with('-') {
                return None;
            }
            let line = line.split(';').next().unwrap_or("").trim();
            let name_end = line
                .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
                .unwrap_or(line.len());
            let name = &line[..name_end];
            if name.is_empty() {
                return None;
            }
            let mut rest = line[name_end..].trim();
            if rest.starts_with('[') {
                rest = rest.find(']').map(|i| rest[i + 1..].trim()).unwrap_or("");
            }
            Some((normalize_pip_name(name), rest.replace(' ', "")))
        })
        .collect()
}

/// Lenient version parse: `1`, `1.2`, `v1.2.3`, `2.0.0rc1`
fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().strip_prefix('v').unwrap_or(raw.trim());
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let numeric: Vec<u64> = raw
        .split('.')
        .map_while(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .take(3)
        .collect();
    match numeric.as_slice() {
        [] => None,
        [major] => Some(Version::new(*major, 0, 0)),
        [major, minor] => Some(Version::new(*major, *minor, 0)),
        [major, minor, patch, ..] => Some(Version::new(*major, *minor, *patch)),
    }
}

fn npm_satisfies(constraint: &str, installed: &str) -> bool {
    let constraint = constraint.trim();
    if constraint.is_empty() || constraint == "*" || constraint == "latest" {
        return true;
    }
    // git/url/file/tag specs cannot be checked against a version
    if constraint.contains(':') || constraint.contains('/') {
        return true;
    }
    let Some(version) = parse_version(installed) else {
        return false;
    };
    // npm ranges separate comparators with spaces; `||` alternatives are tried in turn
    constraint.split("||").any(|alternative| {
        // A bare npm version is an exact pin, not a caret range
        let alternative = alternative
            .split_whitespace()
            .map(|token| {
                let bare = token.starts_with(|c: char| c.is_ascii_digit())
                    && !token.contains(['x', 'X', '*']);
                if bare {
                    format!("={}", token)
                } else {
                    token.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        match VersionReq::parse(&alternative) {
            Ok(req) => req.matches(&version),
            Err(e) => {
                debug!("Unparseable npm range '{}': {}", alternative, e);
                true
            }
        }
    })
}

fn pip_satisfies(constraint: &str, installed: &str) -> bool {
    let Some(version) = parse_version(installed) else {
        return false;
    };
    constraint
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .all(|clause| {
            let op_len = clause
                .find(|c: char| c.is_ascii_alphanumeric() || c == '*')
                .unwrap_or(clause.len());
            let (op, target) = clause.split_at(op_len);
            if let Some(prefix) = target.strip_suffix(".*") {
                let matches = installed == prefix || installed.starts_with(&format!("{}.", prefix));
                return if op == "!=" { !matches } else { matches };
            }
            let Some(target_version) = parse_version(target) else {
                return true;
            };
            match op {
                "==" | "===" => version == target_version,
                "!=" => version != target_version,
                ">=" => version >= target_version,
                "<=" => version <= target_version,
                ">" => version > target_version,
                "<" => version < target_version,
                "~=" => {
                    let parts = target.split('.').count();
                    let upper = if parts <= 2 {
                        Version::new(target_version.major + 1, 0, 0)
                    } else {
                        Version::new(target_version.major, target_version.minor + 1, 0)
                    };
                    version >= target_version && version < upper
                }
                _ => true,
            }
        })
}

/// What the resolver decided for one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    Install,
    Upgrade,
    Remove,
}

/// Requested constraint next to the observed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyStatus {
    pub requested: Option<String>,
    pub installed: Option<String>,
}

/// Package → requested/installed; derived, never persisted
pub type DependencySet = BTreeMap<String, DependencyStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageResult {
    pub action: PackageAction,
    pub outcome: ItemOutcome,
}

/// Outcome of one resolution run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallReport {
    pub ecosystem: Ecosystem,
    /// Manifest the run acted on; recorded on the application once clean
    pub manifest: DeclaredManifest,
    pub packages: BTreeMap<String, PackageResult>,
    pub dependencies: DependencySet,
}

impl InstallReport {
    pub fn failed(&self) -> usize {
        self.packages
            .values()
            .filter(|p| matches!(p.outcome, ItemOutcome::Failed { .. }))
            .count()
    }
}

/// Install/upgrade/remove set for one manifest
pub fn plan_changes(
    ecosystem: Ecosystem,
    declared: &BTreeMap<String, String>,
    previous: Option<&BTreeMap<String, String>>,
    installed: &BTreeMap<String, String>,
) -> Vec<(String, PackageAction)> {
    let mut changes = Vec::new();
    for (name, constraint) in declared {
        match installed.get(name) {
            None => changes.push((name.clone(), PackageAction::Install)),
            Some(version) if !ecosystem.satisfies(constraint, version) => {
                changes.push((name.clone(), PackageAction::Upgrade))
            }
            Some(_) => {}
        }
    }
    if let Some(previous) = previous {
        for name in previous.keys() {
            if !declared.contains_key(name) && installed.contains_key(name) {
                changes.push((name.clone(), PackageAction::Remove));
            }
        }
    }
    changes
}

/// Runs package managers inside application containers
pub struct DependencyResolver {
    runtime: Arc<dyn ContainerRuntime>,
    workspace: Workspace,
    /// Workspace mount point inside the container
    container_workspace: String,
}

impl DependencyResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, workspace: Workspace, container_workspace: &str) -> Self {
        Self {
            runtime,
            workspace,
            container_workspace: container_workspace.to_string(),
        }
    }

    /// First manifest present in the workspace, with its content
    pub async fn detect(&self, ctx: &AppContext) -> Result<Option<(Ecosystem, String)>> {
        for ecosystem in Ecosystem::ALL {
            if let Some(data) = self.workspace.read(&ctx.app_id, ecosystem.manifest_path()).await? {
                let content = String::from_utf8(data.to_vec()).map_err(|e| DependencyError::Parsing {
                    manifest: ecosystem.manifest_path().to_string(),
                    message: e.to_string(),
                })?;
                return Ok(Some((ecosystem, content)));
            }
        }
        Ok(None)
    }

    fn container_id<'a>(&self, ctx: &'a AppContext) -> Result<&'a str> {
        ctx.container_id
            .as_deref()
            .ok_or_else(|| CradleError::ContainerUnavailable {
                app_id: ctx.app_id.to_string(),
                message: "application has no container".to_string(),
            })
    }

    async fn exec(&self, ctx: &AppContext, command: Vec<String>) -> Result<ExecResult> {
        let id = self.container_id(ctx)?;
        debug!("Running {:?}", command);
        match self.runtime.exec(id, &command).await {
            Err(CradleError::Runtime(
                err @ (RuntimeError::NotRunning { .. } | RuntimeError::ContainerNotFound { .. }),
            )) => Err(CradleError::ContainerUnavailable {
                app_id: ctx.app_id.to_string(),
                message: err.to_string(),
            }),
            other => other,
        }
    }

    /// Installed packages as reported by the package manager
    pub async fn inventory(&self, ctx: &AppContext, ecosystem: Ecosystem) -> Result<BTreeMap<String, String>> {
        let result = self
            .exec(ctx, ecosystem.list_command(&self.container_workspace))
            .await?;
        // `npm ls` exits non-zero on missing or extraneous packages but still prints the tree
        if result.exit_code != 0 && result.stdout.trim().is_empty() {
            return Err(DependencyError::Inventory {
                message: format!(
                    "{} listing exited with {}: {}",
                    ecosystem.as_str(),
                    result.exit_code,
                    result.stderr.trim()
                ),
            }
            .into());
        }
        ecosystem.parse_installed(&result.stdout)
    }

    /// Declared constraints next to installed versions
    pub async fn dependency_set(&self, ctx: &AppContext) -> Result<Option<(Ecosystem, DependencySet)>> {
        let Some((ecosystem, content)) = self.detect(ctx).await? else {
            return Ok(None);
        };
        let declared = ecosystem.parse_manifest(&content)?;
        let installed = self.inventory(ctx, ecosystem).await?;
        Ok(Some((ecosystem, merge_set(&declared, &installed))))
    }

    /// Run the package manager for `items`: one batched call, then one call per
    /// item if the batch failed so each failure is attributed to its package
    async fn run_batch<F>(&self, ctx: &AppContext, items: &[String], command: F) -> Result<BTreeMap<String, ItemOutcome>>
    where
        F: Fn(&[String]) -> Vec<String>,
    {
        let mut outcomes = BTreeMap::new();
        if items.is_empty() {
            return Ok(outcomes);
        }
        if items.len() > 1 {
            let result = self.exec(ctx, command(items)).await?;
            if result.success() {
                for item in items {
                    outcomes.insert(item.clone(), ItemOutcome::Ok);
                }
                return Ok(outcomes);
            }
            debug!("Batch failed, retrying packages individually");
        }
        for item in items {
            let result = self.exec(ctx, command(std::slice::from_ref(item))).await?;
            let outcome = if result.success() {
                ItemOutcome::Ok
            } else {
                warn!("Package {} failed: {}", item, result.stderr.trim());
                ItemOutcome::Failed {
                    reason: format!("exit code {}: {}", result.exit_code, last_line(&result.stderr)),
                }
            };
            outcomes.insert(item.clone(), outcome);
        }
        Ok(outcomes)
    }

    /// Resolve when the manifest changed since `previous` (or always with `force`)
    ///
    /// Returns `None` when there is no manifest or nothing changed.
    #[instrument(skip_all, fields(app_id = %ctx.app_id))]
    pub async fn resolve(
        &self,
        ctx: &AppContext,
        previous: Option<&DeclaredManifest>,
        force: bool,
    ) -> Result<Option<InstallReport>> {
        let Some((ecosystem, content)) = self.detect(ctx).await? else {
            debug!("No dependency manifest in workspace");
            return Ok(None);
        };
        let hash = content_hash(content.as_bytes());
        if !force && previous.is_some_and(|p| p.hash == hash && p.path == ecosystem.manifest_path()) {
            debug!("Manifest unchanged");
            return Ok(None);
        }

        let timed = TimedSpan::new(deps_span(ctx.app_id.as_str(), ecosystem.as_str()));
        let declared = ecosystem.parse_manifest(&content)?;
        let installed = self.inventory(ctx, ecosystem).await?;
        let previous_packages = previous
            .filter(|p| p.path == ecosystem.manifest_path())
            .map(|p| &p.packages);
        let changes = plan_changes(ecosystem, &declared, previous_packages, &installed);
        info!(
            "{} manifest changed: {} package changes",
            ecosystem.as_str(),
            changes.len()
        );

        let workdir = self.container_workspace.clone();
        let installs: Vec<String> = changes
            .iter()
            .filter(|(_, action)| *action != PackageAction::Remove)
            .map(|(name, _)| name.clone())
            .collect();
        let removals: Vec<String> = changes
            .iter()
            .filter(|(_, action)| *action == PackageAction::Remove)
            .map(|(name, _)| name.clone())
            .collect();

        let mut outcomes = self
            .run_batch(ctx, &installs, |names| {
                let specs: Vec<(&str, &str)> = names
                    .iter()
                    .map(|n| (n.as_str(), declared.get(n).map(String::as_str).unwrap_or("")))
                    .collect();
                ecosystem.install_command(&workdir, &specs)
            })
            .await?;
        outcomes.extend(
            self.run_batch(ctx, &removals, |names| {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                ecosystem.uninstall_command(&workdir, &names)
            })
            .await?,
        );

        let packages = changes
            .into_iter()
            .filter_map(|(name, action)| {
                outcomes
                    .remove(&name)
                    .map(|outcome| (name, PackageResult { action, outcome }))
            })
            .collect();

        let installed = if outcomes_changed(&installs, &removals) {
            self.inventory(ctx, ecosystem).await.unwrap_or(installed)
        } else {
            installed
        };

        let report = InstallReport {
            ecosystem,
            manifest: DeclaredManifest {
                path: ecosystem.manifest_path().to_string(),
                hash,
                packages: declared.clone(),
            },
            dependencies: merge_set(&declared, &installed),
            packages,
        };
        timed.complete();
        Ok(Some(report))
    }
}

fn outcomes_changed(installs: &[String], removals: &[String]) -> bool {
    !installs.is_empty() || !removals.is_empty()
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
}

fn merge_set(declared: &BTreeMap<String, String>, installed: &BTreeMap<String, String>) -> DependencySet {
    declared
        .iter()
        .map(|(name, constraint)| {
            (
                name.clone(),
                DependencyStatus {
                    requested: Some(constraint.clone()),
                    installed: installed.get(name).cloned(),
                },
            )
        })
        .collect()
}
