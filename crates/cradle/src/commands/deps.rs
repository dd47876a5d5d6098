//! `cradle deps`

use super::Output;
use anyhow::Result;
use cradle_core::application::AppId;
use cradle_core::auth::Identity;
use cradle_core::deps::DependencySet;
use cradle_core::errors::CradleError;
use cradle_core::manager::Manager;
use cradle_core::sync::ItemOutcome;

fn render_set(dependencies: &DependencySet) -> String {
    dependencies
        .iter()
        .map(|(name, status)| {
            format!(
                "{:<30}  {:<15}  {}",
                name,
                status.requested.as_deref().unwrap_or("-"),
                status.installed.as_deref().unwrap_or("-")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn execute(
    manager: &Manager,
    identity: &Identity,
    out: &Output,
    app_id: AppId,
    force: bool,
    show: bool,
) -> Result<()> {
    if show {
        let set = manager.dependencies(identity, &app_id).await?;
        return out.message(&set, || match &set {
            Some((ecosystem, dependencies)) => {
                format!("{}\n{}", ecosystem.as_str(), render_set(dependencies))
            }
            None => "No dependency manifest".to_string(),
        });
    }

    let report = manager.install_dependencies(identity, &app_id, force).await?;
    out.message(&report, || match &report {
        None => "Dependencies up to date".to_string(),
        Some(report) => report
            .packages
            .iter()
            .map(|(name, result)| {
                let action = serde_json::to_value(result.action)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                match &result.outcome {
                    ItemOutcome::Ok => format!("{:<8} {}", action, name),
                    ItemOutcome::Failed { reason } => {
                        format!("{:<8} {} failed: {}", action, name, reason)
                    }
                }
            })
            .collect::<Vec<_>>()
            .join("\n"),
    })?;

    match report.filter(|r| r.failed() > 0) {
        Some(report) => Err(CradleError::PartialBatchFailure {
            app_id: app_id.to_string(),
            operation: "install_dependencies",
            failed: report.failed(),
            total: report.packages.len(),
        }
        .into()),
        None => Ok(()),
    }
}
