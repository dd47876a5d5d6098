//! `cradle files` subcommands

use super::Output;
use crate::cli::FilesCommand;
use anyhow::{Context, Result};
use bytes::Bytes;
use cradle_core::application::{AppId, Location};
use cradle_core::auth::Identity;
use cradle_core::manager::Manager;
use cradle_core::sync::ItemOutcome;
use std::io::{Read, Write};
use std::path::Path;

/// File content from `--from` or stdin
fn content(from: Option<&Path>) -> Result<Bytes> {
    match from {
        Some(path) => std::fs::read(path)
            .map(Bytes::from)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            Ok(Bytes::from(buf))
        }
    }
}

fn location(location: Location) -> &'static str {
    match location {
        Location::ContainerOnly => "container",
        Location::StorageOnly => "storage",
        Location::Both => "both",
    }
}

pub async fn execute(
    manager: &Manager,
    identity: &Identity,
    out: &Output,
    command: FilesCommand,
) -> Result<()> {
    match command {
        FilesCommand::Ls { app } => {
            let files = manager.list_files(identity, &AppId::from(app)).await?;
            out.message(&files, || {
                files
                    .iter()
                    .map(|f| format!("{:<9}  {:>8}  {}", location(f.location), f.size, f.path))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        FilesCommand::Read { app, path } => {
            let data = manager.read_file(identity, &AppId::from(app), &path).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
            Ok(())
        }
        FilesCommand::Write { app, path, from } => {
            let data = content(from.as_deref())?;
            let entry = manager
                .write_file(identity, &AppId::from(app), &path, data)
                .await?;
            out.message(&entry, || format!("Wrote {} ({} bytes)", entry.path, entry.size))
        }
        FilesCommand::Create { app, path, from } => {
            let data = content(from.as_deref())?;
            let entry = manager
                .create_file(identity, &AppId::from(app), &path, data)
                .await?;
            out.message(&entry, || format!("Created {}", entry.path))
        }
        FilesCommand::Rm { app, paths } => {
            let app_id = AppId::from(app);
            let report = manager.delete_files(identity, &app_id, &paths).await?;
            out.message(&report, || {
                report
                    .results
                    .iter()
                    .map(|(path, outcome)| match outcome {
                        ItemOutcome::Ok => format!("removed  {}", path),
                        ItemOutcome::Failed { reason } => format!("failed   {}: {}", path, reason),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            match report.failure(&app_id, "delete_files") {
                Some(failure) => Err(failure.into()),
                None => Ok(()),
            }
        }
        FilesCommand::Mv { app, from, to } => {
            let entry = manager
                .rename_file(identity, &AppId::from(app), &from, &to)
                .await?;
            out.message(&entry, || format!("Renamed {} -> {}", from, entry.path))
        }
    }
}
