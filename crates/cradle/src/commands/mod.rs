//! Command implementations
//!
//! Simple lifecycle commands are handled inline by `cli`; the modules here
//! cover commands with their own I/O.

pub mod deps;
pub mod files;
pub mod logs;
pub mod lsp;

use anyhow::Result;
use cradle_core::application::Application;
use cradle_core::manager::LifecycleOutcome;
use serde::Serialize;

/// Renders results as text or JSON on stdout; warnings go to stderr in text mode
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Print `value` as JSON, or the text produced by `text`
    pub fn message<T, F>(&self, value: &T, text: F) -> Result<()>
    where
        T: Serialize,
        F: FnOnce() -> String,
    {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            let text = text();
            if !text.is_empty() {
                println!("{}", text);
            }
        }
        Ok(())
    }

    pub fn app(&self, app: &Application) -> Result<()> {
        self.message(app, || app_line(app))
    }

    pub fn apps(&self, apps: &[Application]) -> Result<()> {
        self.message(&apps, || {
            apps.iter().map(app_line).collect::<Vec<_>>().join("\n")
        })
    }

    pub fn outcome(&self, outcome: &LifecycleOutcome) -> Result<()> {
        if !self.json {
            for warning in &outcome.warnings {
                eprintln!("warning: {}", warning);
            }
        }
        self.message(outcome, || {
            let mut text = app_line(&outcome.app);
            if let Some(sync) = &outcome.sync {
                text.push_str(&format!(
                    "\nsynced: {} pulled, {} pushed, {} deleted",
                    sync.pulled.len(),
                    sync.pushed.len(),
                    sync.deleted_in_container.len() + sync.deleted_in_storage.len()
                ));
                for (path, reason) in &sync.failures {
                    text.push_str(&format!("\nfailed: {}: {}", path, reason));
                }
            }
            text
        })
    }
}

fn app_line(app: &Application) -> String {
    let mut line = format!("{}  {:<8}  {}  {}", app.app_id, app.status, app.name, app.image);
    if let Some(error) = &app.last_error {
        line.push_str(&format!("  ({})", error));
    }
    line
}
