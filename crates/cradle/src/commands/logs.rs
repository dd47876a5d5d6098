//! `cradle logs`

use super::Output;
use anyhow::Result;
use cradle_core::application::{AppId, LogEntry, LogStream};
use cradle_core::auth::Identity;
use cradle_core::manager::Manager;
use std::io::Write;
use std::time::Duration;

/// Without `--follow`, stop once no entry arrived for this long
const DRAIN_IDLE: Duration = Duration::from_millis(500);

fn print_entry(out: &Output, entry: &LogEntry) -> Result<()> {
    if out.is_json() {
        println!("{}", serde_json::to_string(entry)?);
        return Ok(());
    }
    let payload = String::from_utf8_lossy(&entry.payload);
    match entry.stream {
        LogStream::Stdout => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", payload)?;
            stdout.flush()?;
        }
        LogStream::Stderr => eprintln!("{}", payload),
    }
    Ok(())
}

pub async fn execute(
    manager: &Manager,
    identity: &Identity,
    out: &Output,
    app_id: AppId,
    from: u64,
    follow: bool,
) -> Result<()> {
    let mut subscription = manager.subscribe_logs(identity, &app_id, from).await?;
    let mut last_seq = None;
    loop {
        let next = if follow {
            subscription.next().await
        } else {
            match tokio::time::timeout(DRAIN_IDLE, subscription.next()).await {
                Ok(next) => next,
                Err(_) => break,
            }
        };
        let Some(entry) = next else {
            break;
        };
        if let Some(last) = last_seq {
            if entry.seq > last + 1 {
                tracing::warn!("Skipped {} log entries", entry.seq - last - 1);
            }
        }
        last_seq = Some(entry.seq);
        print_entry(out, &entry)?;
    }
    Ok(())
}
