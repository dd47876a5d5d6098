//! `cradle lsp`: stdio bridge to an application's language server
//!
//! An editor can use `cradle lsp <app>` as its language server command.

use anyhow::Result;
use bytes::Bytes;
use cradle_core::application::AppId;
use cradle_core::auth::Identity;
use cradle_core::manager::Manager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub async fn execute(manager: &Manager, identity: &Identity, app_id: AppId) -> Result<()> {
    let client = manager.attach_lsp(identity, &app_id).await?;
    tracing::info!(session_id = client.session_id, "Language server attached");

    let to_server = client.to_server;
    let mut from_server = client.from_server;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; manager.config().lsp.chunk_size];
    // Dropping the sender tells the relay the editor went away
    let mut to_server = Some(to_server);

    loop {
        tokio::select! {
            read = stdin.read(&mut buf), if to_server.is_some() => match read {
                Ok(0) | Err(_) => {
                    to_server = None;
                }
                Ok(n) => {
                    let sent = match &to_server {
                        Some(sender) => sender.send(Bytes::copy_from_slice(&buf[..n])).await.is_ok(),
                        None => false,
                    };
                    if !sent {
                        break;
                    }
                }
            },
            chunk = from_server.recv() => match chunk {
                Some(chunk) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
        }
    }
    tracing::info!("Language server session ended");
    Ok(())
}
