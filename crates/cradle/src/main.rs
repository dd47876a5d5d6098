use anyhow::Result;
use clap::Parser;
use cradle_core::errors::CradleError;

mod cli;
mod commands;

/// Exit code for a caller that may not act on the application
const EXIT_UNAUTHORIZED: i32 = 3;
/// Exit code for rejected input
const EXIT_INVALID_SPEC: i32 = 2;
/// Exit code when some items of a batch failed
const EXIT_PARTIAL: i32 = 4;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            let code = err.downcast_ref::<CradleError>().and_then(|e| match e.root() {
                CradleError::Unauthorized { .. } => Some(EXIT_UNAUTHORIZED),
                CradleError::InvalidSpec { .. } => Some(EXIT_INVALID_SPEC),
                CradleError::PartialBatchFailure { .. } => Some(EXIT_PARTIAL),
                _ => None,
            });
            match code {
                Some(code) => {
                    eprintln!("Error: {:#}", err);
                    std::process::exit(code);
                }
                None => Err(err),
            }
        }
    }
}
