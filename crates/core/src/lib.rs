//! Core library for the cradle application container lifecycle manager
//!
//! The [`manager::Manager`] orchestrates per-application containers through a
//! container runtime adapter, keeps their workspaces in sync with object
//! storage, resolves declared dependencies, multiplexes container logs and
//! brokers language server sessions.

pub mod application;
pub mod auth;
pub mod config;
pub mod deps;
pub mod docker;
pub mod errors;
pub mod logging;
pub mod logs;
pub mod lsp;
pub mod manager;
pub mod observability;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod sync;
pub mod workspace;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
