//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use cradle_core::application::{AppId, Application};
use cradle_core::auth::Identity;
use cradle_core::config::ManagerConfig;
use cradle_core::manager::Manager;
use cradle_core::runtime::mock::{MockRuntime, MockRuntimeConfig};
use cradle_core::state::StateStore;
use cradle_core::storage::mock::MockObjectStore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration rooted in `root` with timeouts short enough for tests
pub fn test_config(root: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::rooted_at(root);
    config.runtime.start_timeout = Duration::from_millis(300);
    config.runtime.readiness_interval = Duration::from_millis(10);
    config
}

pub fn user(name: &str) -> Identity {
    Identity::local(name)
}

/// Manager over mock adapters and a persistent state directory
pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<MockRuntime>,
    pub store: Arc<MockObjectStore>,
    pub manager: Manager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockRuntimeConfig::default(), |_| {})
    }

    pub fn with<F>(runtime: MockRuntimeConfig, adjust: F) -> Self
    where
        F: FnOnce(&mut ManagerConfig),
    {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let runtime = Arc::new(MockRuntime::with_config(runtime));
        let store = Arc::new(MockObjectStore::new());
        let manager = build(&config, &runtime, &store);
        Self {
            dir,
            runtime,
            store,
            manager,
        }
    }

    /// A second manager over the same adapters and state directory
    pub fn reopen(&self) -> Manager {
        build(self.manager.config(), &self.runtime, &self.store)
    }

    /// Host path of `path` inside the application's workspace
    pub fn workspace_file(&self, app_id: &AppId, path: &str) -> PathBuf {
        self.manager
            .config()
            .workspace_root
            .join(app_id.as_str())
            .join(path)
    }

    pub async fn create(&self, identity: &Identity, name: &str) -> Application {
        self.manager
            .create(identity, name, "node:20", BTreeMap::new())
            .await
            .unwrap()
    }
}

fn build(config: &ManagerConfig, runtime: &Arc<MockRuntime>, store: &Arc<MockObjectStore>) -> Manager {
    Manager::with_components(
        config.clone(),
        runtime.clone(),
        store.clone(),
        Some(StateStore::new(&config.state_dir)),
    )
    .unwrap()
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
