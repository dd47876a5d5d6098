//! Keyed application store with per-application exclusion
//!
//! [`AppRegistry`] is the only place application records live in memory. Any
//! change to a record needs an [`AppGuard`] for that application, so two
//! state-mutating operations on the same application never interleave while
//! operations on different applications proceed in parallel.

use crate::application::{AppId, Application};
use crate::errors::{CradleError, Result};
use crate::state::StateStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Lazily created async mutex per key
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the entry for `key` when nobody holds or waits on it
    pub fn forget(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

/// Proof of exclusive access to one application
#[derive(Debug)]
pub struct AppGuard {
    app_id: AppId,
    _guard: OwnedMutexGuard<()>,
}

impl AppGuard {
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }
}

/// Map from `appId` to its authoritative record
pub struct AppRegistry {
    apps: RwLock<HashMap<AppId, Application>>,
    locks: KeyedLocks,
    state: Option<StateStore>,
}

impl AppRegistry {
    /// In-memory registry
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            state: None,
        }
    }

    /// Registry backed by `state`, hydrated from its records
    pub fn persistent(state: StateStore) -> Result<Self> {
        let apps = state
            .load_all()?
            .into_iter()
            .map(|app| (app.app_id.clone(), app))
            .collect::<HashMap<_, _>>();
        debug!("Hydrated registry with {} applications", apps.len());
        Ok(Self {
            apps: RwLock::new(apps),
            locks: KeyedLocks::new(),
            state: Some(state),
        })
    }

    pub fn state(&self) -> Option<&StateStore> {
        self.state.as_ref()
    }

    pub async fn lock(&self, app_id: &AppId) -> AppGuard {
        AppGuard {
            app_id: app_id.clone(),
            _guard: self.locks.lock(app_id.as_str()).await,
        }
    }

    /// Snapshot of one record
    pub fn get(&self, app_id: &AppId) -> Option<Application> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app_id)
            .cloned()
    }

    /// Snapshots of every record owned by `user_id`, oldest first
    pub fn list_for(&self, user_id: &str) -> Vec<Application> {
        let mut apps: Vec<Application> = self
            .apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|app| app.user_id == user_id)
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        apps
    }

    /// Persist and publish a record; the guard must belong to the same application
    pub fn commit(&self, guard: &AppGuard, app: &Application) -> Result<()> {
        if guard.app_id != app.app_id {
            return Err(CradleError::State {
                message: format!(
                    "guard for {} cannot commit application {}",
                    guard.app_id, app.app_id
                ),
            });
        }
        if let Some(state) = &self.state {
            state.save_app(app)?;
        }
        self.apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app.app_id.clone(), app.clone());
        Ok(())
    }

    /// Drop a record and its persisted state
    pub fn remove(&self, guard: &AppGuard) -> Result<()> {
        if let Some(state) = &self.state {
            state.remove_app(&guard.app_id)?;
        }
        self.apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&guard.app_id);
        Ok(())
    }

    /// Release the lock entry of a removed application
    pub fn forget_lock(&self, app_id: &AppId) {
        self.locks.forget(app_id.as_str());
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::AppStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn sample(id: &str, user: &str) -> Application {
        Application::new(AppId::from(id), user, "demo", "node:20", BTreeMap::new())
    }

    #[tokio::test]
    async fn test_commit_requires_matching_guard() {
        let registry = AppRegistry::new();
        let app = sample("a1", "alice");
        let guard = registry.lock(&AppId::from("other")).await;
        assert!(registry.commit(&guard, &app).is_err());
        drop(guard);

        let guard = registry.lock(&app.app_id).await;
        registry.commit(&guard, &app).unwrap();
        assert_eq!(registry.get(&app.app_id).unwrap().status, AppStatus::Creating);
        registry.remove(&guard).unwrap();
        assert!(registry.get(&app.app_id).is_none());
    }

    #[tokio::test]
    async fn test_same_app_serializes_other_apps_do_not() {
        let registry = Arc::new(AppRegistry::new());
        let a = AppId::from("a");
        let held = registry.lock(&a).await;

        let other = tokio::time::timeout(Duration::from_millis(100), registry.lock(&AppId::from("b"))).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), registry.lock(&a)).await;
        assert!(same.is_err());
        drop(held);
        assert!(tokio::time::timeout(Duration::from_millis(100), registry.lock(&a))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let registry = AppRegistry::new();
        for (id, user) in [("a1", "alice"), ("b1", "bob"), ("a2", "alice")] {
            let app = sample(id, user);
            let guard = registry.lock(&app.app_id).await;
            registry.commit(&guard, &app).unwrap();
        }
        assert_eq!(registry.list_for("alice").len(), 2);
        assert_eq!(registry.list_for("bob").len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_registry_hydrates() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = sample("a1", "alice");
        {
            let registry = AppRegistry::persistent(StateStore::new(dir.path())).unwrap();
            let guard = registry.lock(&app.app_id).await;
            registry.commit(&guard, &app).unwrap();
        }
        let registry = AppRegistry::persistent(StateStore::new(dir.path())).unwrap();
        assert!(registry.get(&app.app_id).is_some());
    }

    #[test]
    fn test_forget_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let guard = rt.block_on(locks.lock("k"));
        locks.forget("k");
        assert_eq!(locks.locks.lock().unwrap().len(), 1);
        drop(guard);
        locks.forget("k");
        assert!(locks.locks.lock().unwrap().is_empty());
    }
}
