//! Lifecycle integration tests over the mock runtime and object store
//!
//! These exercise the manager end to end without a container engine.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{user, Harness};
use cradle_core::application::{AppId, AppStatus};
use cradle_core::auth::Identity;
use cradle_core::errors::{CradleError, Warning};
use cradle_core::runtime::mock::MockRuntimeConfig;
use cradle_core::runtime::ContainerRuntime;
use std::collections::BTreeMap;

#[tokio::test]
async fn test_create_start_stop() {
    let h = Harness::new();
    let alice = user("alice");

    let app = h.create(&alice, "demo").await;
    assert_eq!(app.status, AppStatus::Stopped);
    let container_id = app.container_id.clone().unwrap();
    let container = h.runtime.container(&container_id).unwrap();
    assert_eq!(container.state, "created");
    assert_eq!(
        container.spec.env.get("CRADLE_APP_ID").map(String::as_str),
        Some(app.app_id.as_str())
    );
    assert_eq!(container.spec.mounts[0].target, "/workspace");

    let outcome = h.manager.start(&alice, &app.app_id).await.unwrap();
    assert_eq!(outcome.app.status, AppStatus::Running);
    assert!(outcome.app.last_started_at.is_some());
    assert_eq!(h.runtime.running_for_app(app.app_id.as_str()), 1);

    // Starting a running application is a no-op
    let again = h.manager.start(&alice, &app.app_id).await.unwrap();
    assert_eq!(again.app.container_id, outcome.app.container_id);

    let stopped = h.manager.stop(&alice, &app.app_id).await.unwrap();
    assert_eq!(stopped.app.status, AppStatus::Stopped);
    assert!(stopped.warnings.is_empty());
    assert_eq!(h.runtime.running_for_app(app.app_id.as_str()), 0);
    assert_eq!(
        h.manager.get(&alice, &app.app_id).unwrap().status,
        AppStatus::Stopped
    );
}

#[tokio::test]
async fn test_concurrent_starts_run_one_container() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;

    let (first, second) = tokio::join!(
        h.manager.start(&alice, &app.app_id),
        h.manager.start(&alice, &app.app_id)
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.app.status, AppStatus::Running);
    assert_eq!(second.app.status, AppStatus::Running);
    assert_eq!(first.app.container_id, second.app.container_id);
    assert_eq!(h.runtime.running_for_app(app.app_id.as_str()), 1);
    assert_eq!(h.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_restart_keeps_container() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();

    let outcome = h.manager.restart(&alice, &app.app_id).await.unwrap();
    assert_eq!(outcome.app.status, AppStatus::Running);
    assert_eq!(outcome.app.container_id, app.container_id);
    assert_eq!(h.runtime.running_for_app(app.app_id.as_str()), 1);
}

#[tokio::test]
async fn test_start_recreates_missing_container() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    let old = app.container_id.clone().unwrap();
    h.runtime.remove_container(&old).await.unwrap();

    let outcome = h.manager.start(&alice, &app.app_id).await.unwrap();
    let new = outcome.app.container_id.unwrap();
    assert_ne!(new, old);
    assert_eq!(h.runtime.container(&new).unwrap().state, "running");
}

#[tokio::test]
async fn test_startup_timeout_then_recovery() {
    let h = Harness::with(
        MockRuntimeConfig {
            never_running: true,
            ..MockRuntimeConfig::default()
        },
        |_| {},
    );
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;

    let err = h.manager.start(&alice, &app.app_id).await.unwrap_err();
    assert!(matches!(err, CradleError::StartupTimeout { .. }), "{err}");
    let failed = h.manager.get(&alice, &app.app_id).unwrap();
    assert_eq!(failed.status, AppStatus::Error);
    assert!(failed.last_error.unwrap().contains("did not become ready"));

    h.runtime.update_config(|c| c.never_running = false);
    let outcome = h.manager.start(&alice, &app.app_id).await.unwrap();
    assert_eq!(outcome.app.status, AppStatus::Running);
    assert!(outcome.app.last_error.is_none());
}

#[tokio::test]
async fn test_exhausted_runtime_reports_resource_exhausted() {
    let h = Harness::with(
        MockRuntimeConfig {
            exhausted: true,
            ..MockRuntimeConfig::default()
        },
        |_| {},
    );
    let alice = user("alice");
    let err = h
        .manager
        .create(&alice, "demo", "node:20", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CradleError::ResourceExhausted { .. }), "{err}");

    let apps = h.manager.list(&alice).unwrap();
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status, AppStatus::Error);
    assert!(apps[0].container_id.is_none());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_invalid_request_leaves_no_record() {
    let h = Harness::new();
    let alice = user("alice");
    let err = h
        .manager
        .create(&alice, "demo", "Not An Image", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CradleError::InvalidSpec { .. }));
    assert!(h.manager.list(&alice).unwrap().is_empty());
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_foreign_or_expired_identity_is_unauthorized() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;

    let mallory = user("mallory");
    assert!(matches!(
        h.manager.start(&mallory, &app.app_id).await,
        Err(CradleError::Unauthorized { .. })
    ));
    assert!(matches!(
        h.manager.delete(&mallory, &app.app_id, true).await,
        Err(CradleError::Unauthorized { .. })
    ));
    assert!(h.manager.list(&mallory).unwrap().is_empty());

    let expired = Identity::new("alice", Utc::now() - ChronoDuration::seconds(1));
    assert!(matches!(
        h.manager.get(&expired, &app.app_id),
        Err(CradleError::Unauthorized { .. })
    ));
    assert!(matches!(
        h.manager.list(&expired),
        Err(CradleError::Unauthorized { .. })
    ));
    assert_eq!(
        h.manager.get(&alice, &app.app_id).unwrap().status,
        AppStatus::Stopped
    );
}

#[tokio::test]
async fn test_malformed_user_id_cannot_create() {
    let h = Harness::new();
    for name in ["alice/app1", ".staging", "../bob"] {
        let err = h
            .manager
            .create(&user(name), "demo", "node:20", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CradleError::Unauthorized { .. }), "{name}: {err}");
    }
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.manager.list(&user("alice")).unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_with_storage_down_warns_and_stops() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();
    std::fs::write(h.workspace_file(&app.app_id, "index.js"), "console.log(1)").unwrap();

    h.store.set_unavailable(true);
    let outcome = h.manager.stop(&alice, &app.app_id).await.unwrap();
    assert_eq!(outcome.app.status, AppStatus::Stopped);
    assert!(matches!(
        outcome.warnings.as_slice(),
        [Warning::SyncOnStopFailed { .. }]
    ));
    assert_eq!(h.runtime.running_for_app(app.app_id.as_str()), 0);

    // The file is still in the workspace and reaches storage on the next sync
    h.store.set_unavailable(false);
    let synced = h.manager.sync(&alice, &app.app_id).await.unwrap();
    assert_eq!(synced.sync.unwrap().pushed, vec!["index.js".to_string()]);
    assert!(h.store.contents(&app.storage_prefix, "index.js").is_some());
}

#[tokio::test]
async fn test_delete_with_purge_is_idempotent() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();
    h.manager
        .write_file(&alice, &app.app_id, "a.txt", "hello".into())
        .await
        .unwrap();
    assert!(h.store.contents(&app.storage_prefix, "a.txt").is_some());

    h.manager.delete(&alice, &app.app_id, true).await.unwrap();
    assert_eq!(h.runtime.container_count(), 0);
    assert!(h.store.contents(&app.storage_prefix, "a.txt").is_none());
    assert!(!h.workspace_file(&app.app_id, "").exists());
    assert!(matches!(
        h.manager.get(&alice, &app.app_id),
        Err(CradleError::NotFound { .. })
    ));

    h.manager.delete(&alice, &app.app_id, true).await.unwrap();
    h.manager
        .delete(&alice, &AppId::from("never-existed"), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_without_purge_keeps_storage() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager
        .write_file(&alice, &app.app_id, "keep.txt", "data".into())
        .await
        .unwrap();

    h.manager.delete(&alice, &app.app_id, false).await.unwrap();
    assert_eq!(
        h.store.contents(&app.storage_prefix, "keep.txt").unwrap(),
        "data"
    );
}

#[tokio::test]
async fn test_health_check_detects_crash() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    let running = h.manager.start(&alice, &app.app_id).await.unwrap().app;

    let healthy = h.manager.check_health(&alice, &app.app_id).await.unwrap();
    assert_eq!(healthy.status, AppStatus::Running);

    h.runtime.crash(running.container_id.as_deref().unwrap());
    let crashed = h.manager.check_health(&alice, &app.app_id).await.unwrap();
    assert_eq!(crashed.status, AppStatus::Error);
    assert_eq!(
        crashed.last_error.as_deref(),
        Some("container exited unexpectedly")
    );

    let recovered = h.manager.start(&alice, &app.app_id).await.unwrap();
    assert_eq!(recovered.app.status, AppStatus::Running);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();

    let reopened = h.reopen();
    let loaded = reopened.get(&alice, &app.app_id).unwrap();
    assert_eq!(loaded.status, AppStatus::Running);
    assert_eq!(loaded.container_id, app.container_id);
    assert_eq!(reopened.list(&alice).unwrap().len(), 1);

    let stopped = reopened.stop(&alice, &app.app_id).await.unwrap();
    assert_eq!(stopped.app.status, AppStatus::Stopped);
}

#[tokio::test]
async fn test_list_is_scoped_to_owner() {
    let h = Harness::new();
    let alice = user("alice");
    let bob = user("bob");
    let first = h.create(&alice, "one").await;
    let second = h.create(&alice, "two").await;
    h.create(&bob, "three").await;

    let ids: Vec<String> = h
        .manager
        .list(&alice)
        .unwrap()
        .into_iter()
        .map(|app| app.app_id.to_string())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.app_id.to_string()));
    assert!(ids.contains(&second.app_id.to_string()));
    assert_eq!(h.manager.list(&bob).unwrap().len(), 1);
}
