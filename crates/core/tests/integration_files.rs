//! File synchronization through the manager

mod common;

use chrono::{Duration, Utc};
use common::{user, Harness};
use cradle_core::application::Location;
use cradle_core::errors::{CradleError, SyncError};
use cradle_core::sync::ItemOutcome;

#[tokio::test]
async fn test_first_start_pulls_storage() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    let old = Utc::now() - Duration::minutes(5);
    h.store
        .seed(&app.storage_prefix, "src/index.js", b"console.log('hi')", old);
    h.store.seed(&app.storage_prefix, "package.json", b"{}", old);

    let outcome = h.manager.start(&alice, &app.app_id).await.unwrap();
    let report = outcome.sync.unwrap();
    assert_eq!(
        report.pulled,
        vec!["package.json".to_string(), "src/index.js".to_string()]
    );
    assert!(report.pushed.is_empty());
    assert_eq!(
        std::fs::read_to_string(h.workspace_file(&app.app_id, "src/index.js")).unwrap(),
        "console.log('hi')"
    );
    assert_eq!(h.store.put_count(), 0);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.store.seed(
        &app.storage_prefix,
        "remote.txt",
        b"from storage",
        Utc::now() - Duration::minutes(1),
    );
    h.manager.start(&alice, &app.app_id).await.unwrap();
    std::fs::write(h.workspace_file(&app.app_id, "local.txt"), "from container").unwrap();

    let first = h.manager.sync(&alice, &app.app_id).await.unwrap().sync.unwrap();
    assert_eq!(first.pushed, vec!["local.txt".to_string()]);
    assert!(first.pulled.is_empty());

    let second = h.manager.sync(&alice, &app.app_id).await.unwrap().sync.unwrap();
    assert_eq!(second.changes(), 0);
    assert!(second.failures.is_empty());

    let files = h.manager.list_files(&alice, &app.app_id).await.unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.location == Location::Both));
}

#[tokio::test]
async fn test_container_delete_wins_over_storage_copy() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.store.seed(
        &app.storage_prefix,
        "a.txt",
        b"v1",
        Utc::now() - Duration::minutes(1),
    );
    h.manager.start(&alice, &app.app_id).await.unwrap();
    std::fs::remove_file(h.workspace_file(&app.app_id, "a.txt")).unwrap();

    let report = h.manager.sync(&alice, &app.app_id).await.unwrap().sync.unwrap();
    assert_eq!(report.deleted_in_storage, vec!["a.txt".to_string()]);
    assert!(h.store.contents(&app.storage_prefix, "a.txt").is_none());

    let again = h.manager.sync(&alice, &app.app_id).await.unwrap().sync.unwrap();
    assert_eq!(again.changes(), 0);
}

#[tokio::test]
async fn test_batch_delete_reports_each_path() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();
    for path in ["a", "b", "c"] {
        h.manager
            .write_file(&alice, &app.app_id, path, "x".into())
            .await
            .unwrap();
    }
    h.store.lock_path("b");

    let paths: Vec<String> = ["a", "b", "c"].iter().map(|p| p.to_string()).collect();
    let report = h
        .manager
        .delete_files(&alice, &app.app_id, &paths)
        .await
        .unwrap();
    assert_eq!(report.results["a"], ItemOutcome::Ok);
    assert_eq!(report.results["c"], ItemOutcome::Ok);
    assert!(matches!(report.results["b"], ItemOutcome::Failed { .. }));
    assert_eq!(report.failed(), 1);

    let remaining: Vec<String> = h
        .manager
        .list_files(&alice, &app.app_id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(remaining, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_file_operations_on_stopped_app() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;

    let created = h
        .manager
        .create_file(&alice, &app.app_id, "notes/todo.md", "- ship".into())
        .await
        .unwrap();
    assert_eq!(created.location, Location::Both);
    let err = h
        .manager
        .create_file(&alice, &app.app_id, "notes/todo.md", "again".into())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CradleError::Sync(SyncError::AlreadyExists { .. })
    ));

    let renamed = h
        .manager
        .rename_file(&alice, &app.app_id, "notes/todo.md", "notes/done.md")
        .await
        .unwrap();
    assert_eq!(renamed.path, "notes/done.md");
    assert!(h.store.contents(&app.storage_prefix, "notes/todo.md").is_none());
    assert_eq!(
        h.manager
            .read_file(&alice, &app.app_id, "notes/done.md")
            .await
            .unwrap(),
        "- ship"
    );

    // Starting afterwards finds the workspace in sync
    let outcome = h.manager.start(&alice, &app.app_id).await.unwrap();
    assert_eq!(outcome.sync.unwrap().changes(), 0);
}

#[tokio::test]
async fn test_read_falls_back_to_storage() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.store
        .seed(&app.storage_prefix, "only-remote.txt", b"remote", Utc::now());

    let data = h
        .manager
        .read_file(&alice, &app.app_id, "only-remote.txt")
        .await
        .unwrap();
    assert_eq!(data, "remote");

    let files = h.manager.list_files(&alice, &app.app_id).await.unwrap();
    assert_eq!(files[0].location, Location::StorageOnly);
}
