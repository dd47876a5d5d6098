//! Dependency resolution against a mock package manager

mod common;

use common::{eventually, user, Harness};
use cradle_core::deps::{Ecosystem, PackageAction};
use cradle_core::errors::CradleError;
use cradle_core::runtime::mock::MockExecResponse;
use cradle_core::sync::ItemOutcome;
use std::time::Duration;

const NPM_LS: &str = "npm ls --json --depth=0 --prefix /workspace";

const PACKAGE_JSON: &str = r#"{
  "name": "demo",
  "dependencies": {
    "express": "^4.18.0",
    "zod": "^3.22.0"
  }
}"#;

fn installs(h: &Harness) -> Vec<String> {
    h.runtime
        .exec_history()
        .into_iter()
        .map(|(_, command)| command.join(" "))
        .filter(|command| command.starts_with("npm install"))
        .collect()
}

#[tokio::test]
async fn test_install_missing_packages_once() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager
        .write_file(&alice, &app.app_id, "package.json", PACKAGE_JSON.into())
        .await
        .unwrap();
    h.manager.start(&alice, &app.app_id).await.unwrap();
    h.runtime.set_exec_response(
        NPM_LS,
        MockExecResponse::ok(r#"{"dependencies":{"express":{"version":"4.19.2"}}}"#),
    );

    let (ecosystem, set) = h
        .manager
        .dependencies(&alice, &app.app_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ecosystem, Ecosystem::Npm);
    assert_eq!(set["express"].installed.as_deref(), Some("4.19.2"));
    assert_eq!(set["zod"].requested.as_deref(), Some("^3.22.0"));
    assert!(set["zod"].installed.is_none());

    let report = h
        .manager
        .install_dependencies(&alice, &app.app_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.packages.len(), 1);
    assert_eq!(report.packages["zod"].action, PackageAction::Install);
    assert_eq!(report.packages["zod"].outcome, ItemOutcome::Ok);
    assert_eq!(
        installs(&h),
        vec!["npm install --no-save --prefix /workspace zod@^3.22.0".to_string()]
    );

    let recorded = h.manager.get(&alice, &app.app_id).unwrap().manifest.unwrap();
    assert_eq!(recorded.path, "package.json");
    assert_eq!(recorded.packages.len(), 2);

    // Unchanged manifest: nothing to do
    assert!(h
        .manager
        .install_dependencies(&alice, &app.app_id, false)
        .await
        .unwrap()
        .is_none());
    assert_eq!(installs(&h).len(), 1);
}

#[tokio::test]
async fn test_failed_package_is_attributed_and_manifest_not_recorded() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager
        .write_file(
            &alice,
            &app.app_id,
            "package.json",
            r#"{"dependencies":{"left-pad":"1.3.0","no-such-pkg":"^9.9.9"}}"#.into(),
        )
        .await
        .unwrap();
    h.manager.start(&alice, &app.app_id).await.unwrap();
    h.runtime
        .set_exec_response(NPM_LS, MockExecResponse::ok(r#"{"dependencies":{}}"#));
    h.runtime.set_exec_response(
        "npm install --no-save --prefix /workspace left-pad@1.3.0 no-such-pkg@^9.9.9",
        MockExecResponse::failed(1, "npm ERR! 404 Not Found - no-such-pkg"),
    );
    h.runtime.set_exec_response(
        "npm install --no-save --prefix /workspace no-such-pkg@^9.9.9",
        MockExecResponse::failed(1, "npm ERR! 404 Not Found - no-such-pkg"),
    );

    let report = h
        .manager
        .install_dependencies(&alice, &app.app_id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.failed(), 1);
    assert_eq!(report.packages["left-pad"].outcome, ItemOutcome::Ok);
    match &report.packages["no-such-pkg"].outcome {
        ItemOutcome::Failed { reason } => assert!(reason.contains("404"), "{reason}"),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(h.manager.get(&alice, &app.app_id).unwrap().manifest.is_none());

    // Not recorded, so the next run retries
    assert!(h
        .manager
        .install_dependencies(&alice, &app.app_id, false)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_no_manifest_is_a_no_op() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager.start(&alice, &app.app_id).await.unwrap();
    assert!(h
        .manager
        .install_dependencies(&alice, &app.app_id, true)
        .await
        .unwrap()
        .is_none());
    assert!(installs(&h).is_empty());
}

#[tokio::test]
async fn test_install_requires_running_container() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager
        .write_file(&alice, &app.app_id, "package.json", PACKAGE_JSON.into())
        .await
        .unwrap();
    assert!(matches!(
        h.manager.install_dependencies(&alice, &app.app_id, false).await,
        Err(CradleError::ContainerUnavailable { .. })
    ));
}

#[tokio::test]
async fn test_delete_during_install_cancels_it() {
    let h = Harness::new();
    let alice = user("alice");
    let app = h.create(&alice, "demo").await;
    h.manager
        .write_file(&alice, &app.app_id, "package.json", PACKAGE_JSON.into())
        .await
        .unwrap();
    h.manager.start(&alice, &app.app_id).await.unwrap();
    h.runtime.set_exec_response(
        NPM_LS,
        MockExecResponse::ok(r#"{"dependencies":{"express":{"version":"4.19.2"}}}"#),
    );
    h.runtime.set_exec_response(
        "npm install --no-save --prefix /workspace zod@^3.22.0",
        MockExecResponse {
            delay: Some(Duration::from_secs(30)),
            ..MockExecResponse::ok("")
        },
    );

    let deleting = async {
        assert!(eventually(|| !installs(&h).is_empty()).await);
        tokio::time::timeout(
            Duration::from_secs(1),
            h.manager.delete(&alice, &app.app_id, false),
        )
        .await
    };
    let (installed, deleted) = tokio::join!(
        h.manager.install_dependencies(&alice, &app.app_id, false),
        deleting
    );

    deleted.expect("delete waited for the install").unwrap();
    assert!(matches!(
        installed,
        Err(CradleError::Cancelled {
            operation: "install_dependencies",
            ..
        })
    ));
    assert!(matches!(
        h.manager.get(&alice, &app.app_id),
        Err(CradleError::NotFound { .. })
    ));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(installs(&h).len(), 1);
}
