//! Package operations against a fake interpreter and a stub index.

#![cfg(unix)]

mod common;

use common::{dead_index_url, fixture, handle, spawn_index, Fixture};
use env_core::session::ManagerHandle;
use env_core::{CancellationToken, EnvSpec, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn active_env(fx: &Fixture, mgr: &ManagerHandle, name: &str) {
    let cancel = CancellationToken::new();
    mgr.create_environment(name, EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    mgr.activate_environment(name).await.unwrap();
}

#[tokio::test]
async fn test_operations_need_an_active_environment() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let err = mgr
        .install_packages(&names(&["requests"]), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveEnvironment);
    let err = mgr.list_installed_packages(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveEnvironment);
    let err = mgr.save_requirements(None, true, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveEnvironment);
    let err = mgr.update_packages(None, &cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoActiveEnvironment);
}

#[tokio::test]
async fn test_install_then_list_includes_package() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    let before = mgr.list_installed_packages(&cancel).await.unwrap();
    assert!(!before.iter().any(|p| p.name == "requests"));

    let result = mgr
        .install_packages(&names(&["requests", "six==1.16.0"]), &cancel)
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.output.contains("Successfully installed requests-1.0.0"));
    let changed: Vec<&str> = result.changes.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(changed, vec!["requests", "six"]);
    assert_eq!(result.changes[0].from, None);
    assert_eq!(result.changes[0].to.as_deref(), Some("1.0.0"));

    let after = mgr.list_installed_packages(&cancel).await.unwrap();
    let requests = after.iter().find(|p| p.name == "requests").unwrap();
    assert_eq!(requests.installed_version, "1.0.0");
    assert!(after.iter().all(|p| p.available_version.is_none()));
}

#[tokio::test]
async fn test_install_failure_carries_tool_output() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    let err = mgr
        .install_packages(&names(&["broken"]), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubprocessFailure);
    assert!(err
        .details()
        .unwrap_or("")
        .contains("No matching distribution found for broken"));
}

#[tokio::test]
async fn test_uninstall_is_symmetric() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    mgr.install_packages(&names(&["requests"]), &cancel)
        .await
        .unwrap();
    let result = mgr
        .uninstall_packages(&names(&["requests"]), &cancel)
        .await
        .unwrap();
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].to, None);

    let after = mgr.list_installed_packages(&cancel).await.unwrap();
    assert!(!after.iter().any(|p| p.name == "requests"));
}

#[tokio::test]
async fn test_empty_install_is_a_noop() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    let result = mgr.install_packages(&[], &cancel).await.unwrap();
    assert!(result.success);
    assert!(result.changes.is_empty());
}

#[tokio::test]
async fn test_requirements_round_trip() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "source").await;

    mgr.install_packages(&names(&["requests==2.31.0", "idna"]), &cancel)
        .await
        .unwrap();
    let path = mgr.save_requirements(None, true, &cancel).await.unwrap();
    assert_eq!(path, fx.work.join("requirements.txt"));
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "requests==2.31.0\nidna==1.0.0\n");

    active_env(&fx, &mgr, "fresh").await;
    mgr.install_from_requirements(None, &cancel).await.unwrap();

    let mut source: Vec<String> = contents
        .lines()
        .map(|l| l.split("==").next().unwrap().to_string())
        .collect();
    let mut fresh: Vec<String> = mgr
        .list_installed_packages(&cancel)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .filter(|n| n != "pip")
        .collect();
    source.sort();
    fresh.sort();
    assert_eq!(source, fresh);
}

#[tokio::test]
async fn test_requirements_with_only_includes_runs_pip() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;
    std::fs::write(fx.work.join("requirements.txt"), "-r base.txt\n").unwrap();
    std::fs::write(fx.work.join("base.txt"), "requests\n# pinned later\nidna==3.6\n").unwrap();

    let result = mgr.install_from_requirements(None, &cancel).await.unwrap();
    assert!(result.success);
    let mut changed: Vec<&str> = result.changes.iter().map(|c| c.name.as_str()).collect();
    changed.sort();
    assert_eq!(changed, vec!["idna", "requests"]);

    let installed = std::fs::read_to_string(fx.env_dir("dev").join("installed.txt")).unwrap();
    assert!(installed.contains("requests==1.0.0"));
    assert!(installed.contains("idna==3.6"));
}

#[tokio::test]
async fn test_save_without_versions_overwrites() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;
    std::fs::write(fx.work.join("reqs.txt"), "old-content\n").unwrap();

    mgr.install_packages(&names(&["requests"]), &cancel)
        .await
        .unwrap();
    let path = mgr
        .save_requirements(Some(std::path::Path::new("reqs.txt")), false, &cancel)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "requests\n");
}

#[tokio::test]
async fn test_missing_requirements_file() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    let err = mgr
        .install_from_requirements(None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequirementsNotFound);
}

#[tokio::test]
async fn test_check_outdated_is_read_only_and_update_applies() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;

    mgr.install_packages(&names(&["requests", "six"]), &cancel)
        .await
        .unwrap();
    std::fs::write(fx.env_dir("dev").join("outdated.txt"), "requests\n").unwrap();

    let listed = mgr.list_installed_packages(&cancel).await.unwrap();
    let first = mgr.check_outdated_packages(&cancel).await.unwrap();
    let second = mgr.check_outdated_packages(&cancel).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].name, "requests");
    assert_eq!(first[0].available_version.as_deref(), Some("99.0"));
    assert_eq!(mgr.list_installed_packages(&cancel).await.unwrap(), listed);

    let result = mgr.update_packages(None, &cancel).await.unwrap();
    assert!(result.success);
    assert_eq!(result.changes.len(), 1);
    assert_eq!(result.changes[0].name, "requests");
    assert_eq!(result.changes[0].from.as_deref(), Some("1.0.0"));
    assert_eq!(result.changes[0].to.as_deref(), Some("99.0"));

    // Nothing left: success with no changes, not an error.
    assert!(mgr.check_outdated_packages(&cancel).await.unwrap().is_empty());
    let noop = mgr.update_packages(None, &cancel).await.unwrap();
    assert!(noop.success);
    assert!(noop.changes.is_empty());
}

#[tokio::test]
async fn test_update_named_package() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;
    mgr.install_packages(&names(&["six"]), &cancel).await.unwrap();

    let result = mgr.update_packages(Some("Six"), &cancel).await.unwrap();
    assert_eq!(result.changes[0].to.as_deref(), Some("99.0"));

    let err = mgr
        .update_packages(Some("not-installed"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_dependencies_from_installed_metadata() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();
    active_env(&fx, &mgr, "dev").await;
    mgr.install_packages(&names(&["requests"]), &cancel)
        .await
        .unwrap();
    std::fs::write(
        fx.env_dir("dev").join("requires-requests.txt"),
        "certifi, idna",
    )
    .unwrap();

    let deps = mgr
        .get_package_dependencies("requests", &cancel)
        .await
        .unwrap();
    assert_eq!(deps, vec!["certifi", "idna"]);

    let info = mgr
        .get_package_info("requests", &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(info.installed);
    assert_eq!(info.version, "1.0.0");
}

#[tokio::test]
async fn test_package_info_falls_back_to_index() {
    let fx = fixture();
    let mgr = handle(&fx, &spawn_index().await);
    let cancel = CancellationToken::new();

    assert!(mgr
        .get_package_info("nonexistent-package", &cancel)
        .await
        .unwrap()
        .is_none());

    let info = mgr
        .get_package_info("requests", &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(!info.installed);
    assert_eq!(info.version, "2.31.0");
    assert_eq!(info.requires, vec!["charset-normalizer", "idna"]);

    let err = mgr
        .get_package_dependencies("nonexistent-package", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_search_respects_limit_and_order() {
    let fx = fixture();
    let mgr = handle(&fx, &spawn_index().await);

    let all = mgr.search_packages("requests", 10).await.unwrap();
    let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["requests", "requests-mock", "httpx"]);

    let limited = mgr.search_packages("requests", 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].version, "2.31.0");
}

#[tokio::test]
async fn test_unreachable_index_is_isolated() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let err = mgr.search_packages("requests", 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
    let err = mgr
        .get_package_info("requests", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);

    // Local operations keep working.
    active_env(&fx, &mgr, "dev").await;
    assert!(mgr.list_installed_packages(&cancel).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_mutation_is_busy() {
    let fx = fixture();
    let mgr: Arc<ManagerHandle> = handle(&fx, &dead_index_url().await);
    active_env(&fx, &mgr, "dev").await;

    let slow = {
        let mgr = mgr.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            mgr.install_packages(&names(&["slow"]), &cancel).await
        })
    };

    // Wait until the slow install holds the gate.
    for _ in 0..100 {
        if mgr.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(mgr.is_busy());

    let cancel = CancellationToken::new();
    let err = mgr
        .install_packages(&names(&["six"]), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = mgr.activate_environment("dev").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    // Reads are not gated.
    assert!(mgr.list_installed_packages(&cancel).await.is_ok());

    let result = slow.await.unwrap().unwrap();
    assert!(result.success);
    assert!(!mgr.is_busy());
    mgr.install_packages(&names(&["six"]), &cancel)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_install_reports_cancellation() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    active_env(&fx, &mgr, "dev").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = mgr
        .install_packages(&names(&["slow"]), &cancel)
        .await
        .unwrap_err();
    match err {
        env_core::EnvError::SubprocessFailure { cancelled, .. } => assert!(cancelled),
        other => panic!("expected a cancelled subprocess failure, got {:?}", other),
    }
    assert!(!mgr.is_busy());
}
