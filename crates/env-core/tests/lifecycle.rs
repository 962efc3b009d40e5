//! Environment lifecycle against a fake interpreter.
//!
//! Covers creation, the single-active invariant, deletion, and how the
//! registry reconciles with directories changed behind its back.

#![cfg(unix)]

mod common;

use common::{dead_index_url, fixture, handle, settings, write_executable};
use env_core::session::ManagerHandle;
use env_core::{CancellationToken, EnvKind, EnvSpec, ErrorKind, LogHandler};
use env_tools::find_on_path;
use std::sync::Arc;

#[tokio::test]
async fn test_create_then_list_shows_inactive() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let created = mgr
        .create_environment("envA", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .expect("create envA");
    assert_eq!(created.name, "envA");
    assert_eq!(created.kind, EnvKind::Venv);
    assert_eq!(created.python_version.as_deref(), Some("3.11.7"));
    assert!(!created.is_active);
    assert!(created.packages.iter().any(|p| p.name == "pip"));
    assert!(fx.env_dir("envA").join("pyvenv.cfg").is_file());

    let listing = mgr.list_environments(&cancel).await;
    assert!(listing.warnings.is_empty(), "{:?}", listing.warnings);
    let env_a = listing
        .environments
        .iter()
        .find(|e| e.name == "envA")
        .expect("envA listed");
    assert!(!env_a.is_active);
}

#[tokio::test]
async fn test_activation_switches_single_active() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    for name in ["envA", "envB", "envC"] {
        mgr.create_environment(name, EnvSpec::venv(), fx.python_selector(), &cancel)
            .await
            .unwrap();
    }

    let first = mgr.activate_environment("envA").await.unwrap();
    assert_eq!(first.previous, None);
    let second = mgr.activate_environment("envB").await.unwrap();
    assert_eq!(second.previous.as_deref(), Some("envA"));

    let status = mgr.get_status(&cancel).await;
    assert_eq!(status.active_environment.as_deref(), Some("envB"));
    let active: Vec<&str> = status
        .environments
        .iter()
        .filter(|e| e.is_active)
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(active, vec!["envB"]);
    assert_eq!(status.working_directory, fx.work);
}

#[tokio::test]
async fn test_delete_active_leaves_nothing_active() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    mgr.create_environment("envA", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    mgr.create_environment("envB", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    mgr.activate_environment("envA").await.unwrap();

    let deleted = mgr.delete_environment("envA").await.unwrap();
    assert!(deleted.was_active);
    assert!(!fx.env_dir("envA").exists());

    let status = mgr.get_status(&cancel).await;
    assert_eq!(status.active_environment, None);
    let names: Vec<&str> = status.environments.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["envB"]);
    assert!(status.environments.iter().all(|e| !e.is_active));
}

#[tokio::test]
async fn test_create_rejects_bad_names_and_duplicates() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    for bad in ["", "../escape", "a/b", ".hidden"] {
        let err = mgr
            .create_environment(bad, EnvSpec::venv(), fx.python_selector(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentCreation, "name {:?}", bad);
    }

    mgr.create_environment("dup", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    let err = mgr
        .create_environment("dup", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCreation);
}

#[tokio::test]
async fn test_create_with_unknown_interpreter_fails() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let missing = fx.work.join("no-such-python");
    let err = mgr
        .create_environment("envA", EnvSpec::venv(), missing.to_str(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCreation);
    assert!(!fx.env_dir("envA").exists());
}

#[tokio::test]
async fn test_failed_create_registers_nothing() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let err = mgr
        .create_environment("broken-env", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCreation);
    let report = err.report();
    assert!(
        report.details.as_deref().unwrap_or("").contains("boom"),
        "tool output should be attached: {:?}",
        report
    );

    // The partial directory is left on disk but never becomes an environment.
    assert!(fx.env_dir("broken-env").is_dir());
    assert!(mgr.registry().get("broken-env").is_none());
    let status = mgr.get_status(&cancel).await;
    assert!(status.environments.is_empty());
    assert!(status.warnings.iter().any(|w| w.contains("broken-env")));
}

#[tokio::test]
async fn test_conda_and_poetry_report_missing_prerequisites() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    // No pyproject.toml in the working directory.
    let err = mgr
        .create_environment("p", EnvSpec::Poetry, fx.python_selector(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCreation);
    assert!(err.to_string().contains("pyproject.toml"));
    assert!(mgr.registry().get("p").is_none());
}

#[tokio::test]
async fn test_activate_unknown_and_corrupted() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let err = mgr.activate_environment("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentNotFound);

    mgr.create_environment("envA", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    std::fs::remove_file(fx.env_dir("envA").join("bin").join("python")).unwrap();

    let err = mgr.activate_environment("envA").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCorrupted);
    assert!(mgr.registry().active().is_none());

    // Still listed, with a warning instead of packages.
    let listing = mgr.list_environments(&cancel).await;
    let env_a = listing.environments.iter().find(|e| e.name == "envA").unwrap();
    assert!(env_a.packages.is_empty());
    assert!(listing.warnings.iter().any(|w| w.contains("envA")));
}

#[tokio::test]
async fn test_delete_unknown_is_not_found() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let err = mgr.delete_environment("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentNotFound);
}

#[tokio::test]
async fn test_status_adopts_environment_created_elsewhere() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    let status = mgr.get_status(&cancel).await;
    assert!(status.environments.is_empty());

    // Another session (or a shell) creates an environment in the same directory.
    let out = std::process::Command::new(&fx.python)
        .args(["-m", "venv"])
        .arg(fx.env_dir("outside"))
        .output()
        .unwrap();
    assert!(out.status.success());

    let status = mgr.get_status(&cancel).await;
    let outside = status
        .environments
        .iter()
        .find(|e| e.name == "outside")
        .expect("adopted");
    assert!(!outside.is_active);
    assert_eq!(outside.python_version.as_deref(), Some("3.11.7"));
    assert!(outside.packages.iter().any(|p| p.name == "pip"));

    mgr.activate_environment("outside").await.unwrap();
}

/// Reconciliation only happens on list/status. Between those calls the
/// registry may be stale: an environment removed out of band stays active
/// until the next status query prunes it.
#[tokio::test]
async fn test_out_of_band_removal_visible_after_status() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);
    let cancel = CancellationToken::new();

    mgr.create_environment("envA", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    mgr.activate_environment("envA").await.unwrap();

    std::fs::remove_dir_all(fx.env_dir("envA")).unwrap();

    // Stale until the next status query.
    assert_eq!(mgr.registry().active().map(|e| e.name).as_deref(), Some("envA"));
    let err = mgr.list_installed_packages(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCorrupted);

    let status = mgr.get_status(&cancel).await;
    assert_eq!(status.active_environment, None);
    assert!(status.environments.is_empty());
    assert!(status.warnings.iter().any(|w| w.contains("envA")));
    assert!(mgr.registry().active().is_none());
}

#[tokio::test]
async fn test_two_handles_share_disk_not_memory() {
    let fx = fixture();
    let index = dead_index_url().await;
    let first = handle(&fx, &index);
    let second = handle(&fx, &index);
    let cancel = CancellationToken::new();

    first
        .create_environment("envA", EnvSpec::venv(), fx.python_selector(), &cancel)
        .await
        .unwrap();
    first.activate_environment("envA").await.unwrap();

    // Not in the second registry until it reconciles.
    assert!(second.registry().get("envA").is_none());
    let status = second.get_status(&cancel).await;
    let env_a = status.environments.iter().find(|e| e.name == "envA").unwrap();
    // Activation is per handle.
    assert!(!env_a.is_active);
    assert_eq!(status.active_environment, None);
}

#[tokio::test]
async fn test_interpreter_discovery_includes_extra_paths() {
    let fx = fixture();
    let mut settings = common::settings(&dead_index_url().await);
    settings.search_extra_paths = vec![fx.python.parent().unwrap().to_path_buf()];
    let mgr = env_core::session::ManagerHandle::new(
        &fx.work,
        settings,
        std::sync::Arc::new(env_core::LogHandler),
    )
    .unwrap();

    let found = mgr.discover_interpreters().await;
    assert!(
        found.iter().any(|p| p.executable_path == fx.python && p.version == "3.11.7"),
        "fake interpreter should be discovered: {:?}",
        found
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poetry_bootstrap_failure_is_in_error_details() {
    if find_on_path("poetry").is_some() {
        println!("poetry on PATH, skipping");
        return;
    }
    let fx = fixture();
    std::fs::write(fx.work.join("pyproject.toml"), "[tool.poetry]\nname = \"demo\"\n").unwrap();
    let mut settings = settings(&dead_index_url().await);
    settings.bootstrap_tools = true;
    settings.bootstrap_channel = "http://127.0.0.1:9/offline".into();
    settings.tools_dir = Some(fx.work.join("tool-cache"));
    settings
        .tool_versions
        .insert("poetry".into(), "1.8.*".into());
    let mgr = ManagerHandle::new(&fx.work, settings, Arc::new(LogHandler)).unwrap();
    let cancel = CancellationToken::new();

    let err = mgr
        .create_environment("proj", EnvSpec::Poetry, fx.python_selector(), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EnvironmentCreation);
    assert!(err.to_string().contains("poetry"), "{}", err);
    let details = err.details().expect("bootstrap failure is attached");
    assert!(details.contains("127.0.0.1:9"), "{}", details);
    assert!(mgr.registry().get("proj").is_none());
}

#[tokio::test]
async fn test_refresh_adopts_without_running_interpreters() {
    let fx = fixture();
    let mgr = handle(&fx, &dead_index_url().await);

    let env = fx.env_dir("handmade");
    let marker = fx.work.join("interpreter-ran");
    std::fs::create_dir_all(&env).unwrap();
    std::fs::write(env.join("pyvenv.cfg"), "version = 3.10.4\n").unwrap();
    write_executable(
        &env.join("bin").join("python"),
        &format!("#!/bin/sh\ntouch '{}'\nexit 1\n", marker.display()),
    );

    assert!(mgr.refresh().await.is_empty());
    let adopted = mgr.registry().get("handmade").expect("adopted");
    assert_eq!(adopted.python_version.as_deref(), Some("3.10.4"));
    assert!(!marker.exists(), "refresh must not list packages");

    let activated = mgr.activate_environment("handmade").await.unwrap();
    assert_eq!(activated.active, "handmade");
    assert!(!marker.exists());
}
