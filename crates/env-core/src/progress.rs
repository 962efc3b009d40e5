//! Progress reporting for environment and package operations.
//!
//! Long-running operations emit [`EnvProgressPhase`] events through a
//! [`ProgressHandler`]. Consumers implement the trait to route events to
//! their own surface; [`LogHandler`] writes them to the `log` crate.

use serde::{Deserialize, Serialize};

use crate::EnvKind;

/// Phases of a lifecycle or package operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EnvProgressPhase {
    /// Starting to create an environment.
    Starting { name: String, kind: EnvKind },
    /// Running the kind-specific creation tool.
    CreatingEnv { tool: String, python: String },
    /// Installing packages into an environment.
    InstallingPackages { packages: Vec<String> },
    /// Removing packages from an environment.
    UninstallingPackages { packages: Vec<String> },
    /// Upgrading packages in an environment.
    UpdatingPackages { packages: Vec<String> },
    /// Operation finished successfully.
    Ready {
        env_path: String,
        python_path: String,
    },
    /// An error occurred.
    Error { message: String },
}

/// Trait for receiving progress events.
pub trait ProgressHandler: Send + Sync {
    /// Called for each phase. `env_name` identifies the target environment.
    fn on_progress(&self, env_name: &str, phase: EnvProgressPhase);
}

/// Log-only progress handler.
///
/// Writes progress phases to the `log` crate at info level.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, env_name: &str, phase: EnvProgressPhase) {
        match &phase {
            EnvProgressPhase::Starting { name, kind } => {
                log::info!("[{env_name}] Creating {kind} environment '{name}'");
            }
            EnvProgressPhase::CreatingEnv { tool, python } => {
                log::info!("[{env_name}] Running {tool} with interpreter {python}");
            }
            EnvProgressPhase::InstallingPackages { packages } => {
                log::info!("[{env_name}] Installing packages: {packages:?}");
            }
            EnvProgressPhase::UninstallingPackages { packages } => {
                log::info!("[{env_name}] Uninstalling packages: {packages:?}");
            }
            EnvProgressPhase::UpdatingPackages { packages } => {
                log::info!("[{env_name}] Updating packages: {packages:?}");
            }
            EnvProgressPhase::Ready {
                env_path,
                python_path,
            } => {
                log::info!("[{env_name}] Ready: env={env_path} python={python_path}");
            }
            EnvProgressPhase::Error { message } => {
                log::error!("[{env_name}] Error: {message}");
            }
        }
    }
}
