//! In-memory model of the environments in one working directory.
//!
//! The registry is a disposable cache over `<env_root>/<name>` directories.
//! [`EnvironmentRegistry::reconcile`] folds a fresh [`DirectoryScan`] into it:
//! directories on disk win, registry entries without a directory are pruned,
//! and unregistered directories are adopted as inactive.
//!
//! The active environment is stored as a single optional name, so there can
//! never be two active entries.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::layout::{DetectedEnv, DirectoryScan};
use crate::EnvKind;

/// A registered environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredEnv {
    pub name: String,
    pub kind: EnvKind,
    pub path: PathBuf,
    pub python_path: PathBuf,
    pub python_version: Option<String>,
}

impl From<DetectedEnv> for RegisteredEnv {
    fn from(env: DetectedEnv) -> Self {
        Self {
            name: env.name,
            kind: env.kind,
            path: env.path,
            python_path: env.python_path,
            python_version: env.python_version,
        }
    }
}

/// Point-in-time copy of the registry, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub envs: Vec<RegisteredEnv>,
    pub active: Option<String>,
}

impl RegistrySnapshot {
    pub fn is_active(&self, name: &str) -> bool {
        self.active.as_deref() == Some(name)
    }
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub adopted: Vec<String>,
    pub pruned: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    envs: BTreeMap<String, RegisteredEnv>,
    active: Option<String>,
}

#[derive(Debug)]
pub struct EnvironmentRegistry {
    working_dir: PathBuf,
    env_root: PathBuf,
    state: Mutex<RegistryState>,
}

impl EnvironmentRegistry {
    pub fn new(working_dir: impl Into<PathBuf>, env_root: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            env_root: env_root.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn env_root(&self) -> &Path {
        &self.env_root
    }

    /// Directory an environment called `name` lives in.
    pub fn env_path(&self, name: &str) -> PathBuf {
        self.env_root.join(name)
    }

    // Never held across an await point.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<RegisteredEnv> {
        self.lock().envs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().envs.contains_key(name)
    }

    /// Register (or replace) an environment. New entries start inactive.
    pub fn insert(&self, env: RegisteredEnv) {
        debug!("[registry] Registering {} environment '{}'", env.kind, env.name);
        self.lock().envs.insert(env.name.clone(), env);
    }

    /// Remove an entry. Returns the entry and whether it was active.
    ///
    /// Removing the active environment clears the active pointer; nothing
    /// else is promoted.
    pub fn remove(&self, name: &str) -> Option<(RegisteredEnv, bool)> {
        let mut state = self.lock();
        let env = state.envs.remove(name)?;
        let was_active = state.active.as_deref() == Some(name);
        if was_active {
            state.active = None;
        }
        Some((env, was_active))
    }

    /// Make `name` the active environment. Returns the previously active
    /// name, or `None` if `name` is not registered.
    pub fn set_active(&self, name: &str) -> Option<Option<String>> {
        let mut state = self.lock();
        if !state.envs.contains_key(name) {
            return None;
        }
        Some(state.active.replace(name.to_string()))
    }

    /// The active environment, if any.
    pub fn active(&self) -> Option<RegisteredEnv> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .and_then(|name| state.envs.get(name))
            .cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.lock();
        RegistrySnapshot {
            envs: state.envs.values().cloned().collect(),
            active: state.active.clone(),
        }
    }

    /// Fold a directory scan into the registry.
    pub fn reconcile(&self, scan: DirectoryScan) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut state = self.lock();

        let on_disk: BTreeMap<String, DetectedEnv> = scan
            .found
            .into_iter()
            .map(|env| (env.name.clone(), env))
            .collect();

        let missing: Vec<String> = state
            .envs
            .keys()
            .filter(|name| !on_disk.contains_key(*name))
            .cloned()
            .collect();
        for name in missing {
            if let Some(env) = state.envs.remove(&name) {
                warn!(
                    "[registry] Environment '{}' is gone from {:?}, pruning",
                    name, env.path
                );
                report.warnings.push(format!(
                    "Environment '{}' no longer exists at {} and was removed",
                    name,
                    env.path.display()
                ));
            }
            if state.active.as_deref() == Some(name.as_str()) {
                state.active = None;
                report
                    .warnings
                    .push(format!("Active environment '{}' was removed", name));
            }
            report.pruned.push(name);
        }

        for (name, detected) in on_disk {
            match state.envs.get_mut(&name) {
                Some(existing) => {
                    if existing.kind != detected.kind {
                        report.warnings.push(format!(
                            "Environment '{}' changed from {} to {} on disk",
                            name, existing.kind, detected.kind
                        ));
                    }
                    *existing = detected.into();
                }
                None => {
                    info!(
                        "[registry] Adopting {} environment '{}' found on disk",
                        detected.kind, name
                    );
                    state.envs.insert(name.clone(), detected.into());
                    report.adopted.push(name);
                }
            }
        }

        for path in scan.ignored {
            report.warnings.push(format!(
                "Ignoring {}: not a recognised environment",
                path.display()
            ));
        }

        report
    }
}
