//! Session-scoped manager handles.
//!
//! A [`SessionRegistry`] hands out one [`ManagerHandle`] per
//! `(session id, working directory)` pair. Handles are created on first
//! access, after resolving the session's working directory through the
//! [`SessionStore`] once, and dropped by [`SessionRegistry::end_session`].
//!
//! Each handle owns its own environment registry. Two sessions on the same
//! directory only see each other's changes through reconciliation.

use env_tools::{Bootstrapper, PythonInstallation, Tool, ToolLocator};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::discovery::InterpreterDiscovery;
use crate::index::{PackageIndex, SearchResult};
use crate::lifecycle::{
    ActivationResult, DeletionResult, EnvironmentListing, EnvironmentStatus, LifecycleController,
};
use crate::packages::{PackageInfo, PackageManager, PackageOpResult};
use crate::progress::{LogHandler, ProgressHandler};
use crate::registry::EnvironmentRegistry;
use crate::settings::ManagerSettings;
use crate::{EnvError, EnvSpec, PackageRecord, Result, VirtualEnvironment};

/// External source of truth for which directory a session works in.
pub trait SessionStore: Send + Sync {
    fn resolve_working_directory(&self, session_id: &str) -> Result<PathBuf>;
}

/// In-memory [`SessionStore`].
#[derive(Debug, Default)]
pub struct StaticSessionStore {
    sessions: Mutex<HashMap<String, PathBuf>>,
}

impl StaticSessionStore {
    pub fn bind(&self, session_id: impl Into<String>, working_dir: impl Into<PathBuf>) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.into(), working_dir.into());
    }

    pub fn unbind(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }
}

impl SessionStore for StaticSessionStore {
    fn resolve_working_directory(&self, session_id: &str) -> Result<PathBuf> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .ok_or_else(|| EnvError::UnknownSession(session_id.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub working_dir: PathBuf,
}

/// Admits one mutating operation at a time; others fail fast with Busy.
#[derive(Debug, Clone)]
pub struct OperationGate {
    lock: Arc<tokio::sync::Mutex<()>>,
    label: String,
}

impl OperationGate {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            label: label.into(),
        }
    }

    /// Enter the gate. The returned guard releases it on drop.
    pub fn try_enter(&self) -> Result<OwnedMutexGuard<()>> {
        self.lock
            .clone()
            .try_lock_owned()
            .map_err(|_| EnvError::Busy(self.label.clone()))
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Tool locator for `settings`, bootstrapping missing tools when enabled.
fn tool_locator(settings: &ManagerSettings) -> ToolLocator {
    if !settings.bootstrap_tools {
        return ToolLocator::new();
    }
    let mut bootstrapper = Bootstrapper::new(settings.bootstrap_channel.as_str());
    if let Some(dir) = &settings.tools_dir {
        bootstrapper = bootstrapper.with_tools_dir(dir);
    }
    let mut locator = ToolLocator::with_bootstrap(bootstrapper);
    for (name, version) in &settings.tool_versions {
        match Tool::from_name(name) {
            Some(tool) => locator = locator.pin(tool, version.as_str()),
            None => warn!("[settings] Ignoring version pin for unknown tool '{}'", name),
        }
    }
    locator
}

/// Everything needed to manage environments in one working directory.
pub struct ManagerHandle {
    working_dir: PathBuf,
    discovery: Arc<InterpreterDiscovery>,
    registry: Arc<EnvironmentRegistry>,
    lifecycle: LifecycleController,
    packages: PackageManager,
    gate: OperationGate,
}

impl ManagerHandle {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        settings: ManagerSettings,
        progress: Arc<dyn ProgressHandler>,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        let registry = Arc::new(EnvironmentRegistry::new(
            working_dir.clone(),
            settings.env_root(&working_dir),
        ));
        let discovery = Arc::new(InterpreterDiscovery::new(settings.search_extra_paths.clone()));
        let backend = Arc::new(Backend::new(
            Arc::new(tool_locator(&settings)),
            settings.installer,
            working_dir.clone(),
        ));
        let index = PackageIndex::new(&settings.index_url)?;

        let packages = PackageManager::new(
            registry.clone(),
            backend.clone(),
            index,
            settings.requirements_file.clone(),
            progress.clone(),
        );
        let lifecycle = LifecycleController::new(
            registry.clone(),
            backend,
            discovery.clone(),
            settings,
            progress,
        );

        Ok(Self {
            gate: OperationGate::new(working_dir.display().to_string()),
            working_dir,
            discovery,
            registry,
            lifecycle,
            packages,
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.registry
    }

    /// Whether a mutating operation is currently running.
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    // Interpreters

    pub async fn discover_interpreters(&self) -> Vec<PythonInstallation> {
        self.discovery.discover().await
    }

    // Environments

    pub async fn create_environment(
        &self,
        name: &str,
        spec: EnvSpec,
        python: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<VirtualEnvironment> {
        let _guard = self.gate.try_enter()?;
        self.lifecycle
            .create_environment(name, spec, python, cancel)
            .await
    }

    pub async fn activate_environment(&self, name: &str) -> Result<ActivationResult> {
        let _guard = self.gate.try_enter()?;
        self.lifecycle.activate_environment(name)
    }

    pub async fn delete_environment(&self, name: &str) -> Result<DeletionResult> {
        let _guard = self.gate.try_enter()?;
        self.lifecycle.delete_environment(name).await
    }

    /// Reconcile the registry with the env root without listing packages.
    /// Returns the reconciliation warnings.
    pub async fn refresh(&self) -> Vec<String> {
        self.lifecycle.refresh().await
    }

    pub async fn list_environments(&self, cancel: &CancellationToken) -> EnvironmentListing {
        self.lifecycle.list_environments(cancel).await
    }

    pub async fn get_status(&self, cancel: &CancellationToken) -> EnvironmentStatus {
        self.lifecycle.get_status(cancel).await
    }

    // Packages

    pub async fn install_packages(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let _guard = self.gate.try_enter()?;
        self.packages.install_packages(names, cancel).await
    }

    pub async fn install_from_requirements(
        &self,
        path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let _guard = self.gate.try_enter()?;
        self.packages.install_from_requirements(path, cancel).await
    }

    pub async fn uninstall_packages(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let _guard = self.gate.try_enter()?;
        self.packages.uninstall_packages(names, cancel).await
    }

    pub async fn update_packages(
        &self,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let _guard = self.gate.try_enter()?;
        self.packages.update_packages(name, cancel).await
    }

    pub async fn list_installed_packages(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageRecord>> {
        self.packages.list_installed(cancel).await
    }

    pub async fn check_outdated_packages(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageRecord>> {
        self.packages.check_outdated(cancel).await
    }

    pub async fn search_packages(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.packages.search(query, limit).await
    }

    pub async fn get_package_info(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PackageInfo>> {
        self.packages.package_info(name, cancel).await
    }

    pub async fn get_package_dependencies(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        self.packages.dependencies(name, cancel).await
    }

    pub async fn save_requirements(
        &self,
        path: Option<&Path>,
        include_versions: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.packages
            .save_requirements(path, include_versions, cancel)
            .await
    }
}

/// Owns the manager handles of every live session.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    settings: ManagerSettings,
    progress: Arc<dyn ProgressHandler>,
    handles: Mutex<HashMap<SessionKey, Arc<ManagerHandle>>>,
    /// Working directory each session resolved to on first access.
    bindings: Mutex<HashMap<String, PathBuf>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, settings: ManagerSettings) -> Self {
        Self::with_progress(store, settings, Arc::new(LogHandler))
    }

    pub fn with_progress(
        store: Arc<dyn SessionStore>,
        settings: ManagerSettings,
        progress: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            store,
            settings,
            progress,
            handles: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// The handle for `session_id` in its resolved working directory.
    pub fn handle(&self, session_id: &str) -> Result<Arc<ManagerHandle>> {
        let working_dir = {
            let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
            match bindings.get(session_id) {
                Some(dir) => dir.clone(),
                None => {
                    let dir = self.store.resolve_working_directory(session_id)?;
                    debug!("[session] Session {} works in {:?}", session_id, dir);
                    bindings.insert(session_id.to_string(), dir.clone());
                    dir
                }
            }
        };
        self.handle_for_dir(session_id, &working_dir)
    }

    /// The handle for an explicit `(session_id, working_dir)` pair.
    pub fn handle_for_dir(&self, session_id: &str, working_dir: &Path) -> Result<Arc<ManagerHandle>> {
        let key = SessionKey {
            session_id: session_id.to_string(),
            working_dir: working_dir.to_path_buf(),
        };
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }

        info!("[session] Creating manager for {} in {:?}", session_id, working_dir);
        let handle = Arc::new(ManagerHandle::new(
            working_dir,
            self.settings.clone(),
            self.progress.clone(),
        )?);
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Drop every handle of `session_id`. Returns how many were dropped.
    ///
    /// Operations already running on a dropped handle finish normally.
    pub fn end_session(&self, session_id: &str) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let before = handles.len();
        handles.retain(|key, _| key.session_id != session_id);
        let dropped = before - handles.len();
        info!("[session] Ended {} ({} handles dropped)", session_id, dropped);
        dropped
    }

    pub fn sessions(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then_with(|| a.working_dir.cmp(&b.working_dir))
        });
        keys
    }
}
