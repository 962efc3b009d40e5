//! Package operations on the active environment.
//!
//! Mutations (install, uninstall, update) run as a single tool invocation
//! over the whole package list so the tool's resolver sees every request at
//! once. Their result carries the tool's raw output plus the version changes
//! observed by listing the environment before and after.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, Backend, Mutation};
use crate::index::{PackageIndex, SearchResult};
use crate::progress::{EnvProgressPhase, ProgressHandler};
use crate::registry::{EnvironmentRegistry, RegisteredEnv};
use crate::{
    normalize_package_name, requirements, same_package, EnvError, EnvKind, PackageRecord, Result,
};

/// Package metadata, from the active environment or the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    /// Installed version, or the index's latest when not installed.
    pub version: String,
    pub summary: Option<String>,
    pub home_page: Option<String>,
    /// Direct dependency names.
    pub requires: Vec<String>,
    pub location: Option<PathBuf>,
    pub installed: bool,
}

/// A package whose installed version changed. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    pub name: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOpResult {
    pub success: bool,
    /// Raw combined stdout/stderr of the tool.
    pub output: String,
    pub changes: Vec<PackageChange>,
}

impl PackageOpResult {
    fn nothing_to_do() -> Self {
        Self {
            success: true,
            output: String::new(),
            changes: vec![],
        }
    }
}

/// Version changes between two listings, ordered by name.
pub fn diff_packages(before: &[PackageRecord], after: &[PackageRecord]) -> Vec<PackageChange> {
    let mut versions: BTreeMap<String, (String, Option<String>, Option<String>)> = BTreeMap::new();
    for record in before {
        versions
            .entry(normalize_package_name(&record.name))
            .or_insert_with(|| (record.name.clone(), None, None))
            .1 = Some(record.installed_version.clone());
    }
    for record in after {
        let entry = versions
            .entry(normalize_package_name(&record.name))
            .or_insert_with(|| (record.name.clone(), None, None));
        entry.0 = record.name.clone();
        entry.2 = Some(record.installed_version.clone());
    }
    versions
        .into_values()
        .filter(|(_, from, to)| from != to)
        .map(|(name, from, to)| PackageChange { name, from, to })
        .collect()
}

pub struct PackageManager {
    registry: Arc<EnvironmentRegistry>,
    backend: Arc<Backend>,
    index: PackageIndex,
    requirements_file: String,
    progress: Arc<dyn ProgressHandler>,
}

impl PackageManager {
    pub(crate) fn new(
        registry: Arc<EnvironmentRegistry>,
        backend: Arc<Backend>,
        index: PackageIndex,
        requirements_file: String,
        progress: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            registry,
            backend,
            index,
            requirements_file,
            progress,
        }
    }

    /// The active environment, checked to still have its interpreter.
    pub fn require_active(&self) -> Result<RegisteredEnv> {
        let env = self.registry.active().ok_or(EnvError::NoActiveEnvironment)?;
        if !env.python_path.exists() {
            return Err(EnvError::EnvironmentCorrupted {
                name: env.name,
                python: env.python_path.display().to_string(),
            });
        }
        Ok(env)
    }

    fn resolve_path(&self, path: Option<&Path>) -> PathBuf {
        let working_dir = self.registry.working_dir();
        match path {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => working_dir.join(p),
            None => working_dir.join(&self.requirements_file),
        }
    }

    /// Run a mutation command and report what changed.
    async fn apply(
        &self,
        env: &RegisteredEnv,
        cmd: env_tools::ToolCommand,
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let before = match self.backend.list(env, false, cancel).await {
            Ok(list) => Some(list),
            Err(e) => {
                debug!("[packages] Listing before mutation failed: {}", e);
                None
            }
        };

        let output = match backend::run_checked(&cmd, cancel).await {
            Ok(output) => output,
            Err(e) => {
                self.progress.on_progress(
                    &env.name,
                    EnvProgressPhase::Error {
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let changes = match (before, self.backend.list(env, false, cancel).await) {
            (Some(before), Ok(after)) => diff_packages(&before, &after),
            (_, Err(e)) => {
                warn!("[packages] Listing after mutation failed: {}", e);
                vec![]
            }
            (None, Ok(_)) => vec![],
        };

        Ok(PackageOpResult {
            success: true,
            output: output.combined(),
            changes,
        })
    }

    pub async fn install_packages(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let env = self.require_active()?;
        if names.is_empty() {
            return Ok(PackageOpResult::nothing_to_do());
        }
        info!("[packages] Installing {:?} into '{}'", names, env.name);
        self.progress.on_progress(
            &env.name,
            EnvProgressPhase::InstallingPackages {
                packages: names.to_vec(),
            },
        );
        let cmd = self.backend.mutation(&env, Mutation::Install, names).await?;
        self.apply(&env, cmd, cancel).await
    }

    /// Install everything listed in a requirements file, by default
    /// `<working_dir>/requirements.txt`.
    pub async fn install_from_requirements(
        &self,
        path: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let env = self.require_active()?;
        let file = self.resolve_path(path);
        if !file.is_file() {
            return Err(EnvError::RequirementsNotFound(file.display().to_string()));
        }
        let specs = requirements::read(&file).await?;
        // pip follows `-r`/`-c`/`-e` lines itself; poetry only sees the parsed specs
        if specs.is_empty() && env.kind == EnvKind::Poetry {
            return Ok(PackageOpResult::nothing_to_do());
        }
        info!("[packages] Installing {} requirements from {:?}", specs.len(), file);
        self.progress.on_progress(
            &env.name,
            EnvProgressPhase::InstallingPackages {
                packages: specs.clone(),
            },
        );
        let cmd = self
            .backend
            .install_requirements(&env, &file, &specs)
            .await?;
        self.apply(&env, cmd, cancel).await
    }

    pub async fn uninstall_packages(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let env = self.require_active()?;
        if names.is_empty() {
            return Ok(PackageOpResult::nothing_to_do());
        }
        info!("[packages] Uninstalling {:?} from '{}'", names, env.name);
        self.progress.on_progress(
            &env.name,
            EnvProgressPhase::UninstallingPackages {
                packages: names.to_vec(),
            },
        );
        let cmd = self
            .backend
            .mutation(&env, Mutation::Uninstall, names)
            .await?;
        self.apply(&env, cmd, cancel).await
    }

    /// Installed packages, without availability information.
    pub async fn list_installed(&self, cancel: &CancellationToken) -> Result<Vec<PackageRecord>> {
        let env = self.require_active()?;
        self.backend.list(&env, false, cancel).await
    }

    /// Packages with a newer resolvable version. Read-only.
    pub async fn check_outdated(&self, cancel: &CancellationToken) -> Result<Vec<PackageRecord>> {
        let env = self.require_active()?;
        self.backend.list(&env, true, cancel).await
    }

    /// Upgrade `name`, or every outdated package when `None`.
    pub async fn update_packages(
        &self,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PackageOpResult> {
        let env = self.require_active()?;

        let targets: Vec<String> = match name {
            Some(name) => {
                let installed = self.backend.list(&env, false, cancel).await?;
                let record = installed
                    .into_iter()
                    .find(|p| same_package(&p.name, name))
                    .ok_or_else(|| EnvError::NotFound(name.to_string()))?;
                vec![record.name]
            }
            None => self
                .backend
                .list(&env, true, cancel)
                .await?
                .into_iter()
                .map(|p| p.name)
                .collect(),
        };

        if targets.is_empty() {
            debug!("[packages] Nothing to update in '{}'", env.name);
            return Ok(PackageOpResult::nothing_to_do());
        }

        info!("[packages] Updating {:?} in '{}'", targets, env.name);
        self.progress.on_progress(
            &env.name,
            EnvProgressPhase::UpdatingPackages {
                packages: targets.clone(),
            },
        );
        let cmd = self
            .backend
            .mutation(&env, Mutation::Upgrade, &targets)
            .await?;
        self.apply(&env, cmd, cancel).await
    }

    /// Search the package index. Does not need an active environment.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.index.search(query, limit).await
    }

    /// Look in the active environment first (if any), then the index.
    async fn installed_info(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Option<PackageInfo> {
        let env = self.require_active().ok()?;
        match self.backend.show(&env, name, cancel).await {
            Ok(info) => info,
            Err(e) => {
                warn!("[packages] Could not inspect '{}' in '{}': {}", name, env.name, e);
                None
            }
        }
    }

    /// Metadata for `name`, or `None` when neither installed nor indexed.
    pub async fn package_info(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PackageInfo>> {
        if let Some(info) = self.installed_info(name, cancel).await {
            return Ok(Some(info));
        }
        Ok(self.index.project(name).await?.map(|project| PackageInfo {
            requires: project.direct_dependencies(),
            name: project.name,
            version: project.version,
            summary: project.summary.filter(|s| !s.is_empty()),
            home_page: project.home_page.filter(|s| !s.is_empty()),
            location: None,
            installed: false,
        }))
    }

    /// Direct dependency names of `name`.
    pub async fn dependencies(&self, name: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.package_info(name, cancel)
            .await?
            .map(|info| info.requires)
            .ok_or_else(|| EnvError::NotFound(name.to_string()))
    }

    /// Write the active environment's packages to a requirements file,
    /// replacing it. Returns the path written.
    pub async fn save_requirements(
        &self,
        path: Option<&Path>,
        include_versions: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let env = self.require_active()?;
        let packages = self.backend.list(&env, false, cancel).await?;
        let file = self.resolve_path(path);
        tokio::fs::write(&file, requirements::render(&packages, include_versions)).await?;
        info!(
            "[packages] Saved {} packages from '{}' to {:?}",
            packages.len(),
            env.name,
            file
        );
        Ok(file)
    }
}
