//! Create, activate, delete, and list environments.
//!
//! Lifecycle of one environment:
//!
//! ```text
//! NotCreated -> Created (inactive) -> Active <-> Inactive -> Deleted
//! ```
//!
//! Creation shells out to the tool matching the [`EnvSpec`]. A failed
//! creation registers nothing and leaves whatever the tool wrote on disk;
//! the next listing adopts or ignores it. Listing and status reconcile the
//! registry against a fresh scan of the env root every time.

use env_tools::{probe_version, PythonInstallation, Tool, ToolCommand};
use futures::future::join_all;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::backend::{self, Backend, Mutation, PipFrontend};
use crate::discovery::InterpreterDiscovery;
use crate::layout::{self, scan_env_root};
use crate::progress::{EnvProgressPhase, ProgressHandler};
use crate::registry::{EnvironmentRegistry, RegisteredEnv};
use crate::settings::ManagerSettings;
use crate::{EnvError, EnvSpec, Result, VirtualEnvironment};

/// Outcome of [`LifecycleController::activate_environment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResult {
    pub active: String,
    pub previous: Option<String>,
}

/// Outcome of [`LifecycleController::delete_environment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionResult {
    pub name: String,
    pub was_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentListing {
    pub environments: Vec<VirtualEnvironment>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub working_directory: PathBuf,
    pub active_environment: Option<String>,
    pub environments: Vec<VirtualEnvironment>,
    pub warnings: Vec<String>,
}

/// Whether `name` can be used as an environment directory name.
pub fn is_valid_env_name(name: &str) -> bool {
    static NAME: OnceLock<Option<Regex>> = OnceLock::new();
    NAME.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// `"3.11.4"` -> `"3.11"`
fn major_minor(version: &str) -> String {
    version.split('.').take(2).collect::<Vec<_>>().join(".")
}

pub struct LifecycleController {
    registry: Arc<EnvironmentRegistry>,
    backend: Arc<Backend>,
    discovery: Arc<InterpreterDiscovery>,
    settings: ManagerSettings,
    progress: Arc<dyn ProgressHandler>,
}

impl LifecycleController {
    pub(crate) fn new(
        registry: Arc<EnvironmentRegistry>,
        backend: Arc<Backend>,
        discovery: Arc<InterpreterDiscovery>,
        settings: ManagerSettings,
        progress: Arc<dyn ProgressHandler>,
    ) -> Self {
        Self {
            registry,
            backend,
            discovery,
            settings,
            progress,
        }
    }

    /// Build the creation command for `spec`, returning it with a tool label.
    async fn creation_command(
        &self,
        name: &str,
        spec: &EnvSpec,
        env_path: &Path,
        python: &PythonInstallation,
    ) -> Result<(String, ToolCommand)> {
        match spec {
            EnvSpec::Venv {
                system_site_packages,
            } => {
                let (label, cmd) = match self.backend.pip_frontend().await {
                    PipFrontend::Uv(uv) => (
                        "uv",
                        ToolCommand::new(uv)
                            .args(["venv", "--seed"])
                            .arg(env_path)
                            .arg("--python")
                            .arg(&python.executable_path),
                    ),
                    PipFrontend::Pip => (
                        "venv",
                        ToolCommand::new(&python.executable_path)
                            .args(["-m", "venv"])
                            .arg(env_path),
                    ),
                };
                let cmd = if *system_site_packages {
                    cmd.arg("--system-site-packages")
                } else {
                    cmd
                };
                Ok((label.to_string(), cmd))
            }
            EnvSpec::Conda { channels } => {
                let conda = self
                    .backend
                    .tools()
                    .locate(Tool::Conda)
                    .await
                    .map_err(|e| EnvError::creation_without_tool(name, e))?;
                let channels = if channels.is_empty() {
                    &self.settings.conda_channels
                } else {
                    channels
                };
                let mut cmd = ToolCommand::new(&conda)
                    .args(["create", "-y", "-p"])
                    .arg(env_path)
                    .arg(format!("python={}", major_minor(&python.version)));
                for channel in channels {
                    cmd = cmd.args(["-c", channel.as_str()]);
                }
                let label = conda
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "conda".to_string());
                Ok((label, cmd))
            }
            EnvSpec::Poetry => {
                let working_dir = self.registry.working_dir();
                if !working_dir.join("pyproject.toml").is_file() {
                    return Err(EnvError::creation(
                        name,
                        format!("poetry needs a pyproject.toml in {}", working_dir.display()),
                    ));
                }
                let cmd = match self.backend.poetry(env_path).await {
                    Ok(cmd) => cmd,
                    Err(EnvError::ToolNotAvailable(e)) => {
                        return Err(EnvError::creation_without_tool(name, e))
                    }
                    Err(e) => return Err(e),
                };
                Ok((
                    "poetry".to_string(),
                    cmd.args(["env", "use"]).arg(&python.executable_path),
                ))
            }
        }
    }

    /// Create an environment called `name`. `python` selects the base
    /// interpreter by version prefix or path; `None` means the default.
    pub async fn create_environment(
        &self,
        name: &str,
        spec: EnvSpec,
        python: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<VirtualEnvironment> {
        if !is_valid_env_name(name) {
            return Err(EnvError::InvalidName(name.to_string()));
        }
        let kind = spec.kind();
        let env_path = self.registry.env_path(name);
        if self.registry.contains(name) || env_path.exists() {
            return Err(EnvError::creation(name, "an environment with that name already exists"));
        }

        let interpreter = self.discovery.resolve(python).await.ok_or_else(|| match python {
            Some(selector) => EnvError::creation(
                name,
                format!("no discovered interpreter matches '{}'", selector),
            ),
            None => EnvError::creation(name, "no Python interpreter found"),
        })?;

        info!(
            "[lifecycle] Creating {} environment '{}' with Python {}",
            kind, name, interpreter.version
        );
        self.progress.on_progress(
            name,
            EnvProgressPhase::Starting {
                name: name.to_string(),
                kind,
            },
        );

        let result = self
            .build_environment(name, &spec, &env_path, &interpreter, cancel)
            .await;
        let env = match result {
            Ok(env) => env,
            Err(e) => {
                self.progress.on_progress(
                    name,
                    EnvProgressPhase::Error {
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        self.registry.insert(env.clone());
        self.progress.on_progress(
            name,
            EnvProgressPhase::Ready {
                env_path: env.path.to_string_lossy().to_string(),
                python_path: env.python_path.to_string_lossy().to_string(),
            },
        );

        let packages = match self.backend.list(&env, false, cancel).await {
            Ok(packages) => packages,
            Err(e) => {
                warn!("[lifecycle] Could not list packages of '{}': {}", name, e);
                vec![]
            }
        };

        Ok(VirtualEnvironment {
            name: env.name,
            path: env.path,
            kind,
            python_version: env.python_version,
            packages,
            is_active: false,
        })
    }

    /// Run the tool and seed packages; nothing is registered here.
    async fn build_environment(
        &self,
        name: &str,
        spec: &EnvSpec,
        env_path: &Path,
        interpreter: &PythonInstallation,
        cancel: &CancellationToken,
    ) -> Result<RegisteredEnv> {
        tokio::fs::create_dir_all(self.registry.env_root())
            .await
            .map_err(|e| EnvError::creation(name, format!("cannot create env directory: {}", e)))?;

        let (tool, cmd) = self
            .creation_command(name, spec, env_path, interpreter)
            .await?;
        self.progress.on_progress(
            name,
            EnvProgressPhase::CreatingEnv {
                tool,
                python: interpreter.executable_path.display().to_string(),
            },
        );

        let output = cmd
            .run(cancel)
            .await
            .map_err(|e| EnvError::creation(name, format!("{}: {}", cmd.display(), e)))?;
        if !output.success {
            let reason = if output.cancelled {
                format!("{} was cancelled", cmd.display())
            } else {
                match output.code {
                    Some(code) => format!("{} exited with code {}", cmd.display(), code),
                    None => format!("{} was terminated", cmd.display()),
                }
            };
            return Err(EnvError::EnvironmentCreation {
                name: name.to_string(),
                reason,
                output: Some(output.combined()),
            });
        }

        let kind = spec.kind();
        let python_path = layout::python_path(kind, env_path);
        if !python_path.exists() {
            return Err(EnvError::EnvironmentCreation {
                name: name.to_string(),
                reason: format!("no interpreter at {} after creation", python_path.display()),
                output: Some(output.combined()),
            });
        }

        let env = RegisteredEnv {
            name: name.to_string(),
            kind,
            path: env_path.to_path_buf(),
            python_version: layout::read_python_version(kind, env_path)
                .or_else(|| Some(interpreter.version.clone())),
            python_path,
        };

        if !self.settings.seed_packages.is_empty() {
            self.progress.on_progress(
                name,
                EnvProgressPhase::InstallingPackages {
                    packages: self.settings.seed_packages.clone(),
                },
            );
            let seed = self
                .backend
                .mutation(&env, Mutation::Install, &self.settings.seed_packages)
                .await
                .map_err(|e| EnvError::creation(name, e.to_string()))?;
            if let Err(e) = backend::run_checked(&seed, cancel).await {
                return Err(EnvError::EnvironmentCreation {
                    name: name.to_string(),
                    reason: format!("installing seed packages failed: {}", e),
                    output: e.details().map(str::to_string),
                });
            }
        }

        Ok(env)
    }

    /// Make `name` the active environment. Pure metadata switch.
    pub fn activate_environment(&self, name: &str) -> Result<ActivationResult> {
        let env = self
            .registry
            .get(name)
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))?;
        if !env.python_path.exists() {
            return Err(EnvError::EnvironmentCorrupted {
                name: name.to_string(),
                python: env.python_path.display().to_string(),
            });
        }
        let previous = self
            .registry
            .set_active(name)
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))?;
        info!("[lifecycle] Activated '{}' (previous: {:?})", name, previous);
        Ok(ActivationResult {
            active: name.to_string(),
            previous,
        })
    }

    /// Remove `name` from disk and from the registry. Deleting the active
    /// environment leaves no environment active.
    pub async fn delete_environment(&self, name: &str) -> Result<DeletionResult> {
        let env = self
            .registry
            .get(name)
            .ok_or_else(|| EnvError::EnvironmentNotFound(name.to_string()))?;

        match tokio::fs::remove_dir_all(&env.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("[lifecycle] {:?} was already gone", env.path);
            }
            Err(e) => return Err(e.into()),
        }

        let was_active = self
            .registry
            .remove(name)
            .map(|(_, was_active)| was_active)
            .unwrap_or(false);
        info!("[lifecycle] Deleted '{}' (was active: {})", name, was_active);
        Ok(DeletionResult {
            name: name.to_string(),
            was_active,
        })
    }

    /// Rescan the env root and fold it into the registry. Scan failures
    /// become warnings and leave the registry as it was.
    pub async fn refresh(&self) -> Vec<String> {
        match scan_env_root(self.registry.env_root()).await {
            Ok(scan) => self.registry.reconcile(scan).warnings,
            Err(e) => {
                warn!("[lifecycle] Scanning {:?} failed: {}", self.registry.env_root(), e);
                vec![format!(
                    "Could not scan {}: {}",
                    self.registry.env_root().display(),
                    e
                )]
            }
        }
    }

    /// Reconciled environments, each with a freshly fetched package list.
    pub async fn list_environments(&self, cancel: &CancellationToken) -> EnvironmentListing {
        let mut warnings = self.refresh().await;
        let snapshot = self.registry.snapshot();

        let described = join_all(
            snapshot
                .envs
                .iter()
                .map(|env| self.describe(env, snapshot.is_active(&env.name), cancel)),
        )
        .await;

        let mut environments = Vec::with_capacity(described.len());
        for (env, warning) in described {
            warnings.extend(warning);
            environments.push(env);
        }

        EnvironmentListing {
            environments,
            warnings,
        }
    }

    pub async fn get_status(&self, cancel: &CancellationToken) -> EnvironmentStatus {
        let listing = self.list_environments(cancel).await;
        EnvironmentStatus {
            working_directory: self.registry.working_dir().to_path_buf(),
            active_environment: listing
                .environments
                .iter()
                .find(|e| e.is_active)
                .map(|e| e.name.clone()),
            environments: listing.environments,
            warnings: listing.warnings,
        }
    }

    async fn describe(
        &self,
        env: &RegisteredEnv,
        is_active: bool,
        cancel: &CancellationToken,
    ) -> (VirtualEnvironment, Option<String>) {
        let (packages, warning) = if !env.python_path.exists() {
            (
                vec![],
                Some(format!(
                    "Environment '{}' has no interpreter at {}",
                    env.name,
                    env.python_path.display()
                )),
            )
        } else {
            match self.backend.list(env, false, cancel).await {
                Ok(packages) => (packages, None),
                Err(e) => (
                    vec![],
                    Some(format!("Could not list packages of '{}': {}", env.name, e)),
                ),
            }
        };

        let python_version = match &env.python_version {
            Some(v) => Some(v.clone()),
            None => probe_version(&env.python_path).await,
        };

        (
            VirtualEnvironment {
                name: env.name.clone(),
                path: env.path.clone(),
                kind: env.kind,
                python_version,
                packages,
                is_active,
            },
            warning,
        )
    }
}
