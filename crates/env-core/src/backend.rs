//! Tool command lines for package operations.
//!
//! venv and conda environments are driven through a pip frontend, `uv pip`
//! when preferred and available, otherwise the environment's own
//! `python -m pip`. Poetry environments use `poetry add|remove|update` for
//! mutations so `pyproject.toml` stays in step, and pip for queries.

use env_tools::{Tool, ToolCommand, ToolLocator, ToolOutput};
use log::debug;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::packages::PackageInfo;
use crate::registry::RegisteredEnv;
use crate::settings::InstallerPreference;
use crate::{EnvError, EnvKind, PackageRecord, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PipFrontend {
    Uv(PathBuf),
    Pip,
}

/// Which mutation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mutation {
    Install,
    Upgrade,
    Uninstall,
}

#[derive(Debug)]
pub(crate) struct Backend {
    tools: Arc<ToolLocator>,
    installer: InstallerPreference,
    working_dir: PathBuf,
}

impl Backend {
    pub fn new(tools: Arc<ToolLocator>, installer: InstallerPreference, working_dir: PathBuf) -> Self {
        Self {
            tools,
            installer,
            working_dir,
        }
    }

    pub fn tools(&self) -> &ToolLocator {
        &self.tools
    }

    pub async fn pip_frontend(&self) -> PipFrontend {
        if self.installer == InstallerPreference::Uv {
            match self.tools.locate(Tool::Uv).await {
                Ok(uv) => return PipFrontend::Uv(uv),
                Err(e) => debug!("[packages] {}, falling back to pip", e),
            }
        }
        PipFrontend::Pip
    }

    /// `uv pip <sub> --python <py>` or `<py> -m pip <sub>`.
    async fn pip(&self, env: &RegisteredEnv, sub: &str) -> ToolCommand {
        match self.pip_frontend().await {
            PipFrontend::Uv(uv) => ToolCommand::new(uv)
                .args(["pip", sub, "--python"])
                .arg(&env.python_path),
            PipFrontend::Pip => ToolCommand::new(&env.python_path)
                .args(["-m", "pip", sub, "--disable-pip-version-check"]),
        }
    }

    /// `poetry <args>` pointed at the environment's virtualenvs directory.
    pub async fn poetry(&self, env_path: &Path) -> Result<ToolCommand> {
        let poetry = self.tools.locate(Tool::Poetry).await?;
        Ok(ToolCommand::new(poetry)
            .current_dir(&self.working_dir)
            .env("POETRY_VIRTUALENVS_PATH", env_path)
            .env("POETRY_VIRTUALENVS_IN_PROJECT", "false")
            .arg("--no-interaction"))
    }

    /// Command that applies `mutation` to `specs` in a single invocation.
    pub async fn mutation(
        &self,
        env: &RegisteredEnv,
        mutation: Mutation,
        specs: &[String],
    ) -> Result<ToolCommand> {
        if env.kind == EnvKind::Poetry {
            let sub = match mutation {
                Mutation::Install => "add",
                Mutation::Upgrade => "update",
                Mutation::Uninstall => "remove",
            };
            return Ok(self.poetry(&env.path).await?.arg(sub).args(specs));
        }

        let cmd = match mutation {
            Mutation::Install => self.pip(env, "install").await,
            Mutation::Upgrade => self.pip(env, "install").await.arg("--upgrade"),
            Mutation::Uninstall => {
                let cmd = self.pip(env, "uninstall").await;
                if cmd.program() == env.python_path.as_path() {
                    cmd.arg("-y")
                } else {
                    cmd
                }
            }
        };
        Ok(cmd.args(specs))
    }

    /// Install from a requirements file. Poetry gets the parsed specifiers.
    pub async fn install_requirements(
        &self,
        env: &RegisteredEnv,
        file: &Path,
        specs: &[String],
    ) -> Result<ToolCommand> {
        if env.kind == EnvKind::Poetry {
            return self.mutation(env, Mutation::Install, specs).await;
        }
        Ok(self.pip(env, "install").await.arg("-r").arg(file))
    }

    /// Installed packages, optionally only the outdated ones.
    pub async fn list(
        &self,
        env: &RegisteredEnv,
        outdated: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageRecord>> {
        let mut cmd = self.pip(env, "list").await.args(["--format", "json"]);
        if outdated {
            cmd = cmd.arg("--outdated");
        } else if cmd.program() == env.python_path.as_path() {
            // pip only reports locations in verbose mode
            cmd = cmd.arg("-v");
        }
        let output = run_checked(&cmd, cancel).await?;
        let records = parse_pip_list(&output.stdout).map_err(|e| EnvError::SubprocessFailure {
            command: cmd.display(),
            output: format!("unreadable package list: {}\n{}", e, output.combined()),
            cancelled: false,
        })?;
        Ok(if outdated {
            records
                .into_iter()
                .filter(|r| r.available_version.is_some())
                .collect()
        } else {
            records
                .into_iter()
                .map(|r| PackageRecord {
                    available_version: None,
                    ..r
                })
                .collect()
        })
    }

    /// Metadata of an installed package, `None` if it is not installed.
    pub async fn show(
        &self,
        env: &RegisteredEnv,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PackageInfo>> {
        let cmd = self.pip(env, "show").await.arg(name);
        let output = run(&cmd, cancel).await?;
        if output.cancelled {
            return Err(failure(&cmd, &output));
        }
        // A missing package is a warning plus non-zero exit, not an error.
        Ok(parse_pip_show(&output.stdout))
    }
}

/// Run a command; spawn failures become [`EnvError::SubprocessFailure`].
pub(crate) async fn run(cmd: &ToolCommand, cancel: &CancellationToken) -> Result<ToolOutput> {
    cmd.run(cancel).await.map_err(|e| EnvError::SubprocessFailure {
        command: cmd.display(),
        output: e.to_string(),
        cancelled: false,
    })
}

/// Run a command and require a successful exit.
pub(crate) async fn run_checked(
    cmd: &ToolCommand,
    cancel: &CancellationToken,
) -> Result<ToolOutput> {
    let output = run(cmd, cancel).await?;
    if output.success {
        Ok(output)
    } else {
        Err(failure(cmd, &output))
    }
}

pub(crate) fn failure(cmd: &ToolCommand, output: &ToolOutput) -> EnvError {
    EnvError::SubprocessFailure {
        command: cmd.display(),
        output: output.combined(),
        cancelled: output.cancelled,
    }
}

#[derive(Debug, Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
    #[serde(default)]
    latest_version: Option<String>,
    #[serde(default)]
    location: Option<String>,
}

/// Parse `pip list --format json` (or the uv equivalent).
pub(crate) fn parse_pip_list(stdout: &str) -> serde_json::Result<Vec<PackageRecord>> {
    let trimmed = stdout.trim();
    let json = match trimmed.find('[') {
        Some(start) if !trimmed.starts_with('[') => &trimmed[start..],
        _ => trimmed,
    };
    let json = if json.is_empty() { "[]" } else { json };
    let entries: Vec<PipListEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|e| PackageRecord {
            available_version: e.latest_version.filter(|latest| *latest != e.version),
            location: e.location.filter(|l| !l.is_empty()).map(PathBuf::from),
            name: e.name,
            installed_version: e.version,
        })
        .collect())
}

/// Parse `pip show <name>`. `None` when nothing was reported.
pub(crate) fn parse_pip_show(stdout: &str) -> Option<PackageInfo> {
    let mut info = PackageInfo {
        installed: true,
        ..PackageInfo::default()
    };
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let text = (!value.is_empty()).then(|| value.to_string());
        match key.trim() {
            "Name" => info.name = value.to_string(),
            "Version" => info.version = value.to_string(),
            "Summary" => info.summary = text,
            "Home-page" => info.home_page = text,
            "Location" => info.location = text.map(PathBuf::from),
            "Requires" => {
                info.requires = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            _ => {}
        }
    }
    (!info.name.is_empty()).then_some(info)
}
