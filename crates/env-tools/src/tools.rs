//! Locating the external tools that create and populate environments.
//!
//! Each [`Tool`] is searched on `PATH` by its candidate executable names and
//! verified with `--version`. Results are memoised per [`ToolLocator`], so a
//! manager pays the probe cost once, including failures. With a
//! [`Bootstrapper`], a tool missing from `PATH` is installed from its conda
//! channel instead.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::sync::OnceCell;

use crate::bootstrap::{BootstrapRequest, Bootstrapper};

/// External tools envctl shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// `uv`, used for venv creation and as the preferred pip frontend.
    Uv,
    /// Any conda frontend: `conda`, `mamba`, or `micromamba`.
    Conda,
    /// `poetry`, for poetry-managed project environments.
    Poetry,
}

impl Tool {
    /// Executable names probed on `PATH`, in preference order.
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            Tool::Uv => &["uv"],
            Tool::Conda => &["conda", "mamba", "micromamba"],
            Tool::Poetry => &["poetry"],
        }
    }

    /// Parse a tool name as written in settings.
    pub fn from_name(name: &str) -> Option<Tool> {
        match name.trim().to_ascii_lowercase().as_str() {
            "uv" => Some(Tool::Uv),
            "conda" | "mamba" | "micromamba" => Some(Tool::Conda),
            "poetry" => Some(Tool::Poetry),
            _ => None,
        }
    }

    /// conda-forge package and binary name used when bootstrapping.
    fn bootstrap_package(&self) -> (&'static str, &'static str) {
        match self {
            Tool::Uv => ("uv", "uv"),
            Tool::Conda => ("micromamba", "micromamba"),
            Tool::Poetry => ("poetry", "poetry"),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Uv => write!(f, "uv"),
            Tool::Conda => write!(f, "conda"),
            Tool::Poetry => write!(f, "poetry"),
        }
    }
}

/// Find an executable by name in the directories listed in `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in_dirs(name, std::env::split_paths(&path))
}

/// Find an executable by name in the given directories, first match wins.
pub fn find_in_dirs<I>(name: &str, dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    dirs.into_iter()
        .map(|dir| dir.join(&file_name))
        .find(|candidate| is_executable(candidate))
}

/// Whether `path` is a regular file the current user may execute.
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Run `<program> --version` and report whether it exited successfully.
async fn responds_to_version(program: &OsStr) -> bool {
    tokio::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Why a tool could not be located.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolUnavailable {
    #[error("{0} was not found on PATH")]
    NotOnPath(Tool),
    #[error("{tool} was not found on PATH and could not be bootstrapped")]
    BootstrapFailed { tool: Tool, reason: String },
}

impl ToolUnavailable {
    pub fn tool(&self) -> Tool {
        match self {
            ToolUnavailable::NotOnPath(tool) => *tool,
            ToolUnavailable::BootstrapFailed { tool, .. } => *tool,
        }
    }

    /// The bootstrap failure, when one was attempted.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ToolUnavailable::NotOnPath(_) => None,
            ToolUnavailable::BootstrapFailed { reason, .. } => Some(reason),
        }
    }
}

type Located = Result<PathBuf, ToolUnavailable>;

/// Per-manager cache of tool locations.
#[derive(Debug, Default)]
pub struct ToolLocator {
    bootstrapper: Option<Bootstrapper>,
    pins: HashMap<Tool, String>,
    uv: OnceCell<Located>,
    conda: OnceCell<Located>,
    poetry: OnceCell<Located>,
}

impl ToolLocator {
    /// A locator that only searches `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A locator that installs tools missing from `PATH` with `bootstrapper`.
    pub fn with_bootstrap(bootstrapper: Bootstrapper) -> Self {
        Self {
            bootstrapper: Some(bootstrapper),
            ..Default::default()
        }
    }

    /// Pin the version bootstrapped for `tool`. Tools found on `PATH` are
    /// used whatever their version.
    pub fn pin(mut self, tool: Tool, version: impl Into<String>) -> Self {
        self.pins.insert(tool, version.into());
        self
    }

    fn cell(&self, tool: Tool) -> &OnceCell<Located> {
        match tool {
            Tool::Uv => &self.uv,
            Tool::Conda => &self.conda,
            Tool::Poetry => &self.poetry,
        }
    }

    /// Resolve a tool to an executable path.
    pub async fn locate(&self, tool: Tool) -> Located {
        self.cell(tool)
            .get_or_init(|| self.probe(tool))
            .await
            .clone()
    }

    /// Whether the tool can be used, without caring where it lives.
    pub async fn is_available(&self, tool: Tool) -> bool {
        self.locate(tool).await.is_ok()
    }

    async fn probe(&self, tool: Tool) -> Located {
        for name in tool.candidates() {
            let Some(path) = find_on_path(name) else {
                continue;
            };
            if responds_to_version(path.as_os_str()).await {
                info!("[tools] Using {} at {:?}", tool, path);
                return Ok(path);
            }
            debug!("[tools] {:?} did not respond to --version, skipping", path);
        }

        let Some(bootstrapper) = &self.bootstrapper else {
            debug!("[tools] {} not found on PATH", tool);
            return Err(ToolUnavailable::NotOnPath(tool));
        };

        let (package, binary) = tool.bootstrap_package();
        let request = BootstrapRequest {
            package,
            binary,
            version: self.pins.get(&tool).map(String::as_str),
        };
        bootstrapper.ensure(&request).await.map_err(|e| {
            warn!("[tools] Failed to bootstrap {}: {:#}", package, e);
            ToolUnavailable::BootstrapFailed {
                tool,
                reason: format!("{:#}", e),
            }
        })
    }
}
