//! Per-project Python environment and package management.
//!
//! For a working directory this crate keeps an in-memory model of its
//! virtual environments (venv, conda, or poetry), switches the active one,
//! and installs, removes, queries, and updates packages inside it. Ground
//! truth lives on disk and is mutated by tools we do not control, so the
//! registry is reconciled against a directory scan on every status query.
//!
//! The pieces, leaves first:
//!
//! - [`discovery`]: installed interpreter lookup
//! - [`registry`]: the in-memory environment model and its reconciliation
//! - [`lifecycle`]: create / activate / delete, dispatched by [`EnvSpec`]
//! - [`packages`]: package operations on the active environment
//! - [`session`]: one [`session::ManagerHandle`] per (session, directory)
//!
//! ```ignore
//! use env_core::session::{SessionRegistry, StaticSessionStore};
//! use env_core::EnvSpec;
//!
//! let store = StaticSessionStore::default();
//! store.bind("s1", "/path/to/project");
//! let sessions = SessionRegistry::new(Arc::new(store), settings);
//! let handle = sessions.handle("s1")?;
//! handle.create_environment("dev", EnvSpec::venv(), None, &cancel).await?;
//! handle.activate_environment("dev").await?;
//! handle.install_packages(&["requests".into()], &cancel).await?;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

mod backend;
pub mod discovery;
pub mod error;
pub mod index;
pub mod layout;
pub mod lifecycle;
pub mod packages;
pub mod progress;
pub mod registry;
pub mod requirements;
pub mod session;
pub mod settings;

// Re-export key types
pub use error::{EnvError, ErrorKind, ErrorReport};
pub use progress::{EnvProgressPhase, LogHandler, ProgressHandler};
pub use settings::ManagerSettings;
pub use tokio_util::sync::CancellationToken;

pub type Result<T, E = EnvError> = std::result::Result<T, E>;

/// The three supported environment flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvKind {
    Venv,
    Conda,
    Poetry,
}

impl fmt::Display for EnvKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvKind::Venv => write!(f, "venv"),
            EnvKind::Conda => write!(f, "conda"),
            EnvKind::Poetry => write!(f, "poetry"),
        }
    }
}

impl FromStr for EnvKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "venv" => Ok(EnvKind::Venv),
            "conda" => Ok(EnvKind::Conda),
            "poetry" => Ok(EnvKind::Poetry),
            other => Err(format!(
                "unknown environment kind '{}' (expected venv, conda, or poetry)",
                other
            )),
        }
    }
}

/// Kind-specific creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EnvSpec {
    Venv {
        /// Give the environment access to the base interpreter's packages.
        #[serde(default)]
        system_site_packages: bool,
    },
    Conda {
        /// Channels to create from; empty means the configured defaults.
        #[serde(default)]
        channels: Vec<String>,
    },
    Poetry,
}

impl EnvSpec {
    pub fn venv() -> Self {
        EnvSpec::Venv {
            system_site_packages: false,
        }
    }

    pub fn conda() -> Self {
        EnvSpec::Conda { channels: vec![] }
    }

    pub fn kind(&self) -> EnvKind {
        match self {
            EnvSpec::Venv { .. } => EnvKind::Venv,
            EnvSpec::Conda { .. } => EnvKind::Conda,
            EnvSpec::Poetry => EnvKind::Poetry,
        }
    }
}

impl From<EnvKind> for EnvSpec {
    fn from(kind: EnvKind) -> Self {
        match kind {
            EnvKind::Venv => EnvSpec::venv(),
            EnvKind::Conda => EnvSpec::conda(),
            EnvKind::Poetry => EnvSpec::Poetry,
        }
    }
}

/// One installed (or installable) package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub installed_version: String,
    /// Only set when the package is known to be outdated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

/// An environment as reported to callers, with a freshly fetched package list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEnvironment {
    pub name: String,
    pub path: PathBuf,
    pub kind: EnvKind,
    pub python_version: Option<String>,
    pub packages: Vec<PackageRecord>,
    pub is_active: bool,
}

/// Canonical package identity: lowercase with `-`, `_`, `.` runs folded to `-`.
pub fn normalize_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('-');
        }
        pending_sep = false;
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// Case-insensitive package identity check.
pub fn same_package(a: &str, b: &str) -> bool {
    normalize_package_name(a) == normalize_package_name(b)
}
