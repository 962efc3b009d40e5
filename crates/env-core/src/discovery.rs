//! Interpreter discovery for a manager handle.
//!
//! Wraps [`env_tools::discover_interpreters`] with the configured extra
//! search paths. Every call rescans, so interpreters installed while a
//! manager is alive are picked up.

use env_tools::{discover_interpreters, probe_version, version_matches, PythonInstallation};
use log::debug;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct InterpreterDiscovery {
    extra_dirs: Vec<PathBuf>,
}

impl InterpreterDiscovery {
    pub fn new(extra_dirs: Vec<PathBuf>) -> Self {
        Self { extra_dirs }
    }

    /// Scan for interpreters, newest first. Never fails; an empty list means
    /// nothing usable was found.
    pub async fn discover(&self) -> Vec<PythonInstallation> {
        discover_interpreters(&self.extra_dirs).await
    }

    /// Pick the interpreter for a new environment.
    ///
    /// - `None`: the default interpreter, else the newest one found
    /// - a path: that executable, if it answers `--version`, whether or not
    ///   a scan would find it
    /// - anything else: the newest interpreter whose version starts with it
    pub async fn resolve(&self, selector: Option<&str>) -> Option<PythonInstallation> {
        let Some(selector) = selector.map(str::trim).filter(|s| !s.is_empty()) else {
            let found = self.discover().await;
            return found
                .iter()
                .find(|p| p.is_default)
                .or_else(|| found.first())
                .cloned();
        };

        if looks_like_path(selector) {
            return probe_path(Path::new(selector)).await;
        }

        let found = self.discover().await;
        let matched = found
            .into_iter()
            .find(|p| version_matches(&p.version, selector));
        debug!("[discovery] Selector '{}' resolved to {:?}", selector, matched);
        matched
    }
}

fn looks_like_path(selector: &str) -> bool {
    selector.contains('/') || selector.contains('\\') || selector.starts_with('.')
}

async fn probe_path(path: &Path) -> Option<PythonInstallation> {
    if !env_tools::tools::is_executable(path) {
        debug!("[discovery] {:?} is not an executable", path);
        return None;
    }
    let version = probe_version(path).await?;
    Some(PythonInstallation {
        version,
        executable_path: path.to_path_buf(),
        is_default: false,
    })
}
