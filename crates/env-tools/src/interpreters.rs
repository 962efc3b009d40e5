//! Python interpreter discovery.
//!
//! Scans `PATH` plus the usual install locations (system prefixes, Homebrew,
//! pyenv, python.org framework builds) for `python`, `python3`, and
//! `python3.X` executables, asks each for its version, and returns them
//! newest first. A candidate that cannot be executed or reports garbage is
//! dropped; an empty result just means nothing usable was found.

use futures::future::join_all;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::tools::{find_on_path, is_executable};

/// An installed interpreter as observed by the last scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonInstallation {
    pub version: String,
    pub executable_path: PathBuf,
    pub is_default: bool,
}

/// Extract the version from `python --version` output (`"Python 3.11.4"`).
pub fn parse_python_version(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let version = line.strip_prefix("Python ")?.split_whitespace().next()?;
    if !version.chars().next()?.is_ascii_digit() || !version.contains('.') {
        return None;
    }
    Some(version.to_string())
}

/// Numeric sort key for a version string; pre-release suffixes are ignored.
///
/// `"3.13.0rc1"` -> `[3, 13, 0]`
pub fn version_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Whether `selector` names this version (`"3"`, `"3.11"`, `"3.11.4"`).
pub fn version_matches(version: &str, selector: &str) -> bool {
    let want = version_key(selector);
    let have = version_key(version);
    !want.is_empty() && have.len() >= want.len() && have[..want.len()] == want[..]
}

/// Whether a file name looks like a CPython launcher.
fn is_python_name(name: &str) -> bool {
    let name = name
        .strip_suffix(std::env::consts::EXE_SUFFIX)
        .filter(|_| !std::env::consts::EXE_SUFFIX.is_empty())
        .unwrap_or(name);
    let Some(rest) = name.strip_prefix("python") else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    // python3, python3.11 - but not python3-config or python3.11m-config
    rest.split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        && rest.split('.').count() <= 2
}

/// Directories probed in addition to `PATH`.
fn standard_locations() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();

    #[cfg(not(target_os = "windows"))]
    {
        for dir in [
            "/usr/bin",
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/opt/local/bin",
        ] {
            dirs_out.push(PathBuf::from(dir));
        }
        dirs_out.extend(version_subdirs(
            Path::new("/Library/Frameworks/Python.framework/Versions"),
            "bin",
        ));
        if let Some(home) = dirs::home_dir() {
            dirs_out.push(home.join(".local").join("bin"));
            dirs_out.extend(version_subdirs(&home.join(".pyenv").join("versions"), "bin"));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local) = dirs::data_local_dir() {
            dirs_out.extend(version_subdirs(&local.join("Programs").join("Python"), ""));
        }
    }

    dirs_out
}

/// `<root>/<each child>/<leaf>` for every child directory of `root`.
fn version_subdirs(root: &Path, leaf: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|p| if leaf.is_empty() { p } else { p.join(leaf) })
        .collect();
    found.sort();
    found
}

/// Every python-looking executable under `dirs`, deduplicated by real path.
fn collect_candidates(search_dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen_dirs = HashSet::new();
    let mut seen_targets = HashSet::new();
    let mut candidates = Vec::new();

    for dir in search_dirs {
        if !seen_dirs.insert(dir.clone()) {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| is_python_name(n))
            .collect();
        names.sort();

        for name in names {
            let path = dir.join(&name);
            if !is_executable(&path) {
                continue;
            }
            let target = path.canonicalize().unwrap_or_else(|_| path.clone());
            if seen_targets.insert(target) {
                candidates.push(path);
            }
        }
    }

    candidates
}

/// Run `<python> --version` and parse the answer.
///
/// Python 2 prints its version on stderr, so both streams are checked.
pub async fn probe_version(python: &Path) -> Option<String> {
    let output = tokio::process::Command::new(python)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("[discovery] {:?} --version failed", python);
        return None;
    }
    parse_python_version(&String::from_utf8_lossy(&output.stdout))
        .or_else(|| parse_python_version(&String::from_utf8_lossy(&output.stderr)))
}

/// The interpreter `python3` (or `python`) resolves to on `PATH`.
fn default_interpreter() -> Option<PathBuf> {
    find_on_path("python3")
        .or_else(|| find_on_path("python"))
        .map(|p| p.canonicalize().unwrap_or(p))
}

/// Scan for installed interpreters, newest first.
///
/// `extra_dirs` are probed after `PATH` and the standard locations.
pub async fn discover_interpreters(extra_dirs: &[PathBuf]) -> Vec<PythonInstallation> {
    let mut search_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    search_dirs.extend(standard_locations());
    search_dirs.extend(extra_dirs.iter().cloned());

    // Directory listing and canonicalisation run on the blocking pool
    let scanned = tokio::task::spawn_blocking(move || {
        let default = default_interpreter();
        collect_candidates(search_dirs)
            .into_iter()
            .map(|path| {
                let is_default = default.as_ref().is_some_and(|d| {
                    path.canonicalize().map(|c| &c == d).unwrap_or(false)
                });
                (path, is_default)
            })
            .collect::<Vec<(PathBuf, bool)>>()
    })
    .await;
    let candidates = match scanned {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("[discovery] Interpreter scan failed: {}", e);
            return Vec::new();
        }
    };
    debug!("[discovery] Probing {} candidates", candidates.len());

    let versions = join_all(candidates.iter().map(|(c, _)| probe_version(c))).await;

    let mut found: Vec<PythonInstallation> = candidates
        .into_iter()
        .zip(versions)
        .filter_map(|((path, is_default), version)| {
            let version = version?;
            Some(PythonInstallation {
                version,
                executable_path: path,
                is_default,
            })
        })
        .collect();

    found.sort_by(|a, b| {
        version_key(&b.version)
            .cmp(&version_key(&a.version))
            .then(b.is_default.cmp(&a.is_default))
            .then(a.executable_path.cmp(&b.executable_path))
    });

    debug!("[discovery] Found {} interpreters", found.len());
    found
}
