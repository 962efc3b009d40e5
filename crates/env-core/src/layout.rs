//! On-disk layout of managed environments.
//!
//! Every environment lives at `<env_root>/<name>`. The kind is recognised
//! from what the creating tool leaves behind:
//!
//! - conda: a `conda-meta/` directory
//! - venv: a `pyvenv.cfg` file
//! - poetry: a single nested virtualenv (`<name>/<project>-<hash>-py3.X/`),
//!   because poetry runs with `POETRY_VIRTUALENVS_PATH=<env_root>/<name>`
//!
//! Anything else in the env root is not an environment.

use log::debug;
use std::path::{Path, PathBuf};

use crate::EnvKind;

/// Interpreter inside a venv-style directory.
pub fn venv_python(venv_dir: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        venv_dir.join("Scripts").join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        venv_dir.join("bin").join("python")
    }
}

/// Interpreter inside a conda prefix.
pub fn conda_python(prefix: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        prefix.join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        prefix.join("bin").join("python")
    }
}

/// The virtualenv poetry created under `env_path`, newest first if several.
pub fn poetry_venv_dir(env_path: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(env_path).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join("pyvenv.cfg").is_file())
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

/// Recognise the kind of environment stored in `dir`, if any.
pub fn detect_kind(dir: &Path) -> Option<EnvKind> {
    if dir.join("conda-meta").is_dir() {
        Some(EnvKind::Conda)
    } else if dir.join("pyvenv.cfg").is_file() {
        Some(EnvKind::Venv)
    } else if poetry_venv_dir(dir).is_some() {
        Some(EnvKind::Poetry)
    } else {
        None
    }
}

/// Interpreter path for an environment of `kind` at `env_path`.
///
/// For poetry this needs the nested virtualenv to exist; before creation the
/// conventional venv path under `env_path` is returned.
pub fn python_path(kind: EnvKind, env_path: &Path) -> PathBuf {
    match kind {
        EnvKind::Venv => venv_python(env_path),
        EnvKind::Conda => conda_python(env_path),
        EnvKind::Poetry => {
            venv_python(&poetry_venv_dir(env_path).unwrap_or_else(|| env_path.to_path_buf()))
        }
    }
}

/// Keep the leading dotted-numeric part: `"3.11.4.final.0"` -> `"3.11.4"`.
fn clean_version(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw
        .trim()
        .split('.')
        .take_while(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        .take(3)
        .collect();
    if parts.len() < 2 {
        return None;
    }
    Some(parts.join("."))
}

/// Python version recorded in a `pyvenv.cfg`.
pub fn parse_pyvenv_cfg(contents: &str) -> Option<String> {
    let mut version = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            // uv and virtualenv write version_info, stdlib venv writes version
            "version_info" => return clean_version(value),
            "version" => version = clean_version(value),
            _ => {}
        }
    }
    version
}

/// Python version from a conda prefix's `conda-meta/python-<ver>-<build>.json`.
pub fn conda_python_version(prefix: &Path) -> Option<String> {
    let entries = std::fs::read_dir(prefix.join("conda-meta")).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let rest = name.strip_prefix("python-")?.strip_suffix(".json")?;
            let version = rest.split('-').next()?;
            version
                .starts_with(|c: char| c.is_ascii_digit())
                .then(|| version.to_string())
        })
        .next()
}

/// Version of the environment's interpreter, read from files only.
pub fn read_python_version(kind: EnvKind, env_path: &Path) -> Option<String> {
    let venv_dir = match kind {
        EnvKind::Conda => return conda_python_version(env_path),
        EnvKind::Venv => env_path.to_path_buf(),
        EnvKind::Poetry => poetry_venv_dir(env_path)?,
    };
    let contents = std::fs::read_to_string(venv_dir.join("pyvenv.cfg")).ok()?;
    parse_pyvenv_cfg(&contents)
}

/// An environment directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedEnv {
    pub name: String,
    pub kind: EnvKind,
    pub path: PathBuf,
    pub python_path: PathBuf,
    pub python_version: Option<String>,
}

/// Result of scanning an env root.
#[derive(Debug, Default)]
pub struct DirectoryScan {
    pub found: Vec<DetectedEnv>,
    /// Directories that do not look like any known environment.
    pub ignored: Vec<PathBuf>,
}

/// Scan `env_root` for environment directories.
///
/// A missing env root is an empty scan, not an error. The directory walk
/// and marker-file reads run on the blocking pool.
pub async fn scan_env_root(env_root: &Path) -> std::io::Result<DirectoryScan> {
    let env_root = env_root.to_path_buf();
    tokio::task::spawn_blocking(move || scan_dir(&env_root))
        .await
        .map_err(std::io::Error::other)?
}

fn scan_dir(env_root: &Path) -> std::io::Result<DirectoryScan> {
    let mut scan = DirectoryScan::default();

    let entries = match std::fs::read_dir(env_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        match detect_kind(&path) {
            Some(kind) => {
                debug!("[layout] Found {} environment at {:?}", kind, path);
                scan.found.push(DetectedEnv {
                    python_path: python_path(kind, &path),
                    python_version: read_python_version(kind, &path),
                    name,
                    kind,
                    path,
                });
            }
            None => {
                debug!("[layout] Ignoring unrecognised directory {:?}", path);
                scan.ignored.push(path);
            }
        }
    }

    scan.found.sort_by(|a, b| a.name.cmp(&b.name));
    scan.ignored.sort();
    Ok(scan)
}
