//! Manager settings.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/envctl/settings.json
//! - Linux: ~/.config/envctl/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\envctl\settings.json
//!
//! A few fields can be overridden from the environment (`ENVCTL_INDEX_URL`,
//! `ENVCTL_ENV_DIR`, `ENVCTL_BOOTSTRAP_TOOLS`).

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which pip frontend to use for venv and conda environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallerPreference {
    /// `uv pip`, falling back to pip when uv is unavailable
    #[default]
    Uv,
    /// `python -m pip`
    Pip,
}

impl std::fmt::Display for InstallerPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallerPreference::Uv => write!(f, "uv"),
            InstallerPreference::Pip => write!(f, "pip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Directory (relative to the working directory) holding environments.
    #[serde(default = "default_env_dir")]
    pub env_dir: PathBuf,

    #[serde(default)]
    pub installer: InstallerPreference,

    /// Package index base URL used by search and info lookups.
    #[serde(default = "default_index_url")]
    pub index_url: String,

    /// Requirements file name used when no path is given.
    #[serde(default = "default_requirements_file")]
    pub requirements_file: String,

    /// Install missing tools from a conda channel instead of failing.
    #[serde(default)]
    pub bootstrap_tools: bool,

    /// Channel bootstrapped tools come from.
    #[serde(default = "default_bootstrap_channel")]
    pub bootstrap_channel: String,

    /// Version pins for bootstrapped tools, e.g. `{"uv": "0.5.*"}`.
    #[serde(default)]
    pub tool_versions: BTreeMap<String, String>,

    /// Where bootstrapped tools are installed; the user cache when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_dir: Option<PathBuf>,

    #[serde(default = "default_conda_channels")]
    pub conda_channels: Vec<String>,

    /// Packages installed into every new environment
    #[serde(default, deserialize_with = "deserialize_package_list")]
    pub seed_packages: Vec<String>,

    /// Extra directories probed for Python interpreters
    #[serde(default)]
    pub search_extra_paths: Vec<PathBuf>,
}

fn default_env_dir() -> PathBuf {
    PathBuf::from(".venvs")
}

fn default_index_url() -> String {
    "https://pypi.org".to_string()
}

fn default_requirements_file() -> String {
    "requirements.txt".to_string()
}

fn default_bootstrap_channel() -> String {
    "conda-forge".to_string()
}

fn default_conda_channels() -> Vec<String> {
    vec!["conda-forge".to_string()]
}

/// Deserialize a package list that accepts both:
/// - `"numpy, pandas"` (comma-separated string)
/// - `["numpy", "pandas"]` (JSON array)
fn deserialize_package_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct PackageListVisitor;

    impl<'de> de::Visitor<'de> for PackageListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(PackageListVisitor)
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            env_dir: default_env_dir(),
            installer: InstallerPreference::Uv,
            index_url: default_index_url(),
            requirements_file: default_requirements_file(),
            bootstrap_tools: false,
            bootstrap_channel: default_bootstrap_channel(),
            tool_versions: BTreeMap::new(),
            tools_dir: None,
            conda_channels: default_conda_channels(),
            seed_packages: vec![],
            search_extra_paths: vec![],
        }
    }
}

impl ManagerSettings {
    /// Where environments for `working_dir` live.
    pub fn env_root(&self, working_dir: &Path) -> PathBuf {
        working_dir.join(&self.env_dir)
    }

    /// Apply `ENVCTL_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("ENVCTL_INDEX_URL") {
            if !url.trim().is_empty() {
                self.index_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("ENVCTL_ENV_DIR") {
            if !dir.trim().is_empty() {
                self.env_dir = PathBuf::from(dir.trim());
            }
        }
        if let Ok(flag) = std::env::var("ENVCTL_BOOTSTRAP_TOOLS") {
            self.bootstrap_tools = matches!(flag.trim(), "1" | "true" | "yes");
        }
        self
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("envctl")
        .join("settings.json")
}

/// Load settings from `path`, returning defaults if it is missing or unreadable.
pub fn load_settings_from(path: &Path) -> ManagerSettings {
    if !path.exists() {
        return ManagerSettings::default();
    }
    match std::fs::read_to_string(path).map(|s| serde_json::from_str(&s)) {
        Ok(Ok(settings)) => settings,
        Ok(Err(e)) => {
            warn!("[settings] Ignoring malformed {}: {}", path.display(), e);
            ManagerSettings::default()
        }
        Err(e) => {
            warn!("[settings] Could not read {}: {}", path.display(), e);
            ManagerSettings::default()
        }
    }
}

/// Load settings from disk with environment overrides applied.
pub fn load_settings() -> ManagerSettings {
    load_settings_from(&settings_path()).with_env_overrides()
}
