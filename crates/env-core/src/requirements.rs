//! Requirements snapshots: `name[==version]` lines.

use std::path::Path;

use crate::{normalize_package_name, PackageRecord};

/// Packaging tools `pip freeze` leaves out of a snapshot.
const BOOTSTRAP_PACKAGES: &[&str] = &["pip", "setuptools", "wheel", "distribute"];

fn is_bootstrap_package(name: &str) -> bool {
    let name = normalize_package_name(name);
    BOOTSTRAP_PACKAGES.iter().any(|p| *p == name)
}

/// Render a snapshot of `packages` in their given order.
pub fn render(packages: &[PackageRecord], include_versions: bool) -> String {
    let mut out = String::new();
    for package in packages.iter().filter(|p| !is_bootstrap_package(&p.name)) {
        if include_versions && !package.installed_version.is_empty() {
            out.push_str(&format!("{}=={}\n", package.name, package.installed_version));
        } else {
            out.push_str(&package.name);
            out.push('\n');
        }
    }
    out
}

/// Requirement specifiers in a requirements file, in file order.
///
/// Blank lines, comments, and option lines (`-r`, `--index-url`, ...) are
/// skipped; trailing comments and environment markers are kept off.
pub fn parse(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| match line.find(" #") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(|line| line.split(';').next().unwrap_or(line).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// The distribution name in a requirement specifier.
///
/// `"requests[socks]>=2.0"` -> `"requests"`
pub fn requirement_name(spec: &str) -> &str {
    let end = spec
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(spec.len());
    &spec[..end]
}

/// Read and parse a requirements file.
pub async fn read(path: &Path) -> std::io::Result<Vec<String>> {
    Ok(parse(&tokio::fs::read_to_string(path).await?))
}
