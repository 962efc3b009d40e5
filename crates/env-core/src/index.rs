//! Remote package index client (PyPI or a compatible mirror).
//!
//! Search scrapes the index's HTML search page, since the index has no JSON
//! search API. Project metadata comes from `/pypi/<name>/json`.

use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::{EnvError, Result};

const USER_AGENT: &str = concat!("envctl/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One search hit, in the index's ranking order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Project metadata from the index's JSON API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProject {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub home_page: Option<String>,
    #[serde(default)]
    pub requires_dist: Option<Vec<String>>,
}

impl IndexProject {
    /// Unconditional dependencies: entries without an `extra == ...` marker.
    pub fn direct_dependencies(&self) -> Vec<String> {
        self.requires_dist
            .iter()
            .flatten()
            .filter(|req| !req.contains("extra =="))
            .map(|req| crate::requirements::requirement_name(req.trim()).to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    info: IndexProject,
}

#[derive(Debug, Clone)]
pub struct PackageIndex {
    base_url: String,
    client: reqwest::Client,
}

impl PackageIndex {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EnvError::RegistryUnavailable(format!("HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Search the index, keeping at most `limit` results.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let url = self.url("/search/");
        debug!("[index] Searching {} for '{}'", url, query);

        let response = self
            .client
            .get(&url)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;
        if !response.status().is_success() {
            return Err(EnvError::RegistryUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let html = response.text().await.map_err(|e| unavailable(&url, e))?;

        let mut results = parse_search_html(&html);
        results.truncate(limit);
        Ok(results)
    }

    /// Project metadata, `None` when the index does not know the name.
    pub async fn project(&self, name: &str) -> Result<Option<IndexProject>> {
        let url = self.url(&format!("/pypi/{}/json", name));
        debug!("[index] Fetching {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EnvError::RegistryUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: ProjectResponse = response.json().await.map_err(|e| unavailable(&url, e))?;
        Ok(Some(body.info))
    }
}

fn unavailable(url: &str, err: reqwest::Error) -> EnvError {
    warn!("[index] Request to {} failed: {}", url, err);
    EnvError::RegistryUnavailable(format!("{}: {}", url, err))
}

struct SnippetPatterns {
    name: Regex,
    version: Regex,
    description: Regex,
}

fn snippet_patterns() -> Option<&'static SnippetPatterns> {
    static PATTERNS: OnceLock<Option<SnippetPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(SnippetPatterns {
                name: Regex::new(r#"class="package-snippet__name"[^>]*>([^<]*)<"#).ok()?,
                version: Regex::new(r#"class="package-snippet__version"[^>]*>([^<]*)<"#).ok()?,
                description: Regex::new(r#"(?s)class="package-snippet__description"[^>]*>(.*?)</p>"#)
                    .ok()?,
            })
        })
        .as_ref()
}

/// Extract results from the index's search page, in page order.
pub fn parse_search_html(html: &str) -> Vec<SearchResult> {
    let Some(patterns) = snippet_patterns() else {
        return Vec::new();
    };
    let capture = |re: &Regex, chunk: &str| {
        re.captures(chunk)
            .and_then(|c| c.get(1))
            .map(|m| unescape_html(m.as_str().trim()))
            .unwrap_or_default()
    };

    html.split(r#"class="package-snippet""#)
        .skip(1)
        .filter_map(|chunk| {
            let name = capture(&patterns.name, chunk);
            if name.is_empty() {
                return None;
            }
            Some(SearchResult {
                version: capture(&patterns.version, chunk),
                description: capture(&patterns.description, chunk),
                name,
            })
        })
        .collect()
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}
