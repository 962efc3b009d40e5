//! Installing missing tools from a conda channel with rattler.
//!
//! A [`Bootstrapper`] owns a cache directory with one prefix per tool
//! request. The prefix name carries a hash of the package, the version pin,
//! the channel, and the platform, so changing any of them installs afresh
//! while an unchanged request is served from disk without touching the
//! network.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use rattler::{default_cache_dir, install::Installer, package_cache::PackageCache};
use rattler_conda_types::{
    Channel, ChannelConfig, GenericVirtualPackage, MatchSpec, ParseMatchSpecOptions, Platform,
    RepoDataRecord,
};
use rattler_repodata_gateway::Gateway;
use rattler_solve::{resolvo, SolverImpl, SolverTask};
use reqwest_middleware::ClientWithMiddleware;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::tools::is_executable;

/// Default location of bootstrapped tool prefixes.
pub fn default_tools_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("envctl")
        .join("tools")
}

/// One tool to bootstrap: the conda package, the binary it ships, and an
/// optional version pin in conda match syntax (`"0.5"`, `"0.5.*"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapRequest<'a> {
    pub package: &'a str,
    pub binary: &'a str,
    pub version: Option<&'a str>,
}

impl BootstrapRequest<'_> {
    fn match_spec(&self) -> String {
        match self.version {
            Some(v) => format!("{}={}", self.package, v),
            None => self.package.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bootstrapper {
    channel: String,
    tools_dir: PathBuf,
    /// Repodata and package cache; rattler's shared cache when unset.
    rattler_cache: Option<PathBuf>,
}

impl Default for Bootstrapper {
    fn default() -> Self {
        Self::new("conda-forge")
    }
}

impl Bootstrapper {
    /// Bootstrap from `channel`, a channel name or URL.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            tools_dir: default_tools_dir(),
            rattler_cache: None,
        }
    }

    pub fn with_tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = dir.into();
        self
    }

    pub fn with_rattler_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rattler_cache = Some(dir.into());
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Prefix a request installs into.
    pub fn prefix(&self, request: &BootstrapRequest<'_>) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(request.match_spec().as_bytes());
        hasher.update(b"@");
        hasher.update(self.channel.as_bytes());
        hasher.update(b"@");
        hasher.update(Platform::current().to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.tools_dir
            .join(format!("{}-{}", request.package, &digest[..12]))
    }

    /// The binary from an earlier bootstrap of this request, if it is usable.
    pub fn installed(&self, request: &BootstrapRequest<'_>) -> Option<PathBuf> {
        let binary = prefix_binary(&self.prefix(request), request.binary);
        is_executable(&binary).then_some(binary)
    }

    /// Return the request's binary, installing the package first if needed.
    ///
    /// A prefix left without its binary by an interrupted install is wiped
    /// and installed again.
    pub async fn ensure(&self, request: &BootstrapRequest<'_>) -> Result<PathBuf> {
        if let Some(binary) = self.installed(request) {
            debug!("[bootstrap] Reusing {:?}", binary);
            return Ok(binary);
        }

        let prefix = self.prefix(request);
        info!(
            "[bootstrap] Installing {} from {} into {:?}",
            request.match_spec(),
            self.channel,
            prefix
        );
        tokio::fs::create_dir_all(&self.tools_dir)
            .await
            .with_context(|| format!("creating {}", self.tools_dir.display()))?;
        if prefix.exists() {
            tokio::fs::remove_dir_all(&prefix).await?;
        }

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::builder().build()?)
            .build();
        let records = self.solve(request, &client).await?;
        info!(
            "[bootstrap] Solved {} to {} packages",
            request.package,
            records.len()
        );

        Installer::new()
            .with_download_client(client)
            .with_target_platform(Platform::current())
            .install(&prefix, records)
            .await
            .map_err(|e| anyhow!("installing {} failed: {}", request.package, e))?;

        let binary = prefix_binary(&prefix, request.binary);
        if !is_executable(&binary) {
            return Err(anyhow!(
                "{} installed but provides no {} binary",
                request.package,
                request.binary
            ));
        }
        Ok(binary)
    }

    fn rattler_cache_dir(&self) -> Result<PathBuf> {
        let dir = match &self.rattler_cache {
            Some(dir) => dir.clone(),
            None => default_cache_dir()
                .map_err(|e| anyhow!("no rattler cache directory: {}", e))?,
        };
        rattler_cache::ensure_cache_dir(&dir)
            .map_err(|e| anyhow!("cannot create {}: {}", dir.display(), e))?;
        Ok(dir)
    }

    /// Fetch repodata for the request and solve it for this machine.
    async fn solve(
        &self,
        request: &BootstrapRequest<'_>,
        client: &ClientWithMiddleware,
    ) -> Result<Vec<RepoDataRecord>> {
        let cache = self.rattler_cache_dir()?;
        let channel = Channel::from_str(
            &self.channel,
            &ChannelConfig::default_with_root_dir(self.tools_dir.clone()),
        )?;
        let spec = MatchSpec::from_str(&request.match_spec(), ParseMatchSpecOptions::strict())?;

        let gateway = Gateway::builder()
            .with_cache_dir(cache.join(rattler_cache::REPODATA_CACHE_DIR))
            .with_package_cache(PackageCache::new(
                cache.join(rattler_cache::PACKAGE_CACHE_DIR),
            ))
            .with_client(client.clone())
            .finish();
        let repo_data = gateway
            .query(
                vec![channel],
                vec![Platform::current(), Platform::NoArch],
                vec![spec.clone()],
            )
            .recursive(true)
            .await
            .map_err(|e| anyhow!("fetching repodata from {} failed: {}", self.channel, e))?;

        let virtual_packages = rattler_virtual_packages::VirtualPackage::detect(
            &rattler_virtual_packages::VirtualPackageOverrides::default(),
        )?
        .iter()
        .map(|vpkg| GenericVirtualPackage::from(vpkg.clone()))
        .collect::<Vec<_>>();

        let task = SolverTask {
            virtual_packages,
            specs: vec![spec],
            ..SolverTask::from_iter(&repo_data)
        };
        Ok(resolvo::Solver
            .solve(task)
            .map_err(|e| anyhow!("no installable {} found: {}", request.match_spec(), e))?
            .records)
    }
}

fn prefix_binary(prefix: &Path, binary: &str) -> PathBuf {
    if cfg!(windows) {
        prefix
            .join("Library")
            .join("bin")
            .join(format!("{}.exe", binary))
    } else {
        prefix.join("bin").join(binary)
    }
}
