use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;

use crate::{
    fetcher::{fetcher_for, AnyFetcher, FetchOptions, Fetcher},
    model::{
        manifest::{Manifest, Packument},
        spec::PackageSpec,
    },
};

mod builder;

pub use builder::PkgfetchBuilder;

/// Entry point for fetching packages from any supported source.
pub struct Pkgfetch {
    options: FetchOptions,
    root: PathBuf,
}

/// What was written by [`Pkgfetch::tarball`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TarballOutput {
    pub path: PathBuf,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl Pkgfetch {
    pub fn builder() -> PkgfetchBuilder {
        PkgfetchBuilder::default()
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Parses `spec`, relative paths being taken from the root directory, and
    /// creates the matching fetcher.
    pub fn fetcher(&self, spec: &str) -> anyhow::Result<AnyFetcher> {
        let spec = PackageSpec::parse_with_base(spec, &self.root)?;
        debug!("Fetching {} from a {} source", spec, spec.source.kind());
        Ok(fetcher_for(spec, self.options.clone())?)
    }

    /// Canonical identifier of the exact source `spec` points at.
    pub async fn resolve(&self, spec: &str) -> anyhow::Result<String> {
        Ok(self.fetcher(spec)?.resolve().await?)
    }

    pub async fn manifest(&self, spec: &str) -> anyhow::Result<Manifest> {
        Ok(self.fetcher(spec)?.manifest().await?)
    }

    pub async fn packument(&self, spec: &str) -> anyhow::Result<Packument> {
        Ok(self.fetcher(spec)?.packument().await?)
    }

    /// Writes the tarball of `spec` to `output`. Nothing is left behind on
    /// failure.
    pub async fn tarball(&self, spec: &str, output: &Path) -> anyhow::Result<TarballOutput> {
        let mut stream = self.fetcher(spec)?.tarball();
        let mut file = tokio::fs::File::create(output).await?;
        let size = match stream.write_to(&mut file).await {
            Ok(size) => size,
            Err(error) => {
                drop(file);
                if let Err(cleanup) = tokio::fs::remove_file(output).await {
                    debug!("Could not remove {}: {}", output.display(), cleanup);
                }
                return Err(error.into());
            }
        };
        info!("Wrote {} bytes to {}", size, output.display());
        Ok(TarballOutput {
            path: output.to_path_buf(),
            size,
            resolved: stream.resolved().map(str::to_owned),
            integrity: stream.integrity().map(str::to_owned),
            from: stream.from().map(str::to_owned),
        })
    }

    pub fn clear_cache(&self) -> anyhow::Result<()> {
        self.options.cache.clear()?;
        Ok(())
    }
}
