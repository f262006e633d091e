mod dir;
mod file;
mod git;
mod registry;
mod remote;
pub mod tarball;

#[cfg(test)]
pub(crate) mod testing;

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    archive::ArchiveError,
    cache::{CacheError, PkgfetchCache},
    git::{GitClient, GitError},
    integrity::Integrity,
    model::{
        hosted::Protocol,
        manifest::{Manifest, Packument},
        spec::{PackageSpec, Source},
        ParseError,
    },
    npm::{InstallError, InstallRunner},
};

pub use dir::DirFetcher;
pub use file::FileFetcher;
pub use git::GitFetcher;
pub use registry::RegistryFetcher;
pub use remote::RemoteFetcher;
pub use tarball::{TarballData, TarballStream};

/// Environment variable listing, one per line, the resolved git packages
/// already being prepared further up the process tree.
pub const NO_PREPARE_ENV: &str = "_PKGFETCH_NO_PREPARE_";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid specifier: {0}")]
    Parse(#[from] ParseError),
    #[error("No remote location could be derived from `{spec}`")]
    NoRemote { spec: String },
    #[error("No version of {name} matches `{wanted}`")]
    NoMatchingVersion { name: String, wanted: String },
    #[error("Could not read package.json in {path}: {source}")]
    MissingManifest { path: String, source: ParseError },
    #[error("git dependency preparation failed for {resolved}: {source}")]
    Prepare {
        resolved: String,
        source: InstallError,
    },
    #[error("Integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Extract(#[from] ArchiveError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Tarball stream was cancelled")]
    Cancelled,
}

impl FetchError {
    pub(crate) fn is_http(&self) -> bool {
        matches!(self, FetchError::Http(_) | FetchError::HttpStatus { .. })
    }
}

/// Settings and collaborators shared by every fetcher.
#[derive(Clone)]
pub struct FetchOptions {
    pub cache: PkgfetchCache,
    pub registry: String,
    /// Transport tried first for hosted git repositories.
    pub git_protocol: Protocol,
    pub default_tag: String,
    /// Integrity the fetched tarball must have.
    pub integrity: Option<Integrity>,
    pub git: Arc<dyn GitClient>,
    pub installer: Arc<dyn InstallRunner>,
    pub http: reqwest::Client,
    /// Reuse checkouts of pinned commits across fetchers.
    pub clone_cache: bool,
    /// Resolved identifiers whose preparation is already in progress.
    pub no_prepare: Vec<String>,
    /// Base for relative file and directory specifiers.
    pub base_dir: PathBuf,
    /// Replaces `https://<forge domain>` when downloading hosted tarballs.
    pub forge_mirror: Option<String>,
}

/// The operations every package source supports.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn spec(&self) -> &PackageSpec;

    fn options(&self) -> &FetchOptions;

    /// Canonical identifier of the exact source. Idempotent.
    async fn resolve(&self) -> Result<String, FetchError>;

    /// `package.json` decorated with `_integrity`, `_resolved` and `_from`.
    async fn manifest(&self) -> Result<Manifest, FetchError>;

    /// Every version available. Sources with a single version describe just
    /// that one.
    async fn packument(&self) -> Result<Packument, FetchError> {
        let manifest = self.manifest().await?;
        Ok(Packument::from_manifest(manifest, &self.options().default_tag))
    }

    /// Starts producing the tarball; see [`TarballStream`].
    fn tarball(&self) -> TarballStream;

    /// Integrity of the tarball, once known.
    fn integrity(&self) -> Option<String>;
}

/// A fetcher for any kind of specifier.
#[derive(Clone)]
pub enum AnyFetcher {
    Registry(RegistryFetcher),
    Git(GitFetcher),
    Directory(DirFetcher),
    File(FileFetcher),
    Remote(RemoteFetcher),
}

pub fn fetcher_for(spec: PackageSpec, options: FetchOptions) -> Result<AnyFetcher, FetchError> {
    Ok(match spec.source.clone() {
        Source::Registry { .. } => AnyFetcher::Registry(RegistryFetcher::new(spec, options)?),
        Source::Git(_) => AnyFetcher::Git(GitFetcher::new(spec, options)?),
        Source::Directory { path } => {
            let path = options.base_dir.join(path);
            AnyFetcher::Directory(DirFetcher::new(spec, path, options))
        }
        Source::File { path } => {
            let path = options.base_dir.join(path);
            AnyFetcher::File(FileFetcher::new(spec, path, options))
        }
        Source::Remote { url } => AnyFetcher::Remote(RemoteFetcher::new(spec, url, options)),
    })
}

impl AnyFetcher {
    fn inner(&self) -> &dyn Fetcher {
        match self {
            AnyFetcher::Registry(fetcher) => fetcher,
            AnyFetcher::Git(fetcher) => fetcher,
            AnyFetcher::Directory(fetcher) => fetcher,
            AnyFetcher::File(fetcher) => fetcher,
            AnyFetcher::Remote(fetcher) => fetcher,
        }
    }
}

#[async_trait]
impl Fetcher for AnyFetcher {
    fn spec(&self) -> &PackageSpec {
        self.inner().spec()
    }

    fn options(&self) -> &FetchOptions {
        self.inner().options()
    }

    async fn resolve(&self) -> Result<String, FetchError> {
        self.inner().resolve().await
    }

    async fn manifest(&self) -> Result<Manifest, FetchError> {
        self.inner().manifest().await
    }

    async fn packument(&self) -> Result<Packument, FetchError> {
        self.inner().packument().await
    }

    fn tarball(&self) -> TarballStream {
        self.inner().tarball()
    }

    fn integrity(&self) -> Option<String> {
        self.inner().integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fetcher::testing::{options, FakeGit};

    #[tokio::test]
    async fn dispatch_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path(), Arc::new(FakeGit::default()));

        let kind = |raw: &str| {
            let spec = PackageSpec::parse(raw).unwrap();
            match fetcher_for(spec, options.clone()).unwrap() {
                AnyFetcher::Registry(_) => "registry",
                AnyFetcher::Git(_) => "git",
                AnyFetcher::Directory(_) => "directory",
                AnyFetcher::File(_) => "file",
                AnyFetcher::Remote(_) => "remote",
            }
        };
        assert_eq!(kind("lodash@^4"), "registry");
        assert_eq!(kind("github:owner/repo"), "git");
        assert_eq!(kind("./pkg"), "directory");
        assert_eq!(kind("./pkg.tgz"), "file");
        assert_eq!(kind("https://example.com/pkg.tgz"), "remote");
    }

    #[tokio::test]
    async fn directory_paths_are_relative_to_base() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("pkg");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("package.json"), r#"{"name":"a","version":"1.0.0"}"#).unwrap();

        let mut options = options(&dir.path().join("cache"), Arc::new(FakeGit::default()));
        options.base_dir = dir.path().to_path_buf();
        let fetcher = fetcher_for(PackageSpec::parse("./pkg").unwrap(), options).unwrap();

        let packument = fetcher.packument().await.unwrap();
        assert_eq!(packument.dist_tags["latest"], "1.0.0");
        assert!(packument.versions["1.0.0"].integrity.is_some());
    }
}
