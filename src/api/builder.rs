use std::{env, path::PathBuf, sync::Arc};

use anyhow::Context;
use home::home_dir;

use crate::{
    cache::PkgfetchCache,
    config::PkgfetchConfig,
    fetcher::{FetchOptions, NO_PREPARE_ENV},
    git::{Git2Client, GitClient},
    integrity::Integrity,
    model::hosted::Protocol,
    npm::{InstallRunner, NpmInstaller, DEFAULT_INSTALL_ARGS, DEFAULT_NPM_BIN},
    Pkgfetch,
};

const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";
const DEFAULT_TAG: &str = "latest";

#[derive(Default)]
pub struct PkgfetchBuilder {
    // Relative file and directory specifiers are resolved against `root`
    root: Option<PathBuf>,
    cache_directory_path: Option<PathBuf>,
    registry: Option<String>,
    git_protocol: Option<Protocol>,
    npm_bin: Option<PathBuf>,
    install_args: Option<Vec<String>>,
    default_tag: Option<String>,
    integrity: Option<Integrity>,
    clone_cache: bool,
    no_prepare: Option<Vec<String>>,
    forge_mirror: Option<String>,
    git_client: Option<Arc<dyn GitClient>>,
    installer: Option<Arc<dyn InstallRunner>>,
    config: Option<PkgfetchConfig>,
}

impl PkgfetchBuilder {
    /// Base directory for relative paths.
    ///
    /// Defaults to the current directory.
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.root = Some(path.into());
        self
    }

    /// Location of the pkgfetch cache directory.
    ///
    /// Defaults to `$HOME/.pkgfetch/cache`.
    pub fn cache_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_directory_path = Some(path.into());
        self
    }

    /// Defaults to `https://registry.npmjs.org/`.
    pub fn registry(mut self, url: impl Into<String>) -> Self {
        self.registry = Some(url.into());
        self
    }

    /// Transport tried first for hosted git repositories.
    ///
    /// Defaults to ssh.
    pub fn git_protocol(mut self, protocol: Protocol) -> Self {
        self.git_protocol = Some(protocol);
        self
    }

    /// Executable used to prepare git dependencies.
    pub fn npm_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.npm_bin = Some(path.into());
        self
    }

    /// Defaults to `install --force --no-package-lock`.
    pub fn install_args(mut self, args: Vec<String>) -> Self {
        self.install_args = Some(args);
        self
    }

    /// Dist-tag preferred when a registry specifier has no range.
    pub fn default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = Some(tag.into());
        self
    }

    /// Integrity every fetched tarball must have.
    pub fn integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    pub fn clone_cache(mut self, enabled: bool) -> Self {
        self.clone_cache = enabled;
        self
    }

    /// Resolved identifiers already being prepared by an outer process.
    ///
    /// Defaults to the lines of `_PKGFETCH_NO_PREPARE_`.
    pub fn no_prepare(mut self, resolved: Vec<String>) -> Self {
        self.no_prepare = Some(resolved);
        self
    }

    /// Serves hosted tarball downloads from `url` instead of the forge.
    pub fn forge_mirror(mut self, url: impl Into<String>) -> Self {
        self.forge_mirror = Some(url.into());
        self
    }

    pub fn git_client(mut self, client: Arc<dyn GitClient>) -> Self {
        self.git_client = Some(client);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn InstallRunner>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Fallback for every setting left unset.
    pub fn config(mut self, config: PkgfetchConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn try_build(self) -> anyhow::Result<Pkgfetch> {
        let Self {
            root,
            cache_directory_path,
            registry,
            git_protocol,
            npm_bin,
            install_args,
            default_tag,
            integrity,
            clone_cache,
            no_prepare,
            forge_mirror,
            git_client,
            installer,
            config,
        } = self;
        let config = config.unwrap_or_default();
        let root = match root {
            Some(root) => root,
            None => env::current_dir()?,
        };

        let cache_directory = match cache_directory_path.or(config.cache_dir) {
            Some(path) => root.join(path),
            None => default_cache_directory()?,
        };
        let cache = PkgfetchCache::new(cache_directory)?;

        let installer = match installer {
            Some(installer) => installer,
            None => Arc::new(NpmInstaller::new(
                npm_bin
                    .or(config.npm_bin)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_NPM_BIN)),
                install_args.unwrap_or_else(|| {
                    DEFAULT_INSTALL_ARGS.iter().map(|s| s.to_string()).collect()
                }),
            )),
        };

        let no_prepare = no_prepare.unwrap_or_else(|| {
            env::var(NO_PREPARE_ENV)
                .map(|value| {
                    value
                        .lines()
                        .filter(|line| !line.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default()
        });

        let http = reqwest::Client::builder()
            .user_agent(concat!("pkgfetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Could not create HTTP client")?;

        let options = FetchOptions {
            cache,
            registry: registry
                .or(config.registry_url)
                .unwrap_or_else(|| DEFAULT_REGISTRY.to_owned()),
            git_protocol: git_protocol.or(config.git_protocol).unwrap_or(Protocol::Ssh),
            default_tag: default_tag.unwrap_or_else(|| DEFAULT_TAG.to_owned()),
            integrity,
            git: git_client.unwrap_or_else(|| Arc::new(Git2Client::new())),
            installer,
            http,
            clone_cache,
            no_prepare,
            base_dir: root.clone(),
            forge_mirror,
        };

        Ok(Pkgfetch { options, root })
    }
}

fn default_cache_directory() -> anyhow::Result<PathBuf> {
    let mut cache_directory =
        home_dir().context("Could not find home dir. Please define $HOME env variable.")?;
    cache_directory.push(".pkgfetch/cache");
    Ok(cache_directory)
}
