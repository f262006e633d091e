use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::sync::OnceCell;
use url::Url;

use crate::{
    cache::CloneCache,
    fetcher::{
        dir::DirFetcher,
        remote::RemoteFetcher,
        tarball::{spawn_tarball, TarballSink, TarballSource, TarballStream},
        FetchError, FetchOptions, Fetcher, NO_PREPARE_ENV,
    },
    git::{is_full_sha, GitError, RemoteRefs, RevDoc},
    integrity::{self, Integrity},
    model::{
        manifest::Manifest,
        spec::{GitSource, PackageSpec},
    },
    pick::pick_version,
};

/// A package in a git repository.
///
/// Resolution pins the requested committish to a commit sha. Hosted
/// repositories pinned to a sha are downloaded as the forge's tarball
/// instead of being cloned.
#[derive(Clone)]
pub struct GitFetcher {
    inner: Arc<GitInner>,
}

struct GitInner {
    spec: PackageSpec,
    git: GitSource,
    opts: FetchOptions,
    from: String,
    resolved: OnceCell<String>,
    /// Never changes once set.
    resolved_sha: OnceLock<String>,
    resolved_ref: OnceLock<RevDoc>,
    integrity: Arc<OnceLock<String>>,
    package: OnceCell<Manifest>,
}

impl GitInner {
    fn remotes(&self) -> Vec<String> {
        match &self.git.hosted {
            Some(hosted) => hosted.remotes(self.opts.git_protocol),
            None if self.git.fetch_spec.is_empty() => Vec::new(),
            None => vec![self.git.fetch_spec.clone()],
        }
    }

    fn no_remote(&self) -> FetchError {
        FetchError::NoRemote {
            spec: self.spec.raw.clone(),
        }
    }

    fn pin_sha(&self, sha: &str) -> &str {
        self.resolved_sha.get_or_init(|| sha.to_ascii_lowercase())
    }

    /// The resolved identifier for a commit: the forge's tarball url for
    /// hosted repositories, otherwise the original url with `#sha`.
    fn resolved_with_sha(&self, sha: &str) -> String {
        match &self.git.hosted {
            Some(hosted) => {
                let pinned = hosted.with_committish(Some(sha));
                pinned.tarball_url().unwrap_or_else(|| pinned.shortcut())
            }
            None => pin_url(&self.spec.raw_spec, sha),
        }
    }

    /// Forge tarball to download instead of cloning, when resolution landed
    /// on one.
    fn shortcut_tarball(&self) -> Option<String> {
        let hosted = self.git.hosted.as_ref()?;
        let sha = self.resolved_sha.get()?;
        let resolved = self.resolved.get()?;
        let url = hosted.with_committish(Some(sha)).tarball_url()?;
        (*resolved == url).then_some(url)
    }

    fn download_url(&self, url: &str) -> String {
        let (Some(mirror), Some(hosted)) = (&self.opts.forge_mirror, &self.git.hosted) else {
            return url.to_owned();
        };
        let origin = format!("https://{}", hosted.forge.domain());
        match url.strip_prefix(&origin) {
            Some(rest) => format!("{}{}", mirror.trim_end_matches('/'), rest),
            None => url.to_owned(),
        }
    }
}

fn pin_url(raw: &str, sha: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(Some(sha));
            url.to_string()
        }
        // scp-like addresses are not urls.
        Err(_) => {
            let base = raw.split('#').next().unwrap_or(raw);
            format!("{base}#{sha}")
        }
    }
}

fn reset_dir(dir: &Path) -> Result<(), FetchError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

impl GitFetcher {
    pub fn new(spec: PackageSpec, opts: FetchOptions) -> Result<GitFetcher, FetchError> {
        let git = spec.git().cloned().ok_or_else(|| FetchError::NoRemote {
            spec: spec.raw.clone(),
        })?;
        let from = match &git.hosted {
            Some(hosted) => hosted.with_committish(git.committish.as_deref()).shortcut(),
            None => spec.raw_spec.clone(),
        };

        let mut inner = GitInner {
            spec,
            git,
            opts,
            from,
            resolved: OnceCell::new(),
            resolved_sha: OnceLock::new(),
            resolved_ref: OnceLock::new(),
            integrity: Arc::new(OnceLock::new()),
            package: OnceCell::new(),
        };

        // A full sha needs no lookup.
        let pinned = inner
            .git
            .committish
            .clone()
            .filter(|committish| is_full_sha(committish));
        if let Some(sha) = pinned {
            if inner.git.hosted.is_some() || !inner.git.fetch_spec.is_empty() {
                let sha = inner.pin_sha(&sha).to_owned();
                inner.resolved = OnceCell::new_with(Some(inner.resolved_with_sha(&sha)));
            }
        }

        Ok(GitFetcher {
            inner: Arc::new(inner),
        })
    }

    /// The ref the committish or range resolved to, when refs were listed.
    pub fn resolved_ref(&self) -> Option<&RevDoc> {
        self.inner.resolved_ref.get()
    }

    pub fn resolved_sha(&self) -> Option<&str> {
        self.inner.resolved_sha.get().map(String::as_str)
    }

    async fn resolve_remote(&self) -> Result<String, FetchError> {
        let remotes = self.inner.remotes();
        if remotes.is_empty() {
            return Err(self.inner.no_remote());
        }
        let refs = self.list_refs(&remotes).await?;
        match self.select(&refs)? {
            Some(doc) => {
                debug!(
                    "{} resolved to {} ({})",
                    self.inner.spec.raw, doc.sha, doc.raw_ref
                );
                let sha = self.inner.pin_sha(&doc.sha).to_owned();
                let _ = self.inner.resolved_ref.set(doc);
                Ok(self.inner.resolved_with_sha(&sha))
            }
            None => self.resolve_from_clone().await,
        }
    }

    async fn list_refs(&self, remotes: &[String]) -> Result<RemoteRefs, FetchError> {
        let mut unreachable = None;
        for remote in remotes {
            match self.inner.opts.git.revs(remote).await {
                Ok(refs) => return Ok(refs),
                Err(error @ GitError::RemoteUnreachable { .. }) => {
                    warn!("Failed to list refs of {}: {}", remote, error);
                    unreachable = Some(error);
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(match unreachable {
            Some(error) => error.into(),
            None => self.inner.no_remote(),
        })
    }

    /// Picks the ref to pin. `None` when the listing cannot answer, such as
    /// for `HEAD~3`.
    fn select(&self, refs: &RemoteRefs) -> Result<Option<RevDoc>, FetchError> {
        let git = &self.inner.git;
        if let Some(range) = &git.range {
            let version = pick_version(
                refs.versions.keys(),
                &refs.dist_tags,
                range,
                &self.inner.opts.default_tag,
            )
            .ok_or_else(|| FetchError::NoMatchingVersion {
                name: self
                    .inner
                    .spec
                    .name
                    .clone()
                    .unwrap_or_else(|| git.fetch_spec.clone()),
                wanted: range.clone(),
            })?;
            return Ok(refs.versions.get(&version).cloned());
        }
        Ok(match &git.committish {
            Some(committish) => refs.lookup(committish),
            None => refs.head().cloned(),
        })
    }

    async fn resolve_from_clone(&self) -> Result<String, FetchError> {
        info!(
            "Refs of {} do not name `{}`, cloning to resolve it",
            self.inner.git.fetch_spec,
            self.inner.git.committish.as_deref().unwrap_or("HEAD")
        );
        self.with_clone(|_| async { Ok(()) }).await?;
        let sha = self
            .inner
            .resolved_sha
            .get()
            .ok_or_else(|| self.inner.no_remote())?;
        Ok(self.inner.resolved_with_sha(sha))
    }

    /// Runs `handler` on a scratch directory holding the package tree. The
    /// directory is removed afterwards whatever the outcome.
    async fn with_clone<F, Fut, T>(&self, handler: F) -> Result<T, FetchError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.inner
            .opts
            .cache
            .with_tmp("git-clone", |dir| async move {
                if let Some(url) = self.inner.shortcut_tarball() {
                    let url = self.inner.download_url(&url);
                    let remote = RemoteFetcher::new(
                        self.inner.spec.clone(),
                        url.clone(),
                        self.inner.opts.clone(),
                    );
                    match remote.extract(&dir).await {
                        Ok(()) => return handler(dir).await,
                        Err(error) if error.is_http() => {
                            warn!(
                                "Failed to download {}, falling back to a clone: {}",
                                url, error
                            );
                            reset_dir(&dir)?;
                        }
                        Err(error) => return Err(error),
                    }
                }
                self.clone_into(&dir).await?;
                handler(dir).await
            })
            .await
    }

    async fn clone_into(&self, dir: &Path) -> Result<(), FetchError> {
        let remotes = self.inner.remotes();
        if remotes.is_empty() {
            return Err(self.inner.no_remote());
        }
        let pinned = self.inner.resolved_sha.get().cloned();
        let reference = pinned.clone().or_else(|| self.inner.git.committish.clone());
        let clones = self
            .inner
            .opts
            .clone_cache
            .then(|| self.inner.opts.cache.clone_cache());

        if let (Some(clones), Some(sha)) = (&clones, &pinned) {
            for remote in &remotes {
                let (clones, remote, sha, dest) =
                    (clones.clone(), remote.clone(), sha.clone(), dir.to_path_buf());
                let restored =
                    tokio::task::spawn_blocking(move || clones.restore(&remote, &sha, &dest))
                        .await??;
                if restored {
                    return Ok(());
                }
            }
        }

        let mut unreachable = None;
        for remote in &remotes {
            match self
                .inner
                .opts
                .git
                .checkout(remote, reference.as_deref(), dir)
                .await
            {
                Ok(sha) => {
                    let sha = self.inner.pin_sha(&sha).to_owned();
                    if self.inner.resolved.set(self.inner.resolved_with_sha(&sha)).is_err() {
                        trace!("{} was already resolved", self.inner.spec.raw);
                    }
                    if let Some(clones) = clones {
                        self.store_clone(clones, remote, &sha, dir).await;
                    }
                    return Ok(());
                }
                Err(error @ GitError::RemoteUnreachable { .. }) => {
                    warn!("Failed to clone {}: {}", remote, error);
                    reset_dir(dir)?;
                    unreachable = Some(error);
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(match unreachable {
            Some(error) => error.into(),
            None => self.inner.no_remote(),
        })
    }

    async fn store_clone(&self, clones: CloneCache, remote: &str, sha: &str, dir: &Path) {
        let (remote, sha, checkout) = (remote.to_owned(), sha.to_owned(), dir.to_path_buf());
        match tokio::task::spawn_blocking(move || clones.store(&remote, &sha, &checkout)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("Failed to cache checkout: {}", error),
            Err(error) => warn!("Failed to cache checkout: {}", error),
        }
    }

    /// Installs dependencies when the package has lifecycle scripts that
    /// may need them.
    async fn prepare(&self, dir: &Path) -> Result<(), FetchError> {
        let manifest = Manifest::from_dir(dir).map_err(|source| FetchError::MissingManifest {
            path: self.inner.spec.raw.clone(),
            source,
        })?;
        if !manifest.has_install_scripts() {
            trace!("{} has no install scripts", self.inner.spec.raw);
            return Ok(());
        }

        let resolved = self.resolve().await?;
        let opts = &self.inner.opts;
        if opts.no_prepare.contains(&resolved) {
            info!("{} is already being prepared, skipping", resolved);
            return Ok(());
        }
        let mut chain = opts.no_prepare.clone();
        chain.push(resolved.clone());
        let env = [(NO_PREPARE_ENV.to_owned(), chain.join("\n"))];

        info!("Preparing git dependency {}", resolved);
        opts.installer
            .install(dir, &env)
            .await
            .map_err(|source| FetchError::Prepare { resolved, source })
    }

    fn directory(&self, dir: PathBuf, resolved: String) -> DirFetcher {
        DirFetcher::for_path(
            self.inner.spec.clone(),
            dir,
            self.inner.opts.clone(),
            resolved,
            Some(self.inner.from.clone()),
        )
    }

    async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let resolved = self.resolve().await?;
        let (manifest, integrity) = self
            .with_clone(|dir| {
                let resolved = resolved.clone();
                async move {
                    self.prepare(&dir).await?;
                    self.directory(dir, resolved).read_package().await
                }
            })
            .await?;

        if let Some(expected) = &self.inner.opts.integrity {
            if !expected.matches(&integrity) {
                return Err(FetchError::Integrity {
                    expected: expected.to_string(),
                    actual: integrity::label(&integrity),
                });
            }
        }
        let label = self
            .inner
            .integrity
            .get_or_init(|| integrity::label(&integrity))
            .clone();
        Ok(manifest.decorate(Some(label), Some(resolved), Some(self.inner.from.clone())))
    }

    async fn produce_tarball(&self, sink: &TarballSink) -> Result<(), FetchError> {
        let resolved = self.resolve().await?;
        sink.set_resolved(&resolved);
        self.with_clone(|dir| async move {
            self.prepare(&dir).await?;
            self.directory(dir, resolved).pack_into(sink).await
        })
        .await
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    fn spec(&self) -> &PackageSpec {
        &self.inner.spec
    }

    fn options(&self) -> &FetchOptions {
        &self.inner.opts
    }

    async fn resolve(&self) -> Result<String, FetchError> {
        self.inner
            .resolved
            .get_or_try_init(|| self.resolve_remote())
            .await
            .cloned()
    }

    async fn manifest(&self) -> Result<Manifest, FetchError> {
        self.inner
            .package
            .get_or_try_init(|| self.load_manifest())
            .await
            .cloned()
    }

    fn tarball(&self) -> TarballStream {
        let known = self.inner.opts.integrity.clone().or_else(|| {
            self.inner
                .integrity
                .get()
                .and_then(|integrity| integrity.parse::<Integrity>().ok())
        });
        let this = self.clone();
        spawn_tarball(
            TarballSource {
                cache: self.inner.opts.cache.clone(),
                known,
                resolved: self.inner.resolved.get().cloned(),
                from: Some(self.inner.from.clone()),
                integrity: self.inner.integrity.clone(),
            },
            move |sink| async move { this.produce_tarball(&sink).await },
        )
    }

    fn integrity(&self) -> Option<String> {
        self.inner.integrity.get().cloned()
    }
}
