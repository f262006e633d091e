use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use log::debug;
use tokio::sync::OnceCell;

use crate::{
    archive,
    fetcher::{
        tarball::{spawn_tarball, TarballSink, TarballSource, TarballStream},
        FetchError, FetchOptions, Fetcher,
    },
    integrity::{self, Integrity},
    model::{manifest::Manifest, spec::PackageSpec},
};

/// A package living in a local directory. Its tarball is packed on demand.
#[derive(Clone)]
pub struct DirFetcher {
    inner: Arc<DirInner>,
}

struct DirInner {
    spec: PackageSpec,
    path: PathBuf,
    opts: FetchOptions,
    resolved: String,
    from: Option<String>,
    integrity: Arc<OnceLock<String>>,
    package: OnceCell<Manifest>,
}

impl DirFetcher {
    pub fn new(spec: PackageSpec, path: PathBuf, opts: FetchOptions) -> DirFetcher {
        let resolved = format!("file:{}", path.display());
        let from = Some(spec.raw.clone());
        Self::for_path(spec, path, opts, resolved, from)
    }

    /// A directory standing in for another source, such as a git checkout.
    pub(crate) fn for_path(
        spec: PackageSpec,
        path: PathBuf,
        opts: FetchOptions,
        resolved: String,
        from: Option<String>,
    ) -> DirFetcher {
        DirFetcher {
            inner: Arc::new(DirInner {
                spec,
                path,
                opts,
                resolved,
                from,
                integrity: Arc::new(OnceLock::new()),
                package: OnceCell::new(),
            }),
        }
    }

    /// Reads `package.json` and packs the directory into the content store,
    /// returning the manifest and the integrity of the packed tarball.
    pub(crate) async fn read_package(&self) -> Result<(Manifest, Integrity), FetchError> {
        let path = self.inner.path.clone();
        let cache = self.inner.opts.cache.clone();
        tokio::task::spawn_blocking(move || -> Result<(Manifest, Integrity), FetchError> {
            let manifest =
                Manifest::from_dir(&path).map_err(|source| FetchError::MissingManifest {
                    path: path.display().to_string(),
                    source,
                })?;
            let blob = archive::pack_dir(&path, cache.blob_writer()?)?;
            let integrity = blob.commit()?;
            debug!("Packed {} as {}", path.display(), integrity);
            Ok((manifest, integrity))
        })
        .await?
    }

    /// Packs the directory straight into a tarball stream.
    pub(crate) async fn pack_into(&self, sink: &TarballSink) -> Result<(), FetchError> {
        let path = self.inner.path.clone();
        let writer = sink.blocking_writer();
        tokio::task::spawn_blocking(move || archive::pack_dir(&path, writer).map(drop)).await??;
        Ok(())
    }

    async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let (manifest, integrity) = self.read_package().await?;
        let label = self
            .inner
            .integrity
            .get_or_init(|| integrity::label(&integrity))
            .clone();
        Ok(manifest.decorate(
            Some(label),
            Some(self.inner.resolved.clone()),
            self.inner.from.clone(),
        ))
    }
}

#[async_trait]
impl Fetcher for DirFetcher {
    fn spec(&self) -> &PackageSpec {
        &self.inner.spec
    }

    fn options(&self) -> &FetchOptions {
        &self.inner.opts
    }

    async fn resolve(&self) -> Result<String, FetchError> {
        Ok(self.inner.resolved.clone())
    }

    async fn manifest(&self) -> Result<Manifest, FetchError> {
        self.inner
            .package
            .get_or_try_init(|| self.load_manifest())
            .await
            .cloned()
    }

    fn tarball(&self) -> TarballStream {
        let this = self.clone();
        spawn_tarball(
            TarballSource {
                cache: self.inner.opts.cache.clone(),
                known: self.inner.opts.integrity.clone(),
                resolved: Some(self.inner.resolved.clone()),
                from: self.inner.from.clone(),
                integrity: self.inner.integrity.clone(),
            },
            move |sink| async move { this.pack_into(&sink).await },
        )
    }

    fn integrity(&self) -> Option<String> {
        self.inner.integrity.get().cloned()
    }
}
