use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
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

/// A tarball downloaded over HTTP.
#[derive(Clone)]
pub struct RemoteFetcher {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    spec: PackageSpec,
    url: String,
    opts: FetchOptions,
    integrity: Arc<OnceLock<String>>,
    package: OnceCell<Manifest>,
}

impl RemoteFetcher {
    pub fn new(spec: PackageSpec, url: String, opts: FetchOptions) -> RemoteFetcher {
        RemoteFetcher {
            inner: Arc::new(RemoteInner {
                spec,
                url,
                opts,
                integrity: Arc::new(OnceLock::new()),
                package: OnceCell::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    async fn get(&self) -> Result<reqwest::Response, FetchError> {
        debug!("GET {}", self.inner.url);
        let response = self.inner.opts.http.get(&self.inner.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: self.inner.url.clone(),
                status,
            });
        }
        Ok(response)
    }

    /// Streams the response body into `sink`.
    pub(crate) async fn download(&self, sink: &TarballSink) -> Result<(), FetchError> {
        let response = self.get().await?;
        sink.pipe(Box::pin(response.bytes_stream())).await
    }

    async fn fetch_bytes(&self) -> Result<Bytes, FetchError> {
        Ok(self.get().await?.bytes().await?)
    }

    /// Downloads the tarball and unpacks it into `dest`, dropping the
    /// top-level directory.
    pub(crate) async fn extract(&self, dest: &Path) -> Result<(), FetchError> {
        let bytes = self.fetch_bytes().await?;
        info!("Extracting {} into {}", self.inner.url, dest.display());
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || archive::extract(bytes.as_ref(), &dest)).await??;
        Ok(())
    }

    async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let bytes = self.fetch_bytes().await?;
        let cache = self.inner.opts.cache.clone();
        let stored = bytes.clone();
        let integrity = tokio::task::spawn_blocking(move || {
            let mut blob = cache.blob_writer()?;
            blob.write_all(&stored)?;
            Ok::<Integrity, FetchError>(blob.commit()?)
        })
        .await??;
        if let Some(expected) = &self.inner.opts.integrity {
            if !expected.matches(&integrity) {
                return Err(FetchError::Integrity {
                    expected: expected.to_string(),
                    actual: integrity::label(&integrity),
                });
            }
        }

        let manifest = self
            .inner
            .opts
            .cache
            .with_tmp("remote-extract", |dir: PathBuf| async move {
                let target = dir.clone();
                tokio::task::spawn_blocking(move || archive::extract(bytes.as_ref(), &target))
                    .await??;
                Manifest::from_dir(&dir).map_err(|source| FetchError::MissingManifest {
                    path: self.inner.url.clone(),
                    source,
                })
            })
            .await?;

        let label = self
            .inner
            .integrity
            .get_or_init(|| integrity::label(&integrity))
            .clone();
        Ok(manifest.decorate(
            Some(label),
            Some(self.inner.url.clone()),
            Some(self.inner.spec.raw.clone()),
        ))
    }
}

#[async_trait]
impl Fetcher for RemoteFetcher {
    fn spec(&self) -> &PackageSpec {
        &self.inner.spec
    }

    fn options(&self) -> &FetchOptions {
        &self.inner.opts
    }

    async fn resolve(&self) -> Result<String, FetchError> {
        Ok(self.inner.url.clone())
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
                resolved: Some(self.inner.url.clone()),
                from: Some(self.inner.spec.raw.clone()),
                integrity: self.inner.integrity.clone(),
            },
            move |sink| async move { this.download(&sink).await },
        )
    }

    fn integrity(&self) -> Option<String> {
        self.inner.integrity.get().cloned()
    }
}
