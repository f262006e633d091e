use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{io::AsyncReadExt, sync::OnceCell};

use crate::{
    archive,
    fetcher::{
        tarball::{spawn_tarball, TarballSink, TarballSource, TarballStream},
        FetchError, FetchOptions, Fetcher,
    },
    integrity::{self, Integrity},
    model::{manifest::Manifest, spec::PackageSpec},
};

const READ_CHUNK: usize = 64 * 1024;

/// A tarball on the local file system.
#[derive(Clone)]
pub struct FileFetcher {
    inner: Arc<FileInner>,
}

struct FileInner {
    spec: PackageSpec,
    path: PathBuf,
    opts: FetchOptions,
    resolved: String,
    integrity: Arc<OnceLock<String>>,
    package: OnceCell<Manifest>,
}

impl FileFetcher {
    pub fn new(spec: PackageSpec, path: PathBuf, opts: FetchOptions) -> FileFetcher {
        let resolved = format!("file:{}", path.display());
        FileFetcher {
            inner: Arc::new(FileInner {
                spec,
                path,
                opts,
                resolved,
                integrity: Arc::new(OnceLock::new()),
                package: OnceCell::new(),
            }),
        }
    }

    async fn stream_file(&self, sink: &TarballSink) -> Result<(), FetchError> {
        let mut file = tokio::fs::File::open(&self.inner.path).await?;
        let mut buf = vec![0; READ_CHUNK];
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                return Ok(());
            }
            sink.send(Bytes::copy_from_slice(&buf[..read])).await?;
        }
    }

    async fn load_manifest(&self) -> Result<Manifest, FetchError> {
        let path = self.inner.path.clone();
        let cache = self.inner.opts.cache.clone();
        let integrity = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let mut blob = cache.blob_writer()?;
            std::io::copy(&mut file, &mut blob)?;
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
            .with_tmp("file-extract", |dir: PathBuf| async move {
                let path = self.inner.path.clone();
                let target = dir.clone();
                tokio::task::spawn_blocking(move || {
                    archive::extract(std::fs::File::open(&path)?, &target)
                })
                .await??;
                Manifest::from_dir(&dir).map_err(|source| FetchError::MissingManifest {
                    path: self.inner.path.display().to_string(),
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
            Some(self.inner.resolved.clone()),
            Some(self.inner.spec.raw.clone()),
        ))
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
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
                from: Some(self.inner.spec.raw.clone()),
                integrity: self.inner.integrity.clone(),
            },
            move |sink| async move { this.stream_file(&sink).await },
        )
    }

    fn integrity(&self) -> Option<String> {
        self.inner.integrity.get().cloned()
    }
}
