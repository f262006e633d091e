mod git;

use std::{
    fs::File,
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, trace, warn};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::integrity::{Hash, Integrity, IntegrityHasher};

pub use git::CloneCache;

const TMP_DIR: &str = "tmp";
const CONTENT_DIR: &str = "content";
const CLONES_DIR: &str = "git";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache location {location} does not exist")]
    BadLocation { location: String },
    #[error("Cache lock cannot be acquired: {0}")]
    Lock(#[from] crate::flock::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Shared on-disk cache: scratch directories, a content-addressed tarball
/// store and, optionally, pinned git checkouts.
///
/// Cheap to clone; every clone refers to the same location.
#[derive(Clone, Debug)]
pub struct PkgfetchCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    location: PathBuf,
}

impl PkgfetchCache {
    pub fn new(location: PathBuf) -> Result<PkgfetchCache, CacheError> {
        if location.exists() {
            if !location.is_dir() {
                return Err(CacheError::BadLocation {
                    location: location.display().to_string(),
                });
            }
        } else {
            std::fs::create_dir_all(&location)?;
        }
        Ok(PkgfetchCache {
            inner: Arc::new(CacheInner { location }),
        })
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        if self.location().exists() {
            info!("Clearing pkgfetch cache {}.", self.location().display());
            std::fs::remove_dir_all(self.location())?;
        }
        Ok(())
    }

    fn tmp_root(&self) -> Result<PathBuf, CacheError> {
        let path = self.location().join(TMP_DIR);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Runs `handler` with a fresh directory under the cache root. The
    /// directory is removed once the handler settles, whatever the outcome,
    /// and also when the returned future is dropped early.
    pub async fn with_tmp<F, Fut, T, E>(&self, prefix: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{prefix}-"))
            .tempdir_in(self.tmp_root()?)
            .map_err(CacheError::from)?;
        trace!("Created scratch directory {}", dir.path().display());

        let result = handler(dir.path().to_path_buf()).await;

        let path = dir.path().to_path_buf();
        if let Err(error) = dir.close() {
            warn!("Failed to remove {}: {}", path.display(), error);
        }
        result
    }

    pub fn content_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_hex();
        self.location()
            .join(CONTENT_DIR)
            .join(hash.algorithm.name())
            .join(&hex[..2])
            .join(&hex)
    }

    /// Location of a stored blob matching `integrity`, if any.
    pub fn find(&self, integrity: &Integrity) -> Option<PathBuf> {
        let path = self.content_path(integrity.strongest());
        path.is_file().then_some(path)
    }

    pub fn open_blob(&self, integrity: &Integrity) -> Result<Option<File>, CacheError> {
        match self.find(integrity) {
            Some(path) => Ok(Some(File::open(path)?)),
            None => Ok(None),
        }
    }

    /// A writer that hashes what it is given and lands in the content store
    /// on [`BlobWriter::commit`]. Dropping it uncommitted discards the data.
    pub fn blob_writer(&self) -> Result<BlobWriter, CacheError> {
        Ok(BlobWriter {
            cache: self.clone(),
            file: NamedTempFile::new_in(self.tmp_root()?)?,
            hasher: IntegrityHasher::new(),
        })
    }

    pub fn clone_cache(&self) -> CloneCache {
        CloneCache::new(self.location().join(CLONES_DIR))
    }
}

pub struct BlobWriter {
    cache: PkgfetchCache,
    file: NamedTempFile,
    hasher: IntegrityHasher,
}

impl BlobWriter {
    /// Integrity of everything written so far.
    pub fn integrity(&self) -> Integrity {
        self.hasher.clone().finish()
    }

    pub fn commit(mut self) -> Result<Integrity, CacheError> {
        self.file.flush()?;
        let integrity = self.hasher.finish();
        let target = self.cache.content_path(integrity.strongest());
        if target.is_file() {
            debug!("{} is already cached", target.display());
            return Ok(integrity);
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.file.persist(&target).map_err(|e| e.error)?;
        trace!("Stored {}", target.display());
        Ok(integrity)
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn reject_file_location() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            PkgfetchCache::new(file),
            Err(CacheError::BadLocation { .. })
        ));
    }

    #[tokio::test]
    async fn scratch_dir_removed_on_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().join("cache")).unwrap();

        let seen = cache
            .with_tmp("ok", |path| async move {
                std::fs::write(path.join("file"), "x")?;
                Ok::<_, CacheError>(path)
            })
            .await
            .unwrap();
        assert!(!seen.exists());

        let mut failed_path = None;
        let result: Result<(), CacheError> = cache
            .with_tmp("fail", |path| {
                failed_path = Some(path);
                async { Err(io::Error::other("boom").into()) }
            })
            .await;
        assert!(result.is_err());
        assert!(!failed_path.unwrap().exists());
    }

    #[test]
    fn store_and_find_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PkgfetchCache::new(dir.path().to_path_buf()).unwrap();

        let mut writer = cache.blob_writer().unwrap();
        writer.write_all(b"tarball bytes").unwrap();
        let integrity = writer.commit().unwrap();

        assert_eq!(integrity, Integrity::from_bytes(b"tarball bytes"));
        let path = cache.find(&integrity).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"tarball bytes");
        assert!(cache.find(&Integrity::from_bytes(b"other")).is_none());
    }
}
