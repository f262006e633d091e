use std::{
    fs::File,
    path::Path,
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::debug;
use thiserror::Error;

const LOCK_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_MILLIS: u64 = 50;

/// Exclusive advisory lock held for as long as the value lives.
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
#[error("could not lock {path}: {source}")]
pub struct Error {
    path: String,
    source: std::io::Error,
}

impl FileLock {
    /// Blocks until the lock is acquired, giving up after five minutes.
    pub fn acquire(path: &Path) -> Result<Self, Error> {
        Self::acquire_with_timeout(path, LOCK_TIMEOUT)
    }

    pub fn acquire_with_timeout(path: &Path, timeout: Duration) -> Result<Self, Error> {
        let error = |source| Error {
            path: path.display().to_string(),
            source,
        };
        let file = File::create(path).map_err(error)?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => return Ok(Self { _file: file }),
                Ok(false) if start.elapsed() < timeout => {
                    debug!("{} is locked by another process, waiting", path.display());
                    std::thread::sleep(Duration::from_millis(POLL_MILLIS));
                }
                Ok(false) => return Err(error(fs4::lock_contended_error())),
                Err(e) => return Err(error(e)),
            }
        }
    }
}
