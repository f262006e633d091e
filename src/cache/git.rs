use std::path::{Path, PathBuf};

use log::{debug, trace};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::{cache::CacheError, flock::FileLock};

/// Checkouts of pinned commits, keyed by remote url and sha.
///
/// Layout: `<root>/<sha256(url)>/<sha>/`. Entries are immutable once
/// published; writers serialize on `<root>/<sha256(url)>/.lock`.
#[derive(Debug, Clone)]
pub struct CloneCache {
    root: PathBuf,
}

impl CloneCache {
    pub(super) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn repo_dir(&self, url: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(normalize_url(url))))
    }

    pub fn entry(&self, url: &str, sha: &str) -> PathBuf {
        self.repo_dir(url).join(sha)
    }

    /// Copies a cached checkout into `dest`. Returns `false` on a miss.
    pub fn restore(&self, url: &str, sha: &str, dest: &Path) -> Result<bool, CacheError> {
        let entry = self.entry(url, sha);
        if !entry.is_dir() {
            return Ok(false);
        }
        debug!("Restoring {}#{} from {}", url, sha, entry.display());
        copy_tree(&entry, dest)?;
        Ok(true)
    }

    /// Publishes a checkout. A concurrent writer that got there first wins.
    pub fn store(&self, url: &str, sha: &str, checkout: &Path) -> Result<(), CacheError> {
        let repo_dir = self.repo_dir(url);
        std::fs::create_dir_all(&repo_dir)?;
        let _lock = FileLock::acquire(&repo_dir.join(".lock"))?;

        let entry = repo_dir.join(sha);
        if entry.is_dir() {
            trace!("{} already cached", entry.display());
            return Ok(());
        }

        let staging = tempfile::tempdir_in(&repo_dir)?;
        copy_tree(checkout, staging.path())?;
        std::fs::rename(staging.keep(), &entry)?;
        debug!("Cached checkout of {}#{} at {}", url, sha, entry.display());
        Ok(())
    }
}

fn normalize_url(url: &str) -> String {
    let url = url.strip_prefix("git+").unwrap_or(url);
    let url = url.trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);
    url.to_ascii_lowercase()
}

/// Copies a working tree, leaving out the `.git` directory.
fn copy_tree(from: &Path, to: &Path) -> Result<(), CacheError> {
    let walker = WalkDir::new(from)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = match entry.path().strip_prefix(from) {
            Ok(relative) if relative.as_os_str().is_empty() => continue,
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::copy(from, to).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_equivalent_urls() {
        assert_eq!(
            normalize_url("git+https://Example.com/repo.git"),
            normalize_url("https://example.com/repo/")
        );
    }

    #[test]
    fn store_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CloneCache::new(dir.path().join("git"));
        let sha = "a".repeat(40);

        let checkout = dir.path().join("checkout");
        std::fs::create_dir_all(checkout.join(".git")).unwrap();
        std::fs::create_dir_all(checkout.join("lib")).unwrap();
        std::fs::write(checkout.join("package.json"), "{}").unwrap();
        std::fs::write(checkout.join("lib/index.js"), "x").unwrap();

        let dest = dir.path().join("dest");
        assert!(!cache.restore("https://example.com/repo.git", &sha, &dest).unwrap());

        cache
            .store("https://example.com/repo.git", &sha, &checkout)
            .unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        assert!(cache.restore("git+https://example.com/repo", &sha, &dest).unwrap());

        assert_eq!(std::fs::read_to_string(dest.join("lib/index.js")).unwrap(), "x");
        assert!(dest.join("package.json").is_file());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn store_publishes_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CloneCache::new(dir.path().join("git"));
        let sha = "b".repeat(40);
        let checkout = dir.path().join("checkout");
        std::fs::create_dir_all(&checkout).unwrap();
        std::fs::write(checkout.join("package.json"), "{}").unwrap();

        cache.store("https://example.com/repo.git", &sha, &checkout).unwrap();
        cache.store("https://example.com/repo.git", &sha, &checkout).unwrap();

        let entry = cache.entry("https://example.com/repo.git", &sha);
        let mut names: Vec<String> = std::fs::read_dir(entry.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![".lock".to_owned(), sha.clone()]);
        assert!(entry.join("package.json").is_file());
    }
}
