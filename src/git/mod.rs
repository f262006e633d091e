mod client;
pub mod revs;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

pub use client::Git2Client;
pub use revs::{RefKind, RemoteRefs, RevDoc};

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Remote {url} is unreachable: {source}")]
    RemoteUnreachable { url: String, source: git2::Error },
    #[error("Reference {reference} was not found in {url}")]
    RefNotFound { url: String, reference: String },
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Git task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Version control operations the fetchers depend on.
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Lists the refs a remote advertises.
    async fn revs(&self, remote: &str) -> Result<RemoteRefs, GitError>;

    /// Checks out `reference` (a full sha, a ref name or any revision
    /// expression; the default branch when `None`) of `remote` into the
    /// empty directory `dest`, returning the commit sha.
    async fn checkout(
        &self,
        remote: &str,
        reference: Option<&str>,
        dest: &Path,
    ) -> Result<String, GitError>;
}

pub fn is_full_sha(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
