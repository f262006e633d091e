use std::path::Path;

use async_trait::async_trait;
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    cert::Cert,
    AutotagOption, CertificateCheckStatus, Config, Cred, CredentialType, ErrorClass, ErrorCode,
    FetchOptions, Object, Oid, RemoteCallbacks, Repository,
};
use log::{debug, trace, warn};
use ssh_key::{known_hosts::HostPatterns, KnownHosts};

use crate::git::{is_full_sha, GitClient, GitError, RemoteRefs};

const GLOBAL_KNOWN_HOSTS: &str = "/etc/ssh/ssh_known_hosts";

/// [`GitClient`] backed by libgit2. Credentials come from the ssh agent and
/// git credential helpers; blocking work runs on the tokio blocking pool.
#[derive(Debug, Default, Clone)]
pub struct Git2Client {}

impl Git2Client {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl GitClient for Git2Client {
    async fn revs(&self, remote: &str) -> Result<RemoteRefs, GitError> {
        let url = remote.to_owned();
        tokio::task::spawn_blocking(move || list_remote(&url)).await?
    }

    async fn checkout(
        &self,
        remote: &str,
        reference: Option<&str>,
        dest: &Path,
    ) -> Result<String, GitError> {
        let url = remote.to_owned();
        let reference = reference.map(str::to_owned);
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || checkout(&url, reference.as_deref(), &dest)).await?
    }
}

fn list_remote(url: &str) -> Result<RemoteRefs, GitError> {
    debug!("Listing refs of {}", url);
    let config = Config::open_default()?;
    // libgit2 wants a repository to hang an anonymous remote on.
    let scratch = tempfile::tempdir()?;
    let repo = Repository::init_bare(scratch.path())?;
    let mut remote = repo.remote_anonymous(url)?;
    let connection = remote
        .connect_auth(git2::Direction::Fetch, Some(remote_callbacks(&config)), None)
        .map_err(|e| classify(url, e))?;
    let pairs: Vec<(String, String)> = connection
        .list()?
        .iter()
        .map(|head| (head.oid().to_string(), head.name().to_owned()))
        .collect();
    trace!("{} advertised {} refs", url, pairs.len());
    Ok(RemoteRefs::from_pairs(pairs))
}

fn checkout(url: &str, reference: Option<&str>, dest: &Path) -> Result<String, GitError> {
    let config = Config::open_default()?;
    match shallow_checkout(&config, url, reference, dest) {
        Ok(sha) => return Ok(sha),
        Err(error) => {
            warn!(
                "Failed to fetch a single revision of {}, falling back to a full clone: {}",
                url, error
            );
            reset_dir(dest)?;
        }
    }
    full_checkout(&config, url, reference, dest)
}

fn shallow_checkout(
    config: &Config,
    url: &str,
    reference: Option<&str>,
    dest: &Path,
) -> Result<String, GitError> {
    let repo = Repository::init(dest)?;
    let mut remote = repo.remote_anonymous(url)?;
    let refspecs = match reference {
        Some(sha) if is_full_sha(sha) => vec![sha.to_owned()],
        Some(name) => vec![
            format!("+refs/heads/{name}:refs/remotes/origin/{name}"),
            format!("+refs/tags/{name}:refs/tags/{name}"),
        ],
        None => vec!["HEAD".to_owned()],
    };
    let mut options = fetch_options(config);
    options.depth(1);
    remote.fetch(&refspecs, Some(&mut options), None)?;

    let object = match reference {
        Some(sha) if is_full_sha(sha) => repo.find_object(Oid::from_str(sha)?, None)?,
        Some(name) => repo
            .revparse_single(&format!("refs/remotes/origin/{name}"))
            .or_else(|_| repo.revparse_single(&format!("refs/tags/{name}")))?,
        None => repo.revparse_single("FETCH_HEAD")?,
    };
    detach_head(&repo, &object)
}

fn full_checkout(
    config: &Config,
    url: &str,
    reference: Option<&str>,
    dest: &Path,
) -> Result<String, GitError> {
    debug!("Cloning {} into {}", url, dest.display());
    let repo = RepoBuilder::new()
        .fetch_options(fetch_options(config))
        .clone(url, dest)
        .map_err(|e| classify(url, e))?;

    let object = match reference {
        None => repo.head()?.peel(git2::ObjectType::Commit)?,
        Some(reference) => repo
            .revparse_single(&format!("origin/{reference}"))
            .or_else(|_| repo.revparse_single(reference))
            .map_err(|_| GitError::RefNotFound {
                url: url.to_owned(),
                reference: reference.to_owned(),
            })?,
    };
    detach_head(&repo, &object)
}

fn detach_head(repo: &Repository, object: &Object<'_>) -> Result<String, GitError> {
    let commit = object.peel_to_commit()?;
    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit.id())?;
    trace!("Checked out {}", commit.id());
    Ok(commit.id().to_string())
}

fn reset_dir(dir: &Path) -> Result<(), GitError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Connection failures are reported as [`GitError::RemoteUnreachable`] so
/// callers can try another transport.
fn classify(url: &str, error: git2::Error) -> GitError {
    let unreachable = matches!(
        error.class(),
        ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http | ErrorClass::Ssl
    ) || matches!(error.code(), ErrorCode::Auth | ErrorCode::Certificate);
    if unreachable {
        GitError::RemoteUnreachable {
            url: url.to_owned(),
            source: error,
        }
    } else {
        GitError::Git(error)
    }
}

fn fetch_options(config: &Config) -> FetchOptions<'_> {
    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(remote_callbacks(config))
        .download_tags(AutotagOption::None);
    fetch_options
}

fn remote_callbacks(config: &Config) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed_types| {
        trace!(
            "Requested credentials for {}, username {:?}, allowed types {:?}",
            url,
            username,
            allowed_types
        );
        if allowed_types.contains(CredentialType::USERNAME) {
            return Cred::username("git");
        }
        if allowed_types.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return Cred::credential_helper(config, url, username);
        }
        Err(git2::Error::from_str("no valid authentication available"))
    });
    callbacks.certificate_check(|certificate, host| {
        check_certificate(certificate, host, Path::new(GLOBAL_KNOWN_HOSTS))
    });
    callbacks
}

fn check_certificate(
    certificate: &Cert<'_>,
    host: &str,
    known_hosts: &Path,
) -> Result<CertificateCheckStatus, git2::Error> {
    if let Some(hostkey) = certificate.as_hostkey().and_then(|h| h.hostkey()) {
        if host_key_is_known(host, hostkey, known_hosts) {
            return Ok(CertificateCheckStatus::CertificateOk);
        }
    }
    Ok(CertificateCheckStatus::CertificatePassthrough)
}

fn host_key_is_known(host: &str, hostkey: &[u8], known_hosts: &Path) -> bool {
    let entries = match KnownHosts::read_file(known_hosts) {
        Ok(entries) => entries,
        Err(error) => {
            trace!("Could not load {}: {}", known_hosts.display(), error);
            return false;
        }
    };
    entries.iter().any(|entry| {
        host_matches_patterns(host, entry.host_patterns())
            && entry.public_key().to_bytes().as_deref() == Ok(hostkey)
    })
}

fn host_matches_patterns(host: &str, patterns: &HostPatterns) -> bool {
    match patterns {
        HostPatterns::Patterns(patterns) => {
            let host = host.to_lowercase();
            let mut matched = false;
            for pattern in patterns {
                let pattern = pattern.to_lowercase();
                match pattern.strip_prefix('!') {
                    Some(negated) if negated == host => return false,
                    Some(_) => {}
                    None => matched |= pattern == host,
                }
            }
            matched
        }
        HostPatterns::HashedName { .. } => false,
    }
}
