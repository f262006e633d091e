//! Scripted collaborators for fetcher tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    cache::PkgfetchCache,
    fetcher::FetchOptions,
    git::{is_full_sha, GitClient, GitError, RemoteRefs},
    model::hosted::Protocol,
    npm::{InstallError, InstallRunner},
};

pub const PACKAGE_JSON: &str = r#"{"name":"example","version":"1.0.0"}"#;

pub fn sha(c: char) -> String {
    c.to_string().repeat(40)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCall {
    Revs(String),
    Checkout {
        remote: String,
        reference: Option<String>,
        dest: PathBuf,
    },
}

/// In-memory [`GitClient`] that records every call.
pub struct FakeGit {
    pub refs: RemoteRefs,
    /// Remotes that fail as unreachable.
    pub unreachable: Vec<String>,
    /// Revision expressions only a clone can resolve.
    pub expressions: HashMap<String, String>,
    /// Written into every checkout.
    pub package_json: String,
    pub calls: Mutex<Vec<GitCall>>,
}

impl Default for FakeGit {
    fn default() -> Self {
        Self {
            refs: RemoteRefs::default(),
            unreachable: Vec::new(),
            expressions: HashMap::new(),
            package_json: PACKAGE_JSON.to_owned(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGit {
    pub fn with_refs(lines: &str) -> Self {
        Self {
            refs: RemoteRefs::from_lines(lines),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<GitCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn checkouts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, GitCall::Checkout { .. }))
            .count()
    }

    fn record(&self, call: GitCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_reachable(&self, remote: &str) -> Result<(), GitError> {
        if self.unreachable.iter().any(|url| url == remote) {
            return Err(GitError::RemoteUnreachable {
                url: remote.to_owned(),
                source: git2::Error::from_str("connection refused"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitClient for FakeGit {
    async fn revs(&self, remote: &str) -> Result<RemoteRefs, GitError> {
        self.record(GitCall::Revs(remote.to_owned()));
        self.check_reachable(remote)?;
        Ok(self.refs.clone())
    }

    async fn checkout(
        &self,
        remote: &str,
        reference: Option<&str>,
        dest: &Path,
    ) -> Result<String, GitError> {
        self.record(GitCall::Checkout {
            remote: remote.to_owned(),
            reference: reference.map(str::to_owned),
            dest: dest.to_path_buf(),
        });
        self.check_reachable(remote)?;

        let sha = match reference {
            None => self.refs.head().map(|doc| doc.sha.clone()),
            Some(reference) if is_full_sha(reference) => Some(reference.to_owned()),
            Some(reference) => self
                .refs
                .lookup(reference)
                .map(|doc| doc.sha)
                .or_else(|| self.expressions.get(reference).cloned()),
        };
        let sha = sha.ok_or_else(|| GitError::RefNotFound {
            url: remote.to_owned(),
            reference: reference.unwrap_or("HEAD").to_owned(),
        })?;

        std::fs::create_dir_all(dest.join(".git"))?;
        std::fs::write(dest.join(".git/HEAD"), &sha)?;
        std::fs::write(dest.join("package.json"), &self.package_json)?;
        std::fs::write(dest.join("index.js"), "module.exports = 42;\n")?;
        Ok(sha)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCall {
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Whether the directory held a package when the installer ran.
    pub had_package: bool,
}

#[derive(Default)]
pub struct RecordingInstaller {
    pub fail: bool,
    pub calls: Mutex<Vec<InstallCall>>,
}

impl RecordingInstaller {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<InstallCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstallRunner for RecordingInstaller {
    async fn install(&self, dir: &Path, env: &[(String, String)]) -> Result<(), InstallError> {
        self.calls.lock().unwrap().push(InstallCall {
            dir: dir.to_path_buf(),
            env: env.to_vec(),
            had_package: dir.join("package.json").is_file(),
        });
        if self.fail {
            return Err(InstallError::Spawn {
                bin: "npm".to_owned(),
                source: std::io::Error::other("install exploded"),
            });
        }
        Ok(())
    }
}

pub fn options(cache_dir: &Path, git: Arc<FakeGit>) -> FetchOptions {
    FetchOptions {
        cache: PkgfetchCache::new(cache_dir.to_path_buf()).unwrap(),
        registry: "https://registry.npmjs.org/".to_owned(),
        git_protocol: Protocol::Ssh,
        default_tag: "latest".to_owned(),
        integrity: None,
        git,
        installer: Arc::new(RecordingInstaller::default()),
        http: reqwest::Client::builder().no_proxy().build().unwrap(),
        clone_cache: false,
        no_prepare: Vec::new(),
        base_dir: cache_dir.to_path_buf(),
        forge_mirror: None,
    }
}

/// Serves each route on GET; anything else answers 404.
pub async fn mock_server(routes: Vec<(&str, Vec<u8>)>) -> MockServer {
    let server = MockServer::start().await;
    for (route, body) in routes {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
    }
    server
}

/// Requests the server has answered so far.
pub async fn hits(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|requests| requests.len())
        .unwrap_or_default()
}
