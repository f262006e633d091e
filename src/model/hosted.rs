use std::{
    fmt::{Display, Write},
    str::FromStr,
    sync::OnceLock,
};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::ParseError;

/// Transport used to talk to a hosted repository.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize, Ord, PartialOrd)]
pub enum Protocol {
    #[serde(rename = "https")]
    Https,
    #[serde(rename = "ssh")]
    Ssh,
}

impl FromStr for Protocol {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.to_ascii_lowercase();
        match value.as_str() {
            "https" => Ok(Protocol::Https),
            "ssh" => Ok(Protocol::Ssh),
            _ => Err(ParseError::InvalidProtocol(value)),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Protocol::Https => f.write_str("https"),
            Protocol::Ssh => f.write_str("ssh"),
        }
    }
}

/// A git hosting platform with well known url layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Forge {
    GitHub,
    GitLab,
    Bitbucket,
    Sourcehut,
}

impl Forge {
    pub fn domain(self) -> &'static str {
        match self {
            Forge::GitHub => "github.com",
            Forge::GitLab => "gitlab.com",
            Forge::Bitbucket => "bitbucket.org",
            Forge::Sourcehut => "git.sr.ht",
        }
    }

    pub fn shortcut_prefix(self) -> &'static str {
        match self {
            Forge::GitHub => "github",
            Forge::GitLab => "gitlab",
            Forge::Bitbucket => "bitbucket",
            Forge::Sourcehut => "sourcehut",
        }
    }

    fn from_domain(host: &str) -> Option<Forge> {
        let host = host.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        [Forge::GitHub, Forge::GitLab, Forge::Bitbucket, Forge::Sourcehut]
            .into_iter()
            .find(|forge| forge.domain() == host)
    }

    fn from_shortcut(prefix: &str) -> Option<Forge> {
        [Forge::GitHub, Forge::GitLab, Forge::Bitbucket, Forge::Sourcehut]
            .into_iter()
            .find(|forge| forge.shortcut_prefix() == prefix)
    }

    // Sourcehut serves clones without the `.git` suffix.
    fn repo_suffix(self) -> &'static str {
        match self {
            Forge::Sourcehut => "",
            _ => ".git",
        }
    }
}

/// A repository living on a known [`Forge`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostedGit {
    pub forge: Forge,
    pub user: String,
    pub project: String,
    pub committish: Option<String>,
    /// `user[:password]` taken from an https url.
    pub auth: Option<String>,
}

fn scp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[^@/:]+@)?(?P<host>[^:/@]+):(?P<path>[^/].*)$").unwrap()
    })
}

/// The scp-like address hidden in `ssh://user@host:path`, a form git
/// accepts but url parsers read as a bad port.
pub(crate) fn ssh_scp_address(input: &str) -> Option<&str> {
    let rest = input.strip_prefix("git+").unwrap_or(input);
    let rest = rest.strip_prefix("ssh://")?;
    let captures = scp_pattern().captures(rest)?;
    let path = captures.name("path")?.as_str();
    let first = path.split('/').next().unwrap_or(path);
    if first.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(rest)
}

fn shorthand_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^/@:\s.#~][^/@:\s#]*/[^/@:\s#]+$").unwrap())
}

/// Whether `input` is the bare `owner/repo` form that implies GitHub.
pub(crate) fn is_shorthand(input: &str) -> bool {
    let input = input.split('#').next().unwrap_or(input);
    shorthand_pattern().is_match(input)
}

impl HostedGit {
    /// Recognizes shortcuts (`github:owner/repo`), the bare `owner/repo` form,
    /// scp-like addresses and `ssh`/`https`/`git` urls pointing at a known forge.
    /// Any `#fragment` is ignored; committishes are attached by the caller.
    pub fn from_url(input: &str) -> Option<HostedGit> {
        let input = input.split('#').next().unwrap_or(input).trim();

        if let Some((prefix, rest)) = input.split_once(':') {
            if let Some(forge) = Forge::from_shortcut(prefix) {
                return Self::from_path(forge, rest, None);
            }
        }

        if shorthand_pattern().is_match(input) {
            return Self::from_path(Forge::GitHub, input, None);
        }

        let scp = ssh_scp_address(input).unwrap_or(input);
        if let Some(captures) = scp_pattern().captures(scp) {
            let forge = Forge::from_domain(captures.name("host")?.as_str())?;
            return Self::from_path(forge, captures.name("path")?.as_str(), None);
        }

        let url = Url::parse(input.strip_prefix("git+").unwrap_or(input)).ok()?;
        let auth = match url.scheme() {
            "ssh" | "git" => None,
            "https" | "http" if url.username().is_empty() => None,
            "https" | "http" => Some(match url.password() {
                Some(password) => format!("{}:{}", url.username(), password),
                None => url.username().to_owned(),
            }),
            _ => return None,
        };
        let forge = Forge::from_domain(url.host_str()?)?;
        Self::from_path(forge, url.path(), auth)
    }

    fn from_path(forge: Forge, path: &str, auth: Option<String>) -> Option<HostedGit> {
        let path = path.trim_matches('/');
        let mut segments = path.split('/');
        let user = segments.next()?;
        let project = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        let project = project.strip_suffix(".git").unwrap_or(project);
        if user.is_empty() || project.is_empty() {
            return None;
        }
        Some(HostedGit {
            forge,
            user: user.to_owned(),
            project: project.to_owned(),
            committish: None,
            auth,
        })
    }

    pub fn with_committish(&self, committish: Option<&str>) -> HostedGit {
        HostedGit {
            committish: committish.filter(|c| !c.is_empty()).map(str::to_owned),
            ..self.clone()
        }
    }

    fn repo_path(&self) -> String {
        format!("{}/{}", self.user, self.project)
    }

    fn with_fragment(&self, mut base: String) -> String {
        if let Some(committish) = &self.committish {
            let _ = write!(base, "#{committish}");
        }
        base
    }

    fn auth_prefix(&self) -> String {
        self.auth
            .as_ref()
            .map(|auth| format!("{auth}@"))
            .unwrap_or_default()
    }

    /// `git+ssh://git@github.com/owner/repo.git#committish`
    pub fn ssh_url(&self) -> String {
        self.with_fragment(format!("git+{}", self.ssh_remote()))
    }

    /// `git+https://github.com/owner/repo.git#committish`
    pub fn https_url(&self) -> String {
        self.with_fragment(format!("git+{}", self.https_remote()))
    }

    /// Clone url over ssh, never carrying a committish.
    pub fn ssh_remote(&self) -> String {
        format!(
            "ssh://git@{}/{}{}",
            self.forge.domain(),
            self.repo_path(),
            self.forge.repo_suffix()
        )
    }

    /// Clone url over https, never carrying a committish.
    pub fn https_remote(&self) -> String {
        format!(
            "https://{}{}/{}{}",
            self.auth_prefix(),
            self.forge.domain(),
            self.repo_path(),
            self.forge.repo_suffix()
        )
    }

    /// `github:owner/repo#committish`
    pub fn shortcut(&self) -> String {
        self.with_fragment(format!(
            "{}:{}",
            self.forge.shortcut_prefix(),
            self.repo_path()
        ))
    }

    /// Direct archive download url. Only available once a committish is known.
    pub fn tarball_url(&self) -> Option<String> {
        let committish = self.committish.as_deref()?;
        let domain = self.forge.domain();
        let path = self.repo_path();
        Some(match self.forge {
            Forge::GitHub => format!("https://{domain}/{path}/tarball/{committish}"),
            Forge::GitLab => {
                format!("https://{domain}/{path}/repository/archive.tar.gz?ref={committish}")
            }
            Forge::Bitbucket => format!("https://{domain}/{path}/get/{committish}.tar.gz"),
            Forge::Sourcehut => format!("https://{domain}/{path}/archive/{committish}.tar.gz"),
        })
    }

    /// Remotes to try, in order. Credentials embedded in an https url pin the
    /// transport to https.
    pub fn remotes(&self, preferred: Protocol) -> Vec<String> {
        if self.auth.is_some() {
            return vec![self.https_remote()];
        }
        match preferred {
            Protocol::Ssh => vec![self.ssh_remote(), self.https_remote()],
            Protocol::Https => vec![self.https_remote(), self.ssh_remote()],
        }
    }
}
