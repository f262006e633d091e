use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex_lite::Regex;

use crate::model::{
    hosted::{self, HostedGit},
    ParseError,
};

/// A parsed package specifier. Immutable once built: anything learned while
/// fetching lives on the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    /// The specifier exactly as given.
    pub raw: String,
    pub name: Option<String>,
    /// The part of `raw` after any `name@` prefix.
    pub raw_spec: String,
    pub source: Source,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Registry { range: String },
    Git(GitSource),
    Directory { path: PathBuf },
    File { path: PathBuf },
    Remote { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    /// Url handed to git: no `git+` prefix, no fragment. May be empty.
    pub fetch_spec: String,
    pub committish: Option<String>,
    /// Semver range given as `#semver:<range>`.
    pub range: Option<String>,
    pub hosted: Option<HostedGit>,
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Registry { .. } => "registry",
            Source::Git(_) => "git",
            Source::Directory { .. } => "directory",
            Source::File { .. } => "file",
            Source::Remote { .. } => "remote",
        }
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:@[A-Za-z0-9~-][A-Za-z0-9._~-]*/)?[A-Za-z0-9~-][A-Za-z0-9._~-]*$").unwrap()
    })
}

fn scheme_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]+:").unwrap())
}

// user@host:path, the scp-like form git understands.
fn scp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@/:\s]+@[^:/.\s]+\.[^:/\s]+:.+$").unwrap())
}

const TARBALL_EXTENSIONS: [&str; 3] = [".tgz", ".tar.gz", ".tar"];
const GIT_PREFIXES: [&str; 3] = ["git+", "git://", "ssh://"];
const HOSTED_SHORTCUTS: [&str; 4] = ["github:", "gitlab:", "bitbucket:", "sourcehut:"];

fn is_path_like(spec: &str) -> bool {
    spec.starts_with("./")
        || spec.starts_with("../")
        || spec.starts_with('/')
        || spec.starts_with("~/")
        || spec == "."
        || spec == ".."
}

fn is_tarball_name(spec: &str) -> bool {
    TARBALL_EXTENSIONS.iter().any(|ext| spec.ends_with(ext))
}

impl PackageSpec {
    /// Parses a specifier, keeping relative paths as given.
    pub fn parse(raw: &str) -> Result<PackageSpec, ParseError> {
        Self::parse_with_base(raw, Path::new(""))
    }

    /// Parses a specifier, resolving relative file and directory paths
    /// against `base`.
    pub fn parse_with_base(raw: &str, base: &Path) -> Result<PackageSpec, ParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptySpecifier);
        }

        let (name, raw_spec) = split_name(trimmed);
        if let Some(name) = name {
            if !name_pattern().is_match(name) {
                return Err(ParseError::InvalidName(name.to_owned()));
            }
        }

        let source = match classify(raw_spec, base)? {
            Some(source) => source,
            // Plain `name`, nothing after it.
            None if name.is_none() => {
                if !name_pattern().is_match(raw_spec) {
                    return Err(ParseError::InvalidName(raw_spec.to_owned()));
                }
                return Ok(PackageSpec {
                    raw: raw.to_owned(),
                    name: Some(raw_spec.to_owned()),
                    raw_spec: String::new(),
                    source: Source::Registry {
                        range: String::new(),
                    },
                });
            }
            None => Source::Registry {
                range: raw_spec.to_owned(),
            },
        };

        Ok(PackageSpec {
            raw: raw.to_owned(),
            name: name.map(str::to_owned),
            raw_spec: raw_spec.to_owned(),
            source,
        })
    }

    pub fn git(&self) -> Option<&GitSource> {
        match &self.source {
            Source::Git(git) => Some(git),
            _ => None,
        }
    }
}

impl Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Splits off a leading `name@` when the text before the `@` is a package
/// name. Urls, paths, scp addresses and `owner/repo` never carry a name.
fn split_name(spec: &str) -> (Option<&str>, &str) {
    let unnamed = scheme_pattern().is_match(spec)
        || is_path_like(spec)
        || scp_pattern().is_match(spec)
        || hosted::is_shorthand(spec);
    if unnamed {
        return (None, spec);
    }

    let search_from = usize::from(spec.starts_with('@'));
    match spec[search_from..].find('@') {
        Some(index) => {
            let index = index + search_from;
            (Some(&spec[..index]), &spec[index + 1..])
        }
        // Bare name, the caller turns it into a registry spec.
        None => (None, spec),
    }
}

/// Returns `None` for a bare registry name or range.
fn classify(spec: &str, base: &Path) -> Result<Option<Source>, ParseError> {
    if spec.is_empty() {
        return Ok(Some(Source::Registry {
            range: String::new(),
        }));
    }

    if let Some(path) = spec.strip_prefix("file:") {
        let path = path.strip_prefix("//").unwrap_or(path);
        return Ok(Some(file_or_directory(path, base)));
    }

    if is_path_like(spec) {
        return Ok(Some(file_or_directory(spec, base)));
    }

    if GIT_PREFIXES.iter().any(|prefix| spec.starts_with(prefix))
        || HOSTED_SHORTCUTS.iter().any(|prefix| spec.starts_with(prefix))
        || scp_pattern().is_match(spec)
    {
        return Ok(Some(Source::Git(git_source(spec))));
    }

    if spec.starts_with("http://") || spec.starts_with("https://") {
        if HostedGit::from_url(spec).is_some() {
            return Ok(Some(Source::Git(git_source(spec))));
        }
        url::Url::parse(spec).map_err(|e| ParseError::InvalidUrl(spec.to_owned(), e))?;
        return Ok(Some(Source::Remote {
            url: spec.to_owned(),
        }));
    }

    if is_tarball_name(spec) {
        return Ok(Some(file_or_directory(spec, base)));
    }

    if hosted::is_shorthand(spec) {
        return Ok(Some(Source::Git(git_source(spec))));
    }

    if name_pattern().is_match(spec) && !looks_like_range(spec) {
        // `foo` alone is a name, `foo@bar` has already been split.
        return Ok(None);
    }

    Ok(Some(Source::Registry {
        range: spec.to_owned(),
    }))
}

fn looks_like_range(spec: &str) -> bool {
    spec.starts_with(|c: char| c.is_ascii_digit() || "^~<>=*".contains(c))
}

fn file_or_directory(path: &str, base: &Path) -> Source {
    let path = base.join(path);
    if is_tarball_name(&path.to_string_lossy()) {
        Source::File { path }
    } else {
        Source::Directory { path }
    }
}

fn git_source(spec: &str) -> GitSource {
    let (url, fragment) = match spec.split_once('#') {
        Some((url, fragment)) => (url, Some(fragment)),
        None => (spec, None),
    };

    let (committish, range) = match fragment {
        Some(fragment) => match fragment.strip_prefix("semver:") {
            Some(range) => (None, Some(range.to_owned())),
            None if fragment.is_empty() => (None, None),
            None => (Some(fragment.to_owned()), None),
        },
        None => (None, None),
    };

    let hosted = HostedGit::from_url(url).map(|h| h.with_committish(committish.as_deref()));
    let fetch_spec = match &hosted {
        Some(hosted) if !url.contains("://") && !scp_pattern().is_match(url) => {
            hosted.https_remote()
        }
        _ => match hosted::ssh_scp_address(url) {
            Some(scp) => scp.to_owned(),
            None => url.strip_prefix("git+").unwrap_or(url).to_owned(),
        },
    };

    GitSource {
        fetch_spec,
        committish,
        range,
        hosted,
    }
}
