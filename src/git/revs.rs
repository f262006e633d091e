use std::{
    collections::{BTreeMap, HashMap},
    sync::OnceLock,
};

use regex_lite::Regex;
use serde::Serialize;

const SHORT_SHA_LEN: usize = 7;
const MIN_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    Head,
    Branch,
    Tag,
    Pull,
    /// A commit matched by (a prefix of) its sha rather than by name.
    Sha,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevDoc {
    pub sha: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(rename = "rawRef")]
    pub raw_ref: String,
    #[serde(rename = "type")]
    pub kind: RefKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// What a remote advertises, indexed for committish and range lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteRefs {
    /// Keyed by short name (`main`, `v1.0.0`, `pull/1`, `HEAD`) and by raw
    /// ref name.
    pub refs: BTreeMap<String, RevDoc>,
    /// Abbreviated sha to full sha.
    pub shas: BTreeMap<String, String>,
    pub versions: BTreeMap<String, RevDoc>,
    #[serde(rename = "dist-tags")]
    pub dist_tags: BTreeMap<String, String>,
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"v?(\d+\.\d+\.\d+(?:[-+].+)?)$").unwrap())
}

fn classify(raw_ref: &str) -> Option<(RefKind, String)> {
    if raw_ref == "HEAD" {
        return Some((RefKind::Head, "HEAD".to_owned()));
    }
    if let Some(tag) = raw_ref.strip_prefix("refs/tags/") {
        return Some((RefKind::Tag, tag.to_owned()));
    }
    if let Some(branch) = raw_ref.strip_prefix("refs/heads/") {
        return Some((RefKind::Branch, branch.to_owned()));
    }
    if let Some(pull) = raw_ref
        .strip_prefix("refs/pull/")
        .and_then(|pull| pull.strip_suffix("/head"))
    {
        return Some((RefKind::Pull, format!("pull/{pull}")));
    }
    if raw_ref.starts_with("refs/") {
        return Some((RefKind::Other, raw_ref.to_owned()));
    }
    None
}

fn tag_version(tag: &str) -> Option<String> {
    let captures = version_pattern().captures(tag)?;
    let version = captures.get(1)?.as_str();
    semver::Version::parse(version)
        .ok()
        .map(|version| version.to_string())
}

impl RemoteRefs {
    /// Builds the index from `(sha, ref name)` pairs, the shape `git
    /// ls-remote` prints. Peeled annotated tags (`refs/tags/x^{}`) replace
    /// the tag object's sha with the commit's.
    pub fn from_pairs<I, S, R>(pairs: I) -> RemoteRefs
    where
        I: IntoIterator<Item = (S, R)>,
        S: AsRef<str>,
        R: AsRef<str>,
    {
        let mut peeled = HashMap::new();
        let mut listed = Vec::new();
        for (sha, raw_ref) in pairs {
            let (sha, raw_ref) = (sha.as_ref().trim(), raw_ref.as_ref().trim());
            match raw_ref.strip_suffix("^{}") {
                Some(tag) => {
                    peeled.insert(tag.to_owned(), sha.to_owned());
                }
                None => listed.push((sha.to_owned(), raw_ref.to_owned())),
            }
        }

        let mut revs = RemoteRefs::default();
        for (sha, raw_ref) in listed {
            let Some((kind, reference)) = classify(&raw_ref) else {
                continue;
            };
            let sha = peeled.get(&raw_ref).cloned().unwrap_or(sha);
            let version = match kind {
                RefKind::Tag => tag_version(&reference),
                _ => None,
            };
            let doc = RevDoc {
                sha: sha.clone(),
                reference: reference.clone(),
                raw_ref: raw_ref.clone(),
                kind,
                version: version.clone(),
            };
            if sha.len() >= SHORT_SHA_LEN {
                revs.shas.insert(sha[..SHORT_SHA_LEN].to_owned(), sha.clone());
            }
            if let Some(version) = version {
                revs.versions.insert(version, doc.clone());
            }
            if raw_ref != reference {
                revs.refs.insert(raw_ref, doc.clone());
            }
            revs.refs.insert(reference, doc);
        }

        revs.add_dist_tags();
        revs
    }

    /// Parses `git ls-remote` output.
    pub fn from_lines(output: &str) -> RemoteRefs {
        Self::from_pairs(output.lines().filter_map(|line| {
            let mut split = line.split_whitespace();
            Some((split.next()?, split.next()?))
        }))
    }

    fn add_dist_tags(&mut self) {
        let head = self.refs.get("HEAD").map(|doc| doc.sha.clone());
        let latest_branch = self
            .refs
            .get("latest")
            .filter(|doc| doc.kind == RefKind::Branch)
            .map(|doc| doc.sha.clone());
        for (version, doc) in &self.versions {
            if latest_branch.as_ref() == Some(&doc.sha) {
                self.dist_tags.insert("latest".to_owned(), version.clone());
            } else if head.as_ref() == Some(&doc.sha) {
                self.dist_tags.insert("HEAD".to_owned(), version.clone());
                if latest_branch.is_none() {
                    self.dist_tags.insert("latest".to_owned(), version.clone());
                }
            }
        }
    }

    pub fn head(&self) -> Option<&RevDoc> {
        self.refs.get("HEAD")
    }

    /// Finds a committish by name, then as an abbreviated sha.
    pub fn lookup(&self, committish: &str) -> Option<RevDoc> {
        if let Some(doc) = self.refs.get(committish) {
            return Some(doc.clone());
        }
        if committish.len() < MIN_PREFIX_LEN || !committish.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return None;
        }
        let committish = committish.to_ascii_lowercase();
        let sha = match self.shas.get(&committish) {
            Some(sha) => sha.clone(),
            None => {
                let mut candidates = self
                    .shas
                    .values()
                    .filter(|sha| sha.starts_with(&committish));
                let sha = candidates.next()?;
                if candidates.any(|other| other != sha) {
                    return None;
                }
                sha.clone()
            }
        };
        Some(RevDoc {
            sha: sha.clone(),
            reference: committish,
            raw_ref: sha,
            kind: RefKind::Sha,
            version: None,
        })
    }
}
