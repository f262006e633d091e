use std::collections::BTreeMap;

use semver::{Version, VersionReq};

/// Chooses a version out of `versions` for a wanted range, tag or exact
/// version.
///
/// The version behind `default_tag` wins whenever it satisfies the range;
/// otherwise the highest release, then the highest prerelease.
pub fn pick_version<'a, I>(
    versions: I,
    dist_tags: &BTreeMap<String, String>,
    wanted: &str,
    default_tag: &str,
) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let wanted = wanted.trim();
    let versions: Vec<(&String, Version)> = versions
        .into_iter()
        .filter_map(|raw| Version::parse(raw).ok().map(|version| (raw, version)))
        .collect();

    let tagged = |tag: &str| {
        dist_tags
            .get(tag)
            .filter(|version| versions.iter().any(|(raw, _)| *raw == *version))
            .cloned()
    };

    if wanted.is_empty() || wanted == "*" || wanted == default_tag {
        if let Some(version) = tagged(default_tag) {
            return Some(version);
        }
    } else if dist_tags.contains_key(wanted) {
        return tagged(wanted);
    }

    let exact = wanted.strip_prefix('=').unwrap_or(wanted);
    let exact = exact.strip_prefix('v').unwrap_or(exact);
    if let Ok(exact) = Version::parse(exact) {
        return versions
            .iter()
            .find(|(_, version)| *version == exact)
            .map(|(raw, _)| (*raw).clone());
    }

    let range = if wanted.is_empty() || wanted == default_tag {
        Range::any()
    } else {
        Range::parse(wanted)?
    };

    if let Some(version) = tagged(default_tag) {
        if Version::parse(&version).is_ok_and(|v| range.matches(&v)) {
            return Some(version);
        }
    }

    let highest = |prerelease: bool| {
        versions
            .iter()
            .filter(|(_, version)| version.pre.is_empty() != prerelease)
            .filter(|(_, version)| {
                range.matches(version) || (prerelease && matches_ignoring_pre(&range, version))
            })
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(raw, _)| (*raw).clone())
    };

    highest(false).or_else(|| highest(true))
}

// semver excludes prereleases from ranges that do not name one; a git repo
// with only prerelease tags still has to resolve.
fn matches_ignoring_pre(range: &Range, version: &Version) -> bool {
    let release = Version::new(version.major, version.minor, version.patch);
    range.matches(&release)
}

const OPERATOR_CHARS: &str = "<>=~^";

/// An npm range: `||` separated sets of whitespace separated comparators,
/// each set optionally a `low - high` hyphen range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    sets: Vec<VersionReq>,
}

impl Range {
    pub fn any() -> Self {
        Self {
            sets: vec![VersionReq::STAR],
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let sets = input
            .split("||")
            .map(|set| comparator_set(set.trim()))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { sets })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.sets.iter().any(|set| set.matches(version))
    }
}

fn comparator_set(set: &str) -> Option<VersionReq> {
    if let Some((low, high)) = set.split_once(" - ") {
        let low = strip_v(low.trim());
        let high = strip_v(high.trim());
        return VersionReq::parse(&format!(">={low}, <={high}")).ok();
    }

    let mut comparators = Vec::new();
    let mut pending = String::new();
    for token in set.split_whitespace() {
        // `>= 1.2.0` puts the operator in its own token
        if token.chars().all(|c| OPERATOR_CHARS.contains(c)) {
            pending.push_str(token);
            continue;
        }
        let at = token
            .find(|c: char| !OPERATOR_CHARS.contains(c))
            .unwrap_or(token.len());
        let (op, version) = token.split_at(at);
        let op = format!("{pending}{op}");
        pending.clear();
        let version = strip_v(version);
        if op.is_empty() && matches!(version, "*" | "x" | "X") {
            continue;
        }
        // A bare version is exact in npm but a caret requirement in semver
        if op.is_empty() {
            comparators.push(format!("={version}"));
        } else {
            comparators.push(format!("{op}{version}"));
        }
    }
    if !pending.is_empty() {
        return None;
    }
    if comparators.is_empty() {
        return Some(VersionReq::STAR);
    }
    VersionReq::parse(&comparators.join(", ")).ok()
}

fn strip_v(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}
