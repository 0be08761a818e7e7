//! Numeric-aware plugin version ordering.
//!
//! Plugin authors use anything from strict semver (`2.1.0-rc.1`) to
//! dotted build numbers with qualifiers (`4.0.0.GA`, `1.2-SNAPSHOT`). All of
//! them are normalized into a release number plus an optional qualifier so
//! that a single total order applies:
//!
//! - Missing or unparsable versions sort below everything else.
//! - Release numbers compare numerically, padded with zeros (`1.0 == 1.0.0`).
//! - A qualified version sorts below the plain release with the same number,
//!   except for `ga`, `final` and `release` which mean the release itself.
//! - Qualifier parts compare numerically when both are numbers, numbers sort
//!   below words, words compare case-insensitively.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum QualifierPart {
    Number(u64),
    Word(String),
}

impl Ord for QualifierPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (QualifierPart::Number(a), QualifierPart::Number(b)) => a.cmp(b),
            (QualifierPart::Number(_), QualifierPart::Word(_)) => Ordering::Less,
            (QualifierPart::Word(_), QualifierPart::Number(_)) => Ordering::Greater,
            (QualifierPart::Word(a), QualifierPart::Word(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for QualifierPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
enum Parsed {
    /// Absent or unusable version string.
    Unknown,
    Known {
        release: Vec<u64>,
        qualifier: Option<Vec<QualifierPart>>,
    },
}

/// A version string paired with its comparable form.
#[derive(Debug, Clone)]
pub struct PluginVersion {
    raw: Option<String>,
    parsed: Parsed,
}

const RELEASE_QUALIFIERS: [&str; 3] = ["ga", "final", "release"];

impl PluginVersion {
    /// Parse an optional version string. Never fails; unusable input yields
    /// the lowest possible version.
    pub fn parse(raw: Option<&str>) -> Self {
        let parsed = raw.map(parse_str).unwrap_or(Parsed::Unknown);
        Self {
            raw: raw.map(str::to_string),
            parsed,
        }
    }

    pub fn missing() -> Self {
        Self::parse(None)
    }

    /// True when the version is absent or could not be interpreted.
    pub fn is_unknown(&self) -> bool {
        matches!(self.parsed, Parsed::Unknown)
    }

    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }
}

fn parse_str(input: &str) -> Parsed {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Parsed::Unknown;
    }

    if let Ok(version) = semver::Version::parse(trimmed) {
        let qualifier = if version.pre.is_empty() {
            None
        } else {
            Some(split_qualifier(version.pre.as_str()))
        };
        return known(vec![version.major, version.minor, version.patch], qualifier);
    }

    // Build metadata never participates in ordering.
    let without_build = trimmed.split('+').next().unwrap_or(trimmed);

    let mut release = Vec::new();
    let mut rest = without_build;
    loop {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            break;
        }
        match rest[..digits_end].parse::<u64>() {
            Ok(n) => release.push(n),
            Err(_) => return Parsed::Unknown,
        }
        rest = &rest[digits_end..];
        // Only continue the release number across a dot followed by a digit.
        match rest.strip_prefix('.') {
            Some(next) if next.starts_with(|c: char| c.is_ascii_digit()) => rest = next,
            _ => break,
        }
    }

    if release.is_empty() {
        return Parsed::Unknown;
    }

    let rest = rest.trim_start_matches(['.', '-', '_']);
    let qualifier = if rest.is_empty() {
        None
    } else {
        Some(split_qualifier(rest))
    };
    known(release, qualifier)
}

fn known(mut release: Vec<u64>, qualifier: Option<Vec<QualifierPart>>) -> Parsed {
    while release.len() > 1 && release.last() == Some(&0) {
        release.pop();
    }
    let qualifier = qualifier.filter(|parts| {
        !matches!(parts.as_slice(), [QualifierPart::Word(w)] if RELEASE_QUALIFIERS.contains(&w.as_str()))
    });
    Parsed::Known { release, qualifier }
}

/// Split on separators and at every letter/digit boundary, so `rc1` and
/// `rc.1` yield the same parts.
fn split_qualifier(input: &str) -> Vec<QualifierPart> {
    let mut parts = Vec::new();
    for segment in input.split(['.', '-', '_']) {
        let mut rest = segment;
        while let Some(first) = rest.chars().next() {
            let numeric = first.is_ascii_digit();
            let end = rest
                .find(|c: char| c.is_ascii_digit() != numeric)
                .unwrap_or(rest.len());
            let run = &rest[..end];
            parts.push(match run.parse::<u64>() {
                Ok(n) if numeric => QualifierPart::Number(n),
                _ => QualifierPart::Word(run.to_ascii_lowercase()),
            });
            rest = &rest[end..];
        }
    }
    parts
}

fn compare_release(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl Ord for PluginVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.parsed, &other.parsed) {
            (Parsed::Unknown, Parsed::Unknown) => Ordering::Equal,
            (Parsed::Unknown, Parsed::Known { .. }) => Ordering::Less,
            (Parsed::Known { .. }, Parsed::Unknown) => Ordering::Greater,
            (
                Parsed::Known {
                    release: ra,
                    qualifier: qa,
                },
                Parsed::Known {
                    release: rb,
                    qualifier: qb,
                },
            ) => compare_release(ra, rb).then_with(|| match (qa, qb) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            }),
        }
    }
}

impl PartialOrd for PluginVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PluginVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PluginVersion {}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => f.write_str(raw),
            None => f.write_str("<none>"),
        }
    }
}
