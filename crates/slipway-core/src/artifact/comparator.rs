//! Version comparators.
//!
//! Pure total orderings over version strings, one per artifact versioning
//! strategy. Orderings are transitive, antisymmetric on comparable inputs,
//! and stable across calls. Unparseable inputs always sort last when a list
//! is ordered newest-first, and each distinct unparseable input is logged at
//! warn level once per comparator.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use regex::Regex;

use super::{DeliveryArtifact, TagVersionStrategy, VersioningStrategy};
use crate::error::{RepoResult, RepositoryError};

/// Compares two Debian version strings with dpkg semantics.
///
/// The inputs are bare versions (`epoch:upstream-revision`), not full
/// `package-version` strings. `~` sorts before everything, including the end
/// of a part, so `1.0~rc1` precedes `1.0`.
#[must_use]
pub fn compare_debian_versions(a: &str, b: &str) -> Ordering {
    let (epoch_a, upstream_a, revision_a) = split_version(a);
    let (epoch_b, upstream_b, revision_b) = split_version(b);
    epoch_a
        .cmp(&epoch_b)
        .then_with(|| verrevcmp(upstream_a.as_bytes(), upstream_b.as_bytes()))
        .then_with(|| verrevcmp(revision_a.as_bytes(), revision_b.as_bytes()))
}

/// Splits a Debian version into `(epoch, upstream, revision)`.
fn split_version(version: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match version.split_once(':') {
        Some((epoch, rest))
            if !epoch.is_empty() && epoch.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (epoch.parse().unwrap_or(0), rest)
        }
        _ => (0, version),
    };
    match rest.rsplit_once('-') {
        Some((upstream, revision)) => (epoch, upstream, revision),
        None => (epoch, rest, ""),
    }
}

/// Sort weight of a character in a non-digit run, per dpkg: `~` before the
/// end of the string, letters before everything else.
fn order(byte: Option<u8>) -> i32 {
    match byte {
        Some(b'~') => -1,
        None => 0,
        Some(b) if b.is_ascii_digit() => 0,
        Some(b) if b.is_ascii_alphabetic() => i32::from(b),
        Some(b) => i32::from(b) + 256,
    }
}

/// dpkg's `verrevcmp`: alternate non-digit and digit runs, comparing digit
/// runs numerically.
fn verrevcmp(mut a: &[u8], mut b: &[u8]) -> Ordering {
    while !a.is_empty() || !b.is_empty() {
        while a.first().is_some_and(|c| !c.is_ascii_digit())
            || b.first().is_some_and(|c| !c.is_ascii_digit())
        {
            let order_a = order(a.first().copied());
            let order_b = order(b.first().copied());
            if order_a != order_b {
                return order_a.cmp(&order_b);
            }
            if !a.is_empty() {
                a = &a[1..];
            }
            if !b.is_empty() {
                b = &b[1..];
            }
        }
        while a.first() == Some(&b'0') {
            a = &a[1..];
        }
        while b.first() == Some(&b'0') {
            b = &b[1..];
        }
        let mut first_diff = Ordering::Equal;
        while a.first().is_some_and(u8::is_ascii_digit)
            && b.first().is_some_and(u8::is_ascii_digit)
        {
            if first_diff == Ordering::Equal {
                first_diff = a[0].cmp(&b[0]);
            }
            a = &a[1..];
            b = &b[1..];
        }
        if a.first().is_some_and(u8::is_ascii_digit) {
            return Ordering::Greater;
        }
        if b.first().is_some_and(u8::is_ascii_digit) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}

/// Strips the package-name prefix from a Debian artifact version.
///
/// Versions arrive as `package-version[~suffix][-hHASH]`; the version part
/// begins at the first `-` that is followed by a digit.
fn strip_package_prefix(version: &str) -> Option<&str> {
    let bytes = version.as_bytes();
    bytes
        .windows(2)
        .position(|w| w[0] == b'-' && w[1].is_ascii_digit())
        .filter(|&i| i > 0)
        .map(|i| &version[i + 1..])
}

/// A total ordering over an artifact's version strings.
///
/// Built from the artifact's versioning strategy via
/// [`VersionComparator::for_artifact`]. The comparator is `Send + Sync` and
/// reusable across calls; it remembers which inputs it has already warned
/// about so each unparseable version is logged once.
#[derive(Debug)]
pub struct VersionComparator {
    scheme: Scheme,
    warned: Mutex<HashSet<String>>,
}

#[derive(Debug)]
enum Scheme {
    Debian,
    Docker {
        regex: Regex,
        /// A pattern with zero capture groups matches nothing; every tag is
        /// unparseable and the order is left untouched.
        has_capture: bool,
    },
}

impl VersionComparator {
    /// Builds the comparator for the given artifact's versioning strategy.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidRegex` if a Docker tag pattern
    /// declares more than one capture group, and
    /// `RepositoryError::InvalidArgument` if a caller-supplied pattern does
    /// not compile.
    pub fn for_artifact(artifact: &DeliveryArtifact) -> RepoResult<Self> {
        let scheme = match &artifact.versioning_strategy {
            VersioningStrategy::DebianSemver => Scheme::Debian,
            VersioningStrategy::DockerTag {
                strategy,
                capture_group_regex,
            } => Self::docker_scheme(*strategy, capture_group_regex.as_deref())?,
        };
        Ok(Self {
            scheme,
            warned: Mutex::new(HashSet::new()),
        })
    }

    fn docker_scheme(
        strategy: TagVersionStrategy,
        custom_pattern: Option<&str>,
    ) -> RepoResult<Scheme> {
        let pattern = custom_pattern.unwrap_or_else(|| strategy.pattern());
        let regex = Regex::new(pattern).map_err(|err| {
            RepositoryError::invalid_argument(format!("tag regex '{pattern}' is invalid: {err}"))
        })?;
        let groups = regex.captures_len() - 1;
        if groups > 1 {
            return Err(RepositoryError::InvalidRegex {
                pattern: pattern.to_string(),
                groups,
            });
        }
        let has_capture = groups == 1;
        if !has_capture {
            tracing::warn!(pattern, "tag regex has no capture group, all tags unparseable");
        }
        Ok(Scheme::Docker { regex, has_capture })
    }

    /// Compares two version strings, greater meaning newer. Unparseable
    /// inputs compare below every parseable input.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match &self.scheme {
            Scheme::Debian => {
                let parsed_a = self.parse_debian(a);
                let parsed_b = self.parse_debian(b);
                match (parsed_a, parsed_b) {
                    (Some(va), Some(vb)) => compare_debian_versions(va, vb),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                }
            }
            Scheme::Docker { .. } => {
                let parsed_a = self.parse_tag(a);
                let parsed_b = self.parse_tag(b);
                match (parsed_a, parsed_b) {
                    (Some(va), Some(vb)) => va.cmp(&vb),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                }
            }
        }
    }

    /// Sorts versions in place, newest first; unparseable versions end up at
    /// the tail in their incoming relative order.
    pub fn sort_newest_first(&self, versions: &mut [String]) {
        versions.sort_by(|a, b| self.compare(b, a));
    }

    fn parse_debian<'v>(&self, version: &'v str) -> Option<&'v str> {
        let stripped = strip_package_prefix(version);
        if stripped.is_none() {
            self.warn_unparseable(version);
        }
        stripped
    }

    /// Extracts the capture group as a dotted numeric sequence
    /// (`"1.12.3"` → `[1, 12, 3]`, `"42"` → `[42]`).
    fn parse_tag(&self, tag: &str) -> Option<Vec<u64>> {
        let Scheme::Docker { regex, has_capture } = &self.scheme else {
            return None;
        };
        if !*has_capture {
            return None;
        }
        let parsed = regex
            .captures(tag)
            .and_then(|captures| captures.get(1))
            .and_then(|group| {
                group
                    .as_str()
                    .split('.')
                    .map(|part| part.parse::<u64>().ok())
                    .collect::<Option<Vec<u64>>>()
            });
        if parsed.is_none() {
            self.warn_unparseable(tag);
        }
        parsed
    }

    fn warn_unparseable(&self, version: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(PoisonError::into_inner);
        if warned.insert(version.to_string()) {
            tracing::warn!(version, "unparseable version, sorting it last");
        }
    }
}
