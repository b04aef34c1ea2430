//! Artifact model and version ordering.
//!
//! An artifact is a deployable unit identified by `(name, kind)`. It carries
//! a filter on acceptable version statuses and a versioning strategy that
//! decides how its version strings are ordered. The comparators behind those
//! strategies live in [`comparator`] and provide a strict total ordering used
//! to sort version lists newest-first.

mod comparator;


use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;

pub use comparator::{compare_debian_versions, VersionComparator};

/// The kind of deployable an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ArtifactKind {
    /// A Debian package.
    Debian,
    /// A Docker image.
    Docker,
}

impl ArtifactKind {
    /// Returns the string representation of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Docker => "docker",
        }
    }

    /// Parses an artifact kind from a string.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` if the string is not a
    /// recognized kind.
    pub fn parse(s: &str) -> Result<Self, RepositoryError> {
        match s {
            "debian" => Ok(Self::Debian),
            "docker" => Ok(Self::Docker),
            other => Err(RepositoryError::invalid_argument(format!(
                "unknown artifact kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The release status attached to an ingested artifact version.
///
/// Statuses are ordered by maturity, `Snapshot` lowest and `Final` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ArtifactStatus {
    /// A development build.
    Snapshot,
    /// A build nominated for release.
    Candidate,
    /// A released build.
    Release,
    /// A build that can never change again.
    Final,
}

impl ArtifactStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Candidate => "candidate",
            Self::Release => "release",
            Self::Final => "final",
        }
    }

    /// Parses a status from a string.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` if the string is not a
    /// recognized status.
    pub fn parse(s: &str) -> Result<Self, RepositoryError> {
        match s {
            "snapshot" => Ok(Self::Snapshot),
            "candidate" => Ok(Self::Candidate),
            "release" => Ok(Self::Release),
            "final" => Ok(Self::Final),
            other => Err(RepositoryError::invalid_argument(format!(
                "unknown artifact status: {other}"
            ))),
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known Docker tag naming schemes.
///
/// Each strategy yields a regex with exactly one capture group; the captured
/// text is compared as a dotted numeric sequence (a single run for plain
/// integer tags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum TagVersionStrategy {
    /// Plain monotonically increasing integer tags (`1`, `2`, `12`).
    IncreasingTag,
    /// Semver tags with an optional leading `v` (`v1.12.3`, `1.12.3`).
    SemverTag,
    /// Branch-qualified tags ordered by job number
    /// (`master-h24.fe53b01` → `24`).
    BranchJobCommitByJob,
    /// Semver-job-commit tags ordered by the semver part
    /// (`v1.12.3-h24.fe53b01` → `1.12.3`).
    SemverJobCommitBySemver,
}

impl TagVersionStrategy {
    /// Returns the tag-matching pattern for this strategy.
    #[must_use]
    pub const fn pattern(&self) -> &'static str {
        match self {
            Self::IncreasingTag => r"^(\d+)$",
            Self::SemverTag => r"^v?(\d+\.\d+\.\d+)$",
            Self::BranchJobCommitByJob => r"^.+-h(\d+)\..+$",
            Self::SemverJobCommitBySemver => r"^v?(\d+\.\d+\.\d+)-h\d+\..+$",
        }
    }
}

/// How an artifact's version strings are ordered.
///
/// Strategy values are stateless and compared structurally; `DebianSemver`
/// in particular is a singleton value, never an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum VersioningStrategy {
    /// Debian package versions compared with dpkg semantics.
    DebianSemver,
    /// Docker tags matched by a strategy or caller-supplied regex.
    DockerTag {
        /// The naming scheme the tags follow.
        strategy: TagVersionStrategy,
        /// Caller-supplied pattern overriding the strategy's own; must
        /// declare exactly one capture group.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capture_group_regex: Option<String>,
    },
}

/// A deployable unit tracked by the control plane, identified by
/// `(name, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryArtifact {
    /// The artifact name, unique within its kind.
    pub name: String,
    /// The artifact kind.
    pub kind: ArtifactKind,
    /// Acceptable version statuses. Empty means every status is accepted.
    pub statuses: BTreeSet<ArtifactStatus>,
    /// How this artifact's versions are ordered.
    pub versioning_strategy: VersioningStrategy,
}

impl DeliveryArtifact {
    /// Creates a Debian artifact accepting the given statuses.
    pub fn debian(
        name: impl Into<String>,
        statuses: impl IntoIterator<Item = ArtifactStatus>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::Debian,
            statuses: statuses.into_iter().collect(),
            versioning_strategy: VersioningStrategy::DebianSemver,
        }
    }

    /// Creates a Docker artifact whose tags follow the given strategy.
    pub fn docker(name: impl Into<String>, strategy: TagVersionStrategy) -> Self {
        Self {
            name: name.into(),
            kind: ArtifactKind::Docker,
            statuses: BTreeSet::new(),
            versioning_strategy: VersioningStrategy::DockerTag {
                strategy,
                capture_group_regex: None,
            },
        }
    }

    /// Whether a version with the given status is accepted by this artifact.
    #[must_use]
    pub fn accepts(&self, status: ArtifactStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }
}
