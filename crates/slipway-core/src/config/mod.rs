//! Delivery-config model.
//!
//! A delivery config binds a set of artifacts to an ordered set of
//! environments for one application. Environments carry declarative
//! constraints whose per-version judgement state is stored independently as
//! [`ConstraintState`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::DeliveryArtifact;
use crate::error::RepositoryError;

/// A named binding of artifacts to environments for one application.
///
/// `name` is globally unique; an application may own several configs but
/// typically has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Globally unique config name.
    pub name: String,
    /// The application this config belongs to.
    pub application: String,
    /// The artifacts this config promotes.
    pub artifacts: Vec<DeliveryArtifact>,
    /// The promotion targets, in pipeline order.
    pub environments: Vec<Environment>,
}

/// A named promotion target within a delivery config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// The environment name, unique within its config.
    pub name: String,
    /// Declarative gates a version must clear before promotion. Opaque to
    /// the persistence core.
    #[serde(default)]
    pub constraints: Vec<Value>,
    /// Ids of the resources this environment manages.
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

impl Environment {
    /// Creates an environment with no constraints or resources.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: Vec::new(),
            resource_ids: Vec::new(),
        }
    }
}

/// Judgement status of one constraint for one version in one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ConstraintStatus {
    /// No judgement recorded yet.
    NotEvaluated,
    /// Judgement in progress.
    Pending,
    /// The constraint passed.
    Pass,
    /// The constraint failed.
    Fail,
    /// A human overrode the constraint.
    Override,
}

impl ConstraintStatus {
    /// Returns the string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotEvaluated => "not_evaluated",
            Self::Pending => "pending",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Override => "override",
        }
    }

    /// Parses a constraint status from a string.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` if the string is not a
    /// recognized status.
    pub fn parse(s: &str) -> Result<Self, RepositoryError> {
        match s {
            "not_evaluated" => Ok(Self::NotEvaluated),
            "pending" => Ok(Self::Pending),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "override" => Ok(Self::Override),
            other => Err(RepositoryError::invalid_argument(format!(
                "unknown constraint status: {other}"
            ))),
        }
    }
}

impl fmt::Display for ConstraintStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The latest judgement of one constraint for one
/// `(config, environment, version, type)` tuple. Mutable; latest write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintState {
    /// The delivery config the judgement belongs to.
    pub config_name: String,
    /// The environment the constraint gates.
    pub environment_name: String,
    /// The artifact version being judged.
    pub version: String,
    /// The constraint type (`manual-judgement`, `depends-on`, ...).
    pub constraint_type: String,
    /// The judgement outcome.
    pub status: ConstraintStatus,
    /// Who recorded the judgement, for manual constraints.
    pub judged_by: Option<String>,
    /// When the judgement was recorded.
    pub judged_at: Option<DateTime<Utc>>,
    /// Free-form judgement comment.
    pub comment: Option<String>,
}
