//! Repository error taxonomy.
//!
//! The closed set of domain failures the persistence core raises. Domain
//! errors are terminal; the core performs no internal retries. Store-level
//! failures surface as [`RepositoryError::Transient`] and the caller's retry
//! policy applies.

use thiserror::Error;

use crate::artifact::ArtifactKind;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// Storing or querying a version of an artifact that was never registered.
    #[error("no registered {kind} artifact named '{name}'")]
    NoSuchArtifact {
        /// The artifact name.
        name: String,
        /// The artifact kind.
        kind: ArtifactKind,
    },

    /// Delivery-config lookup by an unknown name.
    #[error("no delivery config named '{name}'")]
    NoSuchDeliveryConfig {
        /// The config name that was not found.
        name: String,
    },

    /// `get`, `delete`, or `event_history` on an unknown resource id.
    ///
    /// `event_history` also raises this for a known resource with no events;
    /// the repository conflates "unknown" and "no history".
    #[error("no resource with id '{id}'")]
    NoSuchResource {
        /// The resource id that was not found.
        id: String,
    },

    /// A caller-supplied argument is out of range (zero history limit,
    /// negative staleness duration).
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// A tag comparator regex declared more than one capture group.
    #[error("tag regex '{pattern}' must have exactly one capture group, found {groups}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// The number of capture groups the pattern declares.
        groups: usize,
    },

    /// The underlying store failed or is unavailable. May be retried by the
    /// caller with backoff; the core never retries.
    #[error("storage error: {source}")]
    Transient {
        /// The store-level failure.
        #[from]
        source: rusqlite::Error,
    },

    /// A stored payload failed to encode or decode.
    #[error("payload codec error: {source}")]
    Codec {
        /// The serialization failure.
        #[from]
        source: serde_json::Error,
    },
}

impl RepositoryError {
    /// Shorthand for an [`RepositoryError::InvalidArgument`] with the given
    /// message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true when the error may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Convenient result alias for repository operations.
pub type RepoResult<T> = Result<T, RepositoryError>;
