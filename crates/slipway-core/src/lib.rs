//! # slipway-core
//!
//! Persistence and promotion core for the slipway delivery control plane.
//!
//! Slipway tracks declarative delivery configurations that bind artifacts
//! (Debian packages, Docker images) to a pipeline of environments, and drives
//! each artifact version through a per-environment lifecycle
//! (pending → deploying → current → previous). This crate owns the durable
//! state behind that flow:
//!
//! - **Artifact registry and version ordering**: artifact registration,
//!   version ingestion with status tags, and a total order per artifact that
//!   respects version-scheme semantics (Debian dpkg ordering, Docker tag
//!   strategies).
//! - **Per-environment promotion state machine**: approval, deploying, and
//!   successful-deployment transitions with derivable roll-ups.
//! - **Resource repository with a claim-for-check protocol**: durable storage
//!   of declarative resources, append-only event history, and a fair,
//!   contention-safe work-claim loop for reconciler workers.
//!
//! Storage is `SQLite` behind a shared connection handle; every repository is
//! safe to call from any number of threads. All time-stamping and staleness
//! arithmetic go through the injected [`Clock`], never a wall-clock API.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use slipway_core::artifact::{ArtifactStatus, DeliveryArtifact};
//! use slipway_core::store::{Database, SqliteArtifactRepository};
//! use slipway_core::SystemClock;
//!
//! # fn example() -> slipway_core::RepoResult<()> {
//! let db = Database::in_memory()?;
//! let artifacts = SqliteArtifactRepository::new(&db, Arc::new(SystemClock));
//!
//! let fnord = DeliveryArtifact::debian("fnord", [ArtifactStatus::Snapshot]);
//! artifacts.register(&fnord)?;
//! artifacts.store_version(&fnord, "fnord-0.156.0~dev.3-h12.d4b9e21", ArtifactStatus::Snapshot)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod resource;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RepoResult, RepositoryError};
pub use store::{
    Database, SqliteArtifactRepository, SqliteDeliveryConfigRepository, SqliteResourceRepository,
};
