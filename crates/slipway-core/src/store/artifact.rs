//! Artifact registry and promotion state machine.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};

use super::Database;
use crate::artifact::{ArtifactKind, ArtifactStatus, DeliveryArtifact, VersionComparator};
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::error::{RepoResult, RepositoryError};

/// Lifecycle roll-up of one artifact's versions in one environment.
///
/// At most one version is `current` and at most one is `deploying`;
/// `previous` holds versions that were once current, newest deployment first.
/// `pending` holds every other accepted version, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionBuckets {
    /// Accepted versions that have not reached this environment.
    pub pending: Vec<String>,
    /// The version currently deployed, if any.
    pub current: Option<String>,
    /// The version being deployed, if any.
    pub deploying: Option<String>,
    /// Superseded versions, newest deployment first.
    pub previous: Vec<String>,
}

/// One `(environment, artifact)` entry returned by
/// [`SqliteArtifactRepository::versions_by_environment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentArtifactVersions {
    /// The environment name.
    pub environment: String,
    /// The artifact name.
    pub artifact_name: String,
    /// The artifact kind.
    pub artifact_kind: ArtifactKind,
    /// The lifecycle roll-up.
    pub versions: PromotionBuckets,
}

/// `SQLite`-backed artifact registry.
///
/// Registers artifacts, stores their versions, records per-environment
/// promotions, and answers lifecycle queries. Promotion transitions for one
/// `(config, artifact, environment)` run as single transactions on the
/// shared connection, so they are linearizable with respect to each other.
#[derive(Clone)]
pub struct SqliteArtifactRepository {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteArtifactRepository {
    /// Creates a repository over the given store and clock.
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: db.clone(),
            clock,
        }
    }

    /// Registers an artifact. Returns `true` if it was newly registered,
    /// `false` if an artifact with the same `(name, kind)` already existed, in
    /// which case its status filter and versioning strategy are refreshed.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn register(&self, artifact: &DeliveryArtifact) -> RepoResult<bool> {
        let statuses = serde_json::to_string(&artifact.statuses)?;
        let strategy = serde_json::to_string(&artifact.versioning_strategy)?;
        let conn = self.db.lock();
        let existing = artifact_id(&conn, artifact)?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE artifact SET statuses = ?1, versioning_strategy = ?2 WHERE id = ?3",
                    params![statuses, strategy, id],
                )?;
                Ok(false)
            }
            None => {
                conn.execute(
                    "INSERT INTO artifact (name, kind, statuses, versioning_strategy)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![artifact.name, artifact.kind.as_str(), statuses, strategy],
                )?;
                tracing::debug!(name = %artifact.name, kind = %artifact.kind, "registered artifact");
                Ok(true)
            }
        }
    }

    /// Whether an artifact with the given name and kind is registered.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn is_registered(&self, name: &str, kind: ArtifactKind) -> RepoResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM artifact WHERE name = ?1 AND kind = ?2",
                params![name, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns every registered artifact, optionally restricted to one kind.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails, or a codec error if a
    /// stored artifact row is malformed.
    pub fn get_all(&self, kind: Option<ArtifactKind>) -> RepoResult<Vec<DeliveryArtifact>> {
        let conn = self.db.lock();
        let mut stmt = match kind {
            Some(_) => conn.prepare(
                "SELECT name, kind, statuses, versioning_strategy FROM artifact
                 WHERE kind = ?1 ORDER BY name",
            )?,
            None => conn.prepare(
                "SELECT name, kind, statuses, versioning_strategy FROM artifact
                 ORDER BY kind, name",
            )?,
        };
        let rows = match kind {
            Some(kind) => stmt.query_map(params![kind.as_str()], artifact_columns)?,
            None => stmt.query_map([], artifact_columns)?,
        }
        .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, kind, statuses, strategy)| {
                Ok(DeliveryArtifact {
                    name,
                    kind: ArtifactKind::parse(&kind)?,
                    statuses: serde_json::from_str(&statuses)?,
                    versioning_strategy: serde_json::from_str(&strategy)?,
                })
            })
            .collect()
    }

    /// Stores a version of a registered artifact. Returns `true` if the
    /// version is new, `false` if it was already present; the status of the
    /// first insert wins and is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchArtifact` if the artifact is not
    /// registered.
    pub fn store_version(
        &self,
        artifact: &DeliveryArtifact,
        version: &str,
        status: ArtifactStatus,
    ) -> RepoResult<bool> {
        let conn = self.db.lock();
        let id = require_artifact_id(&conn, artifact)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO artifact_version (artifact_id, version, status, stored_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                version,
                status.as_str(),
                self.clock.now().timestamp_millis()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Returns the artifact's known versions, newest first under its
    /// comparator. The optional status filter defaults to the statuses the
    /// artifact accepts.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchArtifact` if the artifact is not
    /// registered.
    pub fn versions(
        &self,
        artifact: &DeliveryArtifact,
        statuses: Option<&BTreeSet<ArtifactStatus>>,
    ) -> RepoResult<Vec<String>> {
        let comparator = VersionComparator::for_artifact(artifact)?;
        let conn = self.db.lock();
        let id = require_artifact_id(&conn, artifact)?;
        let mut versions = load_versions(&conn, id, effective_filter(artifact, statuses))?;
        drop(conn);
        comparator.sort_newest_first(&mut versions);
        Ok(versions)
    }

    /// Approves a version for deployment into an environment. Approval is
    /// monotonic; re-approving returns `false`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchArtifact` if the artifact is not
    /// registered.
    pub fn approve_version_for(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> RepoResult<bool> {
        let conn = self.db.lock();
        let id = require_artifact_id(&conn, artifact)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO environment_artifact_version
             (config_name, artifact_id, environment_name, version, approved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                config_name,
                id,
                environment,
                version,
                self.clock.now().timestamp_millis()
            ],
        )?;
        Ok(changed == 1)
    }

    /// Whether a version has been approved for an environment.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn is_approved_for(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> RepoResult<bool> {
        let conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(false);
        };
        Ok(promotion_row(&conn, config_name, id, environment, version)?.is_some())
    }

    /// Marks an approved version as deploying into an environment. A no-op
    /// for unapproved or already-deployed versions. Any other in-flight
    /// version loses its deploying slot, so at most one version is deploying
    /// per `(config, artifact, environment)`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn mark_as_deploying_to(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> RepoResult<()> {
        let mut conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(());
        };
        let tx = conn.transaction()?;
        let Some(row) = promotion_row(&tx, config_name, id, environment, version)? else {
            tracing::debug!(
                version,
                environment,
                "ignoring deploying transition for unapproved version"
            );
            return Ok(());
        };
        if row.deployed_at.is_some() {
            return Ok(());
        }
        tx.execute(
            "UPDATE environment_artifact_version SET deploying_at = NULL
             WHERE config_name = ?1 AND artifact_id = ?2 AND environment_name = ?3
               AND version != ?4 AND deployed_at IS NULL",
            params![config_name, id, environment, version],
        )?;
        if row.deploying_at.is_none() {
            tx.execute(
                "UPDATE environment_artifact_version SET deploying_at = ?1
                 WHERE config_name = ?2 AND artifact_id = ?3 AND environment_name = ?4
                   AND version = ?5",
                params![
                    self.clock.now().timestamp_millis(),
                    config_name,
                    id,
                    environment,
                    version
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Records a successful deployment: the version becomes current and the
    /// prior current version, if any, joins the previous set. A no-op when
    /// the version was never approved or is already deployed.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn mark_as_successfully_deployed_to(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> RepoResult<()> {
        let conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(());
        };
        conn.execute(
            "UPDATE environment_artifact_version SET deployed_at = ?1
             WHERE config_name = ?2 AND artifact_id = ?3 AND environment_name = ?4
               AND version = ?5 AND deployed_at IS NULL",
            params![
                self.clock.now().timestamp_millis(),
                config_name,
                id,
                environment,
                version
            ],
        )?;
        Ok(())
    }

    /// Whether a version was ever successfully deployed to an environment.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn was_successfully_deployed_to(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> RepoResult<bool> {
        let conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(false);
        };
        Ok(promotion_row(&conn, config_name, id, environment, version)?
            .is_some_and(|row| row.deployed_at.is_some()))
    }

    /// Returns the newest version (under the artifact's comparator) approved
    /// in an environment whose status matches the filter. The filter defaults
    /// to the statuses the artifact accepts; versions with no stored status
    /// only pass an empty filter.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn latest_version_approved_in(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        environment: &str,
        statuses: Option<&BTreeSet<ArtifactStatus>>,
    ) -> RepoResult<Option<String>> {
        let comparator = VersionComparator::for_artifact(artifact)?;
        let conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(None);
        };
        let filter = effective_filter(artifact, statuses);
        let mut stmt = conn.prepare(
            "SELECT eav.version, av.status
             FROM environment_artifact_version eav
             LEFT JOIN artifact_version av
               ON av.artifact_id = eav.artifact_id AND av.version = eav.version
             WHERE eav.config_name = ?1 AND eav.artifact_id = ?2
               AND eav.environment_name = ?3",
        )?;
        let rows = stmt
            .query_map(params![config_name, id, environment], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut approved = Vec::new();
        for (version, status) in rows {
            if status_passes(&filter, status.as_deref())? {
                approved.push(version);
            }
        }
        comparator.sort_newest_first(&mut approved);
        Ok(approved.into_iter().next())
    }

    /// Returns the lifecycle roll-up for every `(environment, artifact)` pair
    /// of a delivery config. Artifacts the config names but the registry does
    /// not know yield empty buckets.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn versions_by_environment(
        &self,
        config: &DeliveryConfig,
    ) -> RepoResult<Vec<EnvironmentArtifactVersions>> {
        let mut rollups = Vec::new();
        for environment in &config.environments {
            for artifact in &config.artifacts {
                let buckets = self.promotion_buckets(&config.name, artifact, &environment.name)?;
                rollups.push(EnvironmentArtifactVersions {
                    environment: environment.name.clone(),
                    artifact_name: artifact.name.clone(),
                    artifact_kind: artifact.kind,
                    versions: buckets,
                });
            }
        }
        Ok(rollups)
    }

    fn promotion_buckets(
        &self,
        config_name: &str,
        artifact: &DeliveryArtifact,
        environment: &str,
    ) -> RepoResult<PromotionBuckets> {
        let comparator = VersionComparator::for_artifact(artifact)?;
        let conn = self.db.lock();
        let Some(id) = artifact_id(&conn, artifact)? else {
            return Ok(PromotionBuckets::default());
        };
        let mut known = load_versions(&conn, id, effective_filter(artifact, None))?;

        let mut stmt = conn.prepare(
            "SELECT version, deploying_at, deployed_at, rowid
             FROM environment_artifact_version
             WHERE config_name = ?1 AND artifact_id = ?2 AND environment_name = ?3",
        )?;
        let promotions = stmt
            .query_map(params![config_name, id, environment], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        // Deployed rows ordered newest deployment first; insertion order
        // breaks timestamp ties.
        let mut deployed: Vec<(String, i64, i64)> = promotions
            .iter()
            .filter_map(|(version, _, deployed_at, rowid)| {
                deployed_at.map(|at| (version.clone(), at, *rowid))
            })
            .collect();
        deployed.sort_by(|a, b| (b.1, b.2).cmp(&(a.1, a.2)));

        let current = deployed.first().map(|(version, _, _)| version.clone());
        let previous: Vec<String> = deployed
            .iter()
            .skip(1)
            .map(|(version, _, _)| version.clone())
            .collect();
        let deploying = promotions
            .iter()
            .filter(|(_, deploying_at, deployed_at, _)| {
                deploying_at.is_some() && deployed_at.is_none()
            })
            .max_by_key(|(_, deploying_at, _, rowid)| (*deploying_at, *rowid))
            .map(|(version, _, _, _)| version.clone());

        known.retain(|version| {
            Some(version) != current.as_ref()
                && Some(version) != deploying.as_ref()
                && !previous.contains(version)
        });
        comparator.sort_newest_first(&mut known);

        Ok(PromotionBuckets {
            pending: known,
            current,
            deploying,
            previous,
        })
    }
}

/// One promotion row's transition timestamps.
struct PromotionRow {
    deploying_at: Option<i64>,
    deployed_at: Option<i64>,
}

fn promotion_row(
    conn: &Connection,
    config_name: &str,
    artifact_id: i64,
    environment: &str,
    version: &str,
) -> RepoResult<Option<PromotionRow>> {
    let row = conn
        .query_row(
            "SELECT deploying_at, deployed_at FROM environment_artifact_version
             WHERE config_name = ?1 AND artifact_id = ?2 AND environment_name = ?3
               AND version = ?4",
            params![config_name, artifact_id, environment, version],
            |row| {
                Ok(PromotionRow {
                    deploying_at: row.get(0)?,
                    deployed_at: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

type ArtifactRow = (String, String, String, String);

fn artifact_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn artifact_id(conn: &Connection, artifact: &DeliveryArtifact) -> RepoResult<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT id FROM artifact WHERE name = ?1 AND kind = ?2",
            params![artifact.name, artifact.kind.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn require_artifact_id(conn: &Connection, artifact: &DeliveryArtifact) -> RepoResult<i64> {
    artifact_id(conn, artifact)?.ok_or_else(|| RepositoryError::NoSuchArtifact {
        name: artifact.name.clone(),
        kind: artifact.kind,
    })
}

/// The caller's filter when given, otherwise the artifact's own; empty means
/// "every status".
fn effective_filter(
    artifact: &DeliveryArtifact,
    statuses: Option<&BTreeSet<ArtifactStatus>>,
) -> BTreeSet<ArtifactStatus> {
    statuses.unwrap_or(&artifact.statuses).clone()
}

fn status_passes(filter: &BTreeSet<ArtifactStatus>, status: Option<&str>) -> RepoResult<bool> {
    if filter.is_empty() {
        return Ok(true);
    }
    match status {
        Some(status) => Ok(filter.contains(&ArtifactStatus::parse(status)?)),
        None => Ok(false),
    }
}

fn load_versions(
    conn: &Connection,
    artifact_id: i64,
    filter: BTreeSet<ArtifactStatus>,
) -> RepoResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT version, status FROM artifact_version WHERE artifact_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![artifact_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut versions = Vec::with_capacity(rows.len());
    for (version, status) in rows {
        if status_passes(&filter, Some(status.as_str()))? {
            versions.push(version);
        }
    }
    Ok(versions)
}
