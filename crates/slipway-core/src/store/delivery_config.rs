//! Delivery-config storage and constraint state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::check::DELIVERY_CONFIG_CHECKS;
use super::Database;
use crate::artifact::{ArtifactKind, DeliveryArtifact};
use crate::clock::Clock;
use crate::config::{ConstraintState, ConstraintStatus, DeliveryConfig, Environment};
use crate::error::{RepoResult, RepositoryError};

/// `SQLite`-backed delivery-config repository.
///
/// Stores the binding of artifacts to environments, the per-environment
/// constraint state, and the last-check bookkeeping behind the
/// claim-for-check protocol for configs.
#[derive(Clone)]
pub struct SqliteDeliveryConfigRepository {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteDeliveryConfigRepository {
    /// Creates a repository over the given store and clock.
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: db.clone(),
            clock,
        }
    }

    /// Upserts a delivery config by name, reconciling artifact and
    /// environment membership. Artifacts and environments no longer named by
    /// the config are detached; promotion history is never cascaded. Member
    /// artifacts are registered idempotently.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails (in which case the
    /// stored config is unchanged).
    pub fn store(&self, config: &DeliveryConfig) -> RepoResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO delivery_config (name, application) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET application = excluded.application",
            params![config.name, config.application],
        )?;

        // Artifact membership is rebuilt from scratch; the join table is the
        // only thing detached artifacts lose.
        tx.execute(
            "DELETE FROM delivery_config_artifact WHERE config_name = ?1",
            params![config.name],
        )?;
        for artifact in &config.artifacts {
            let artifact_id = upsert_artifact(&tx, artifact)?;
            tx.execute(
                "INSERT OR IGNORE INTO delivery_config_artifact (config_name, artifact_id)
                 VALUES (?1, ?2)",
                params![config.name, artifact_id],
            )?;
        }

        let kept: HashSet<&str> = config
            .environments
            .iter()
            .map(|environment| environment.name.as_str())
            .collect();
        let existing = {
            let mut stmt =
                tx.prepare("SELECT id, name FROM environment WHERE config_name = ?1")?;
            let rows = stmt
                .query_map(params![config.name], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (environment_id, name) in &existing {
            if !kept.contains(name.as_str()) {
                tx.execute(
                    "DELETE FROM environment_resource WHERE environment_id = ?1",
                    params![environment_id],
                )?;
                tx.execute("DELETE FROM environment WHERE id = ?1", params![environment_id])?;
            }
        }
        for (position, environment) in config.environments.iter().enumerate() {
            let constraints = serde_json::to_string(&environment.constraints)?;
            tx.execute(
                "INSERT INTO environment (config_name, name, position, constraints)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(config_name, name) DO UPDATE SET
                   position = excluded.position,
                   constraints = excluded.constraints",
                params![
                    config.name,
                    environment.name,
                    i64::try_from(position).unwrap_or(i64::MAX),
                    constraints
                ],
            )?;
            let environment_id: i64 = tx.query_row(
                "SELECT id FROM environment WHERE config_name = ?1 AND name = ?2",
                params![config.name, environment.name],
                |row| row.get(0),
            )?;
            tx.execute(
                "DELETE FROM environment_resource WHERE environment_id = ?1",
                params![environment_id],
            )?;
            for resource_id in &environment.resource_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO environment_resource (environment_id, resource_id)
                     VALUES (?1, ?2)",
                    params![environment_id, resource_id],
                )?;
            }
        }

        DELIVERY_CONFIG_CHECKS.seed(&tx, &config.name)?;
        tx.commit()?;
        tracing::debug!(name = %config.name, application = %config.application, "stored delivery config");
        Ok(())
    }

    /// Returns the config with the given name.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchDeliveryConfig` if no config has that
    /// name.
    pub fn get(&self, name: &str) -> RepoResult<DeliveryConfig> {
        let conn = self.db.lock();
        get_config(&conn, name)
    }

    /// Returns every config owned by an application; zero or more.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn get_by_application(&self, application: &str) -> RepoResult<Vec<DeliveryConfig>> {
        let conn = self.db.lock();
        let names = {
            let mut stmt = conn.prepare(
                "SELECT name FROM delivery_config WHERE application = ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map(params![application], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        names.iter().map(|name| get_config(&conn, name)).collect()
    }

    /// Deletes every config owned by an application, including promotion
    /// history and constraint state. Underlying resources are preserved.
    /// Returns the number of configs removed.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn delete_by_application(&self, application: &str) -> RepoResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let names = {
            let mut stmt =
                tx.prepare("SELECT name FROM delivery_config WHERE application = ?1")?;
            let rows = stmt
                .query_map(params![application], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for name in &names {
            let environment_ids = {
                let mut stmt = tx.prepare("SELECT id FROM environment WHERE config_name = ?1")?;
                let rows = stmt
                    .query_map(params![name], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            for environment_id in environment_ids {
                tx.execute(
                    "DELETE FROM environment_resource WHERE environment_id = ?1",
                    params![environment_id],
                )?;
            }
            tx.execute("DELETE FROM environment WHERE config_name = ?1", params![name])?;
            tx.execute(
                "DELETE FROM delivery_config_artifact WHERE config_name = ?1",
                params![name],
            )?;
            tx.execute(
                "DELETE FROM environment_artifact_version WHERE config_name = ?1",
                params![name],
            )?;
            tx.execute(
                "DELETE FROM constraint_state WHERE config_name = ?1",
                params![name],
            )?;
            DELIVERY_CONFIG_CHECKS.remove(&tx, name)?;
            tx.execute("DELETE FROM delivery_config WHERE name = ?1", params![name])?;
        }
        tx.commit()?;
        Ok(names.len())
    }

    /// Returns the environment that manages a resource, or `None` when the
    /// resource is unmanaged.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn environment_for(&self, resource_id: &str) -> RepoResult<Option<Environment>> {
        let conn = self.db.lock();
        let Some((environment_id, name, constraints)) = environment_row_for(&conn, resource_id)?
        else {
            return Ok(None);
        };
        Ok(Some(load_environment(
            &conn,
            environment_id,
            name,
            &constraints,
        )?))
    }

    /// Returns the config that manages a resource, or `None` when the
    /// resource is unmanaged.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn delivery_config_for(&self, resource_id: &str) -> RepoResult<Option<DeliveryConfig>> {
        let conn = self.db.lock();
        let config_name: Option<String> = conn
            .query_row(
                "SELECT e.config_name FROM environment_resource er
                 JOIN environment e ON e.id = er.environment_id
                 WHERE er.resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        match config_name {
            Some(name) => Ok(Some(get_config(&conn, &name)?)),
            None => Ok(None),
        }
    }

    /// Upserts the judgement state for one
    /// `(config, environment, version, type)` tuple; the latest write wins.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn store_constraint_state(&self, state: &ConstraintState) -> RepoResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO constraint_state
             (config_name, environment_name, version, constraint_type, status,
              recorded_at, judged_by, judged_at, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(config_name, environment_name, version, constraint_type)
             DO UPDATE SET
               status = excluded.status,
               recorded_at = excluded.recorded_at,
               judged_by = excluded.judged_by,
               judged_at = excluded.judged_at,
               comment = excluded.comment",
            params![
                state.config_name,
                state.environment_name,
                state.version,
                state.constraint_type,
                state.status.as_str(),
                self.clock.now().timestamp_millis(),
                state.judged_by,
                state.judged_at.map(|at| at.timestamp_millis()),
                state.comment,
            ],
        )?;
        Ok(())
    }

    /// Point lookup of one constraint state, or `None`.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn get_constraint_state(
        &self,
        config_name: &str,
        environment_name: &str,
        version: &str,
        constraint_type: &str,
    ) -> RepoResult<Option<ConstraintState>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT config_name, environment_name, version, constraint_type, status,
                        judged_by, judged_at, comment
                 FROM constraint_state
                 WHERE config_name = ?1 AND environment_name = ?2 AND version = ?3
                   AND constraint_type = ?4",
                params![config_name, environment_name, version, constraint_type],
                constraint_state_columns,
            )
            .optional()?;
        row.map(decode_constraint_state).transpose()
    }

    /// For each `(environment, type)` pair across an application's configs,
    /// the most recent state over all versions, at most one per pair.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn constraint_states_for_application(
        &self,
        application: &str,
    ) -> RepoResult<Vec<ConstraintState>> {
        let conn = self.db.lock();
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT cs.config_name, cs.environment_name, cs.version, cs.constraint_type,
                        cs.status, cs.judged_by, cs.judged_at, cs.comment
                 FROM constraint_state cs
                 JOIN delivery_config dc ON dc.name = cs.config_name
                 WHERE dc.application = ?1
                 ORDER BY cs.recorded_at DESC, cs.rowid DESC",
            )?;
            let rows = stmt
                .query_map(params![application], constraint_state_columns)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        drop(conn);

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut states = Vec::new();
        for row in rows {
            let state = decode_constraint_state(row)?;
            let key = (state.environment_name.clone(), state.constraint_type.clone());
            if seen.insert(key) {
                states.push(state);
            }
        }
        Ok(states)
    }

    /// The most recent `limit` states for one environment across all
    /// constraint types and versions, recency-descending.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn constraint_state_history(
        &self,
        config_name: &str,
        environment_name: &str,
        limit: usize,
    ) -> RepoResult<Vec<ConstraintState>> {
        let conn = self.db.lock();
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT config_name, environment_name, version, constraint_type, status,
                        judged_by, judged_at, comment
                 FROM constraint_state
                 WHERE config_name = ?1 AND environment_name = ?2
                 ORDER BY recorded_at DESC, rowid DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        config_name,
                        environment_name,
                        i64::try_from(limit).unwrap_or(i64::MAX)
                    ],
                    constraint_state_columns,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(decode_constraint_state).collect()
    }

    /// Atomically claims up to `limit` configs whose last check is at least
    /// `min_since_last` old, oldest first, advancing their last-check
    /// timestamp to now. See the claim-for-check protocol in
    /// [`crate::store`].
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` for a negative staleness
    /// window, or a transient error if the transaction fails.
    pub fn items_due_for_check(
        &self,
        min_since_last: Duration,
        limit: usize,
    ) -> RepoResult<Vec<DeliveryConfig>> {
        let mut conn = self.db.lock();
        let now = self.clock.now();
        let names = DELIVERY_CONFIG_CHECKS.claim_due(&mut conn, now, min_since_last, limit)?;
        names.iter().map(|name| get_config(&conn, name)).collect()
    }
}

fn upsert_artifact(conn: &Connection, artifact: &DeliveryArtifact) -> RepoResult<i64> {
    let statuses = serde_json::to_string(&artifact.statuses)?;
    let strategy = serde_json::to_string(&artifact.versioning_strategy)?;
    conn.execute(
        "INSERT INTO artifact (name, kind, statuses, versioning_strategy)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name, kind) DO UPDATE SET
           statuses = excluded.statuses,
           versioning_strategy = excluded.versioning_strategy",
        params![artifact.name, artifact.kind.as_str(), statuses, strategy],
    )?;
    let id = conn.query_row(
        "SELECT id FROM artifact WHERE name = ?1 AND kind = ?2",
        params![artifact.name, artifact.kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn get_config(conn: &Connection, name: &str) -> RepoResult<DeliveryConfig> {
    let application: String = conn
        .query_row(
            "SELECT application FROM delivery_config WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| RepositoryError::NoSuchDeliveryConfig {
            name: name.to_string(),
        })?;

    let artifact_rows = {
        let mut stmt = conn.prepare(
            "SELECT a.name, a.kind, a.statuses, a.versioning_strategy
             FROM delivery_config_artifact dca
             JOIN artifact a ON a.id = dca.artifact_id
             WHERE dca.config_name = ?1
             ORDER BY a.kind, a.name",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let artifacts = artifact_rows
        .into_iter()
        .map(|(name, kind, statuses, strategy)| {
            Ok(DeliveryArtifact {
                name,
                kind: ArtifactKind::parse(&kind)?,
                statuses: serde_json::from_str(&statuses)?,
                versioning_strategy: serde_json::from_str(&strategy)?,
            })
        })
        .collect::<RepoResult<Vec<_>>>()?;

    let environment_rows = {
        let mut stmt = conn.prepare(
            "SELECT id, name, constraints FROM environment
             WHERE config_name = ?1 ORDER BY position, id",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let environments = environment_rows
        .into_iter()
        .map(|(id, env_name, constraints)| load_environment(conn, id, env_name, &constraints))
        .collect::<RepoResult<Vec<_>>>()?;

    Ok(DeliveryConfig {
        name: name.to_string(),
        application,
        artifacts,
        environments,
    })
}

fn environment_row_for(
    conn: &Connection,
    resource_id: &str,
) -> RepoResult<Option<(i64, String, String)>> {
    let row = conn
        .query_row(
            "SELECT e.id, e.name, e.constraints FROM environment_resource er
             JOIN environment e ON e.id = er.environment_id
             WHERE er.resource_id = ?1",
            params![resource_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

fn load_environment(
    conn: &Connection,
    environment_id: i64,
    name: String,
    constraints_json: &str,
) -> RepoResult<Environment> {
    let resource_ids = {
        let mut stmt = conn.prepare(
            "SELECT resource_id FROM environment_resource
             WHERE environment_id = ?1 ORDER BY resource_id",
        )?;
        let rows = stmt
            .query_map(params![environment_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    Ok(Environment {
        name,
        constraints: serde_json::from_str(constraints_json)?,
        resource_ids,
    })
}

type ConstraintStateRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    Option<String>,
);

fn constraint_state_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConstraintStateRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_constraint_state(row: ConstraintStateRow) -> RepoResult<ConstraintState> {
    let (config_name, environment_name, version, constraint_type, status, judged_by, judged_at, comment) =
        row;
    Ok(ConstraintState {
        config_name,
        environment_name,
        version,
        constraint_type,
        status: ConstraintStatus::parse(&status)?,
        judged_by,
        judged_at: judged_at.and_then(DateTime::<Utc>::from_timestamp_millis),
        comment,
    })
}
