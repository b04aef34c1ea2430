//! Resource storage, event history, and the reconciliation claim loop.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

use super::check::RESOURCE_CHECKS;
use super::Database;
use crate::clock::Clock;
use crate::error::{RepoResult, RepositoryError};
use crate::resource::{Resource, ResourceEvent, ResourceHeader, ResourceSummary};

/// `SQLite`-backed resource repository.
///
/// Stores declarative resources with their append-only event histories and
/// hands resources to reconciler workers through the claim-for-check
/// protocol. Deletes cascade explicitly: a resource takes its events and its
/// last-check row with it.
#[derive(Clone)]
pub struct SqliteResourceRepository {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteResourceRepository {
    /// Creates a repository over the given store and clock.
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db: db.clone(),
            clock,
        }
    }

    /// Upserts a resource by `id` and returns it with its `uid` filled in.
    ///
    /// The first insert allocates a fresh lexicographically sortable uid
    /// (timestamped from the injected clock) and seeds the last-check row at
    /// epoch + 1 second, so the resource is immediately due for check.
    /// Updates preserve the uid.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn store(&self, resource: &Resource) -> RepoResult<Resource> {
        let metadata = serde_json::to_string(&resource.metadata)?;
        let spec = serde_json::to_string(&resource.spec)?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT uid FROM resource WHERE id = ?1",
                params![resource.id],
                |row| row.get(0),
            )
            .optional()?;
        let uid = match existing {
            Some(uid) => {
                tx.execute(
                    "UPDATE resource SET api_version = ?1, kind = ?2, application = ?3,
                            metadata = ?4, spec = ?5
                     WHERE uid = ?6",
                    params![
                        resource.api_version,
                        resource.kind,
                        resource.application,
                        metadata,
                        spec,
                        uid
                    ],
                )?;
                uid
            }
            None => {
                let uid = Ulid::from_datetime(SystemTime::from(self.clock.now())).to_string();
                tx.execute(
                    "INSERT INTO resource (uid, id, api_version, kind, application, metadata, spec)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        uid,
                        resource.id,
                        resource.api_version,
                        resource.kind,
                        resource.application,
                        metadata,
                        spec
                    ],
                )?;
                tracing::debug!(id = %resource.id, uid = %uid, "stored new resource");
                uid
            }
        };
        RESOURCE_CHECKS.seed(&tx, &uid)?;
        tx.commit()?;

        let mut stored = resource.clone();
        stored.uid = Some(uid);
        Ok(stored)
    }

    /// Returns the resource with the given id.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchResource` if the id is unknown.
    pub fn get(&self, id: &str) -> RepoResult<Resource> {
        let conn = self.db.lock();
        get_resource(&conn, id)
    }

    /// Returns every resource owned by an application.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn get_by_application(&self, application: &str) -> RepoResult<Vec<Resource>> {
        let conn = self.db.lock();
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT uid, id, api_version, kind, application, metadata, spec
                 FROM resource WHERE application = ?1 ORDER BY uid",
            )?;
            let rows = stmt
                .query_map(params![application], resource_columns)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(decode_resource).collect()
    }

    /// Returns the ids of every resource owned by an application.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn get_ids_by_application(&self, application: &str) -> RepoResult<Vec<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM resource WHERE application = ?1 ORDER BY uid",
        )?;
        let ids = stmt
            .query_map(params![application], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Whether an application owns any resources.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn has_managed_resources(&self, application: &str) -> RepoResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM resource WHERE application = ?1 LIMIT 1",
                params![application],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Per-resource projections for an application. A resource's status is
    /// the kind of its most recent history event, `"created"` when it has no
    /// history yet.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn get_summaries_by_application(
        &self,
        application: &str,
    ) -> RepoResult<Vec<ResourceSummary>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.api_version, r.kind, r.application,
                    (SELECT kind FROM resource_event re
                     WHERE re.resource_uid = r.uid
                     ORDER BY re.timestamp DESC, re.id DESC LIMIT 1)
             FROM resource r WHERE r.application = ?1 ORDER BY r.uid",
        )?;
        let summaries = stmt
            .query_map(params![application], |row| {
                Ok(ResourceSummary {
                    id: row.get(0)?,
                    api_version: row.get(1)?,
                    kind: row.get(2)?,
                    application: row.get(3)?,
                    status: row
                        .get::<_, Option<String>>(4)?
                        .unwrap_or_else(|| "created".to_string()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    /// Deletes a resource together with its events and last-check row.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::NoSuchResource` if the id is unknown, or a
    /// transient error if the transaction fails.
    pub fn delete(&self, id: &str) -> RepoResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let uid: String = tx
            .query_row(
                "SELECT uid FROM resource WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NoSuchResource { id: id.to_string() })?;
        delete_resource_by_uid(&tx, &uid)?;
        tx.commit()?;
        tracing::debug!(id, uid = %uid, "deleted resource");
        Ok(())
    }

    /// Deletes every resource owned by an application, each with its
    /// dependents. Returns the number of resources removed.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn delete_by_application(&self, application: &str) -> RepoResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let uids = {
            let mut stmt = tx.prepare("SELECT uid FROM resource WHERE application = ?1")?;
            let rows = stmt
                .query_map(params![application], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for uid in &uids {
            delete_resource_by_uid(&tx, uid)?;
        }
        tx.commit()?;
        Ok(uids.len())
    }

    /// Streams a lightweight header for every stored resource to the caller's
    /// sink. Single pass, not restartable.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the store fails.
    pub fn all_resources(&self, visit: &mut dyn FnMut(ResourceHeader)) -> RepoResult<()> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT id, api_version, kind FROM resource ORDER BY uid")?;
        let headers = stmt.query_map([], |row| {
            Ok(ResourceHeader {
                id: row.get(0)?,
                api_version: row.get(1)?,
                kind: row.get(2)?,
            })
        })?;
        for header in headers {
            visit(header?);
        }
        Ok(())
    }

    /// Returns the last `limit` events for a resource, newest first.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` when `limit` is zero, and
    /// `RepositoryError::NoSuchResource` when the id is unknown or the
    /// resource has no events; the repository conflates the two.
    pub fn event_history(&self, id: &str, limit: usize) -> RepoResult<Vec<ResourceEvent>> {
        if limit == 0 {
            return Err(RepositoryError::invalid_argument(
                "event history limit must be positive",
            ));
        }
        let conn = self.db.lock();
        let uid: String = conn
            .query_row(
                "SELECT uid FROM resource WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NoSuchResource { id: id.to_string() })?;
        let rows = {
            let mut stmt = conn.prepare(
                "SELECT resource_uid, timestamp, kind, payload FROM resource_event
                 WHERE resource_uid = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    params![uid, i64::try_from(limit).unwrap_or(i64::MAX)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        drop(conn);

        if rows.is_empty() {
            return Err(RepositoryError::NoSuchResource { id: id.to_string() });
        }
        rows.into_iter()
            .map(|(resource_uid, timestamp, kind, payload)| {
                Ok(ResourceEvent {
                    resource_uid,
                    timestamp: millis_to_datetime(timestamp),
                    kind,
                    payload: serde_json::from_str(&payload)?,
                    suppress_repeats: false,
                })
            })
            .collect()
    }

    /// Appends an event to a resource's history. An event that declares
    /// suppress-repeats is dropped silently when the most recent event for
    /// the same resource has the same kind; the read and the insert share one
    /// transaction so contention cannot produce a duplicate. The timestamp is
    /// taken from the event.
    ///
    /// # Errors
    ///
    /// Returns a transient error if the transaction fails.
    pub fn append_history(&self, event: &ResourceEvent) -> RepoResult<()> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if event.suppress_repeats {
            let latest_kind: Option<String> = tx
                .query_row(
                    "SELECT kind FROM resource_event WHERE resource_uid = ?1
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    params![event.resource_uid],
                    |row| row.get(0),
                )
                .optional()?;
            if latest_kind.as_deref() == Some(event.kind.as_str()) {
                tracing::debug!(
                    resource_uid = %event.resource_uid,
                    kind = %event.kind,
                    "suppressed repeated event"
                );
                return Ok(());
            }
        }
        tx.execute(
            "INSERT INTO resource_event (resource_uid, timestamp, kind, payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.resource_uid,
                event.timestamp.timestamp_millis(),
                event.kind,
                payload
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically claims up to `limit` resources whose last check is at least
    /// `min_since_last` old, oldest first, advancing their last-check
    /// timestamp to now. Concurrent callers never receive the same resource
    /// while the staleness window is closed. See the claim-for-check
    /// protocol in [`crate::store`].
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` for a negative staleness
    /// window, or a transient error if the transaction fails (no timestamps
    /// advanced).
    pub fn items_due_for_check(
        &self,
        min_since_last: Duration,
        limit: usize,
    ) -> RepoResult<Vec<Resource>> {
        let mut conn = self.db.lock();
        let now = self.clock.now();
        let uids = RESOURCE_CHECKS.claim_due(&mut conn, now, min_since_last, limit)?;
        uids.iter()
            .map(|uid| {
                let row = conn.query_row(
                    "SELECT uid, id, api_version, kind, application, metadata, spec
                     FROM resource WHERE uid = ?1",
                    params![uid],
                    resource_columns,
                )?;
                decode_resource(row)
            })
            .collect()
    }
}

fn delete_resource_by_uid(conn: &Connection, uid: &str) -> RepoResult<()> {
    conn.execute(
        "DELETE FROM resource_event WHERE resource_uid = ?1",
        params![uid],
    )?;
    RESOURCE_CHECKS.remove(conn, uid)?;
    conn.execute("DELETE FROM resource WHERE uid = ?1", params![uid])?;
    Ok(())
}

fn get_resource(conn: &Connection, id: &str) -> RepoResult<Resource> {
    let row = conn
        .query_row(
            "SELECT uid, id, api_version, kind, application, metadata, spec
             FROM resource WHERE id = ?1",
            params![id],
            resource_columns,
        )
        .optional()?
        .ok_or_else(|| RepositoryError::NoSuchResource { id: id.to_string() })?;
    decode_resource(row)
}

type ResourceRow = (String, String, String, String, String, String, String);

fn resource_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_resource(row: ResourceRow) -> RepoResult<Resource> {
    let (uid, id, api_version, kind, application, metadata, spec) = row;
    Ok(Resource {
        uid: Some(uid),
        id,
        api_version,
        kind,
        application,
        metadata: serde_json::from_str(&metadata)?,
        spec: serde_json::from_str(&spec)?,
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
