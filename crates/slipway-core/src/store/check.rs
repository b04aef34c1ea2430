//! Claim-for-check protocol.
//!
//! Both the resource and delivery-config repositories hand work to periodic
//! reconciler workers through the same protocol: select up to `limit` rows
//! whose last-check timestamp is at least `min_since_last` old, oldest first,
//! and advance each selected row's timestamp to `now` in the same
//! transaction. Selection and update commit atomically, so concurrent
//! callers never claim the same row while the staleness window is closed. A
//! worker that crashes after claiming simply loses its turn; the row comes
//! due again after another full window, so no lease or heartbeat is needed.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use crate::error::{RepoResult, RepositoryError};

/// Timestamp rows are seeded at epoch + 1 second so a freshly stored item is
/// immediately due for check.
pub(crate) const INITIAL_LAST_CHECKED_MS: i64 = 1_000;

/// One claimable last-check table: key column plus the table name.
pub(crate) struct CheckQueue {
    pub table: &'static str,
    pub key: &'static str,
}

/// Last-check queue for resources.
pub(crate) const RESOURCE_CHECKS: CheckQueue = CheckQueue {
    table: "resource_last_checked",
    key: "resource_uid",
};

/// Last-check queue for delivery configs.
pub(crate) const DELIVERY_CONFIG_CHECKS: CheckQueue = CheckQueue {
    table: "delivery_config_last_checked",
    key: "config_name",
};

impl CheckQueue {
    /// Atomically claims up to `limit` due keys, oldest first (ties broken by
    /// key ascending), advancing their last-check timestamp to `now`.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryError::InvalidArgument` for a negative staleness
    /// window, and a transient error if the transaction fails (in which case
    /// no timestamps were advanced).
    pub fn claim_due(
        &self,
        conn: &mut Connection,
        now: DateTime<Utc>,
        min_since_last: Duration,
        limit: usize,
    ) -> RepoResult<Vec<String>> {
        if min_since_last < Duration::zero() {
            return Err(RepositoryError::invalid_argument(format!(
                "staleness window must not be negative, got {min_since_last}"
            )));
        }
        let cutoff_ms = (now - min_since_last).timestamp_millis();
        let now_ms = now.timestamp_millis();

        let tx = conn.transaction()?;
        let claimed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {key} FROM {table}
                 WHERE last_checked_at <= ?1
                 ORDER BY last_checked_at ASC, {key} ASC
                 LIMIT ?2",
                key = self.key,
                table = self.table,
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let keys = stmt
                .query_map(params![cutoff_ms, limit], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut update = tx.prepare(&format!(
                "UPDATE {table} SET last_checked_at = ?1 WHERE {key} = ?2",
                key = self.key,
                table = self.table,
            ))?;
            for key in &keys {
                update.execute(params![now_ms, key])?;
            }
            keys
        };
        tx.commit()?;

        if !claimed.is_empty() {
            tracing::debug!(
                table = self.table,
                claimed = claimed.len(),
                "claimed items due for check"
            );
        }
        Ok(claimed)
    }

    /// Seeds the last-check row for a key so the item is immediately due.
    /// Existing rows are left untouched.
    pub fn seed(&self, conn: &Connection, key: &str) -> RepoResult<()> {
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {table} ({key}, last_checked_at) VALUES (?1, ?2)",
                key = self.key,
                table = self.table,
            ),
            params![key, INITIAL_LAST_CHECKED_MS],
        )?;
        Ok(())
    }

    /// Removes the last-check row for a key.
    pub fn remove(&self, conn: &Connection, key: &str) -> RepoResult<()> {
        conn.execute(
            &format!(
                "DELETE FROM {table} WHERE {key} = ?1",
                key = self.key,
                table = self.table,
            ),
            params![key],
        )?;
        Ok(())
    }
}
