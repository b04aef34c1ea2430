//! Tests for the store layer internals.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use super::check::{CheckQueue, DELIVERY_CONFIG_CHECKS, RESOURCE_CHECKS, INITIAL_LAST_CHECKED_MS};
use super::*;
use crate::artifact::{ArtifactStatus, DeliveryArtifact};
use crate::clock::{Clock, ManualClock};
use crate::error::RepositoryError;

fn manual_clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
}

#[test]
fn test_open_creates_schema_on_disk() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("slipway.db");
    let db = Database::open(&path).expect("open database");

    let clock = Arc::new(manual_clock());
    let artifacts = SqliteArtifactRepository::new(&db, clock);
    assert!(!artifacts.is_registered("fnord", crate::artifact::ArtifactKind::Debian).unwrap());
}

#[test]
fn test_reopen_preserves_data() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("slipway.db");
    let clock: Arc<dyn Clock> = Arc::new(manual_clock());

    {
        let db = Database::open(&path).expect("open database");
        let artifacts = SqliteArtifactRepository::new(&db, Arc::clone(&clock));
        assert!(artifacts
            .register(&DeliveryArtifact::debian("fnord", [ArtifactStatus::Snapshot]))
            .unwrap());
    }

    let db = Database::open(&path).expect("reopen database");
    let artifacts = SqliteArtifactRepository::new(&db, clock);
    assert!(artifacts
        .is_registered("fnord", crate::artifact::ArtifactKind::Debian)
        .unwrap());
}

#[test]
fn test_seed_makes_key_immediately_due() {
    let db = Database::in_memory().expect("in-memory database");
    let clock = manual_clock();
    let mut conn = db.lock();

    RESOURCE_CHECKS.seed(&conn, "01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
    let claimed = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::hours(1), 10)
        .unwrap();
    assert_eq!(claimed, vec!["01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string()]);
}

#[test]
fn test_seed_leaves_existing_rows_untouched() {
    let db = Database::in_memory().expect("in-memory database");
    let clock = manual_clock();
    let mut conn = db.lock();

    RESOURCE_CHECKS.seed(&conn, "a").unwrap();
    let claimed = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::zero(), 10)
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Re-seeding after a claim must not rewind the timestamp.
    RESOURCE_CHECKS.seed(&conn, "a").unwrap();
    let claimed = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::hours(1), 10)
        .unwrap();
    assert!(claimed.is_empty());
}

#[test]
fn test_claim_orders_oldest_first_with_key_tiebreak() {
    let db = Database::in_memory().expect("in-memory database");
    let clock = manual_clock();
    let mut conn = db.lock();

    // Same seeded timestamp for all three: order falls back to the key.
    for key in ["charlie", "alpha", "bravo"] {
        DELIVERY_CONFIG_CHECKS.seed(&conn, key).unwrap();
    }
    let claimed = DELIVERY_CONFIG_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::zero(), 10)
        .unwrap();
    assert_eq!(claimed, vec!["alpha", "bravo", "charlie"]);
}

#[test]
fn test_claim_respects_limit() {
    let db = Database::in_memory().expect("in-memory database");
    let clock = manual_clock();
    let mut conn = db.lock();

    for key in ["a", "b", "c"] {
        RESOURCE_CHECKS.seed(&conn, key).unwrap();
    }
    let first = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::zero(), 2)
        .unwrap();
    assert_eq!(first, vec!["a", "b"]);

    // The unclaimed key is still due; the claimed two are not.
    let second = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::hours(1), 10)
        .unwrap();
    assert_eq!(second, vec!["c"]);
}

#[test]
fn test_claim_rejects_negative_window() {
    let db = Database::in_memory().expect("in-memory database");
    let clock = manual_clock();
    let mut conn = db.lock();

    let err = RESOURCE_CHECKS
        .claim_due(&mut conn, clock.now(), Duration::seconds(-1), 10)
        .expect_err("negative staleness window");
    assert!(matches!(err, RepositoryError::InvalidArgument { .. }));
}

#[test]
fn test_initial_timestamp_is_epoch_plus_one_second() {
    let db = Database::in_memory().expect("in-memory database");
    let conn = db.lock();

    RESOURCE_CHECKS.seed(&conn, "a").unwrap();
    let stored: i64 = conn
        .query_row(
            "SELECT last_checked_at FROM resource_last_checked WHERE resource_uid = 'a'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stored, INITIAL_LAST_CHECKED_MS);
}

#[test]
fn test_queue_definitions_point_at_distinct_tables() {
    let CheckQueue { table: resources, .. } = RESOURCE_CHECKS;
    let CheckQueue { table: configs, .. } = DELIVERY_CONFIG_CHECKS;
    assert_ne!(resources, configs);
}
