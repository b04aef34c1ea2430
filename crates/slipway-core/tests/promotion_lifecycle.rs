//! End-to-end promotion lifecycle tests against an in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use slipway_core::artifact::{ArtifactKind, ArtifactStatus, DeliveryArtifact, TagVersionStrategy};
use slipway_core::config::{DeliveryConfig, Environment};
use slipway_core::store::{
    Database, EnvironmentArtifactVersions, PromotionBuckets, SqliteArtifactRepository,
};
use slipway_core::{ManualClock, RepositoryError};

const DEV8: &str = "keeldemo-0.0.1~dev.8-h8.41595c4";
const DEV9: &str = "keeldemo-0.0.1~dev.9-h9.3d2c8ff";
const DEV10: &str = "keeldemo-0.0.1~dev.10-h10.1d2d542";

fn setup() -> (SqliteArtifactRepository, ManualClock) {
    let db = Database::in_memory().expect("in-memory database");
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let repository = SqliteArtifactRepository::new(&db, Arc::new(clock.clone()));
    (repository, clock)
}

fn keeldemo() -> DeliveryArtifact {
    DeliveryArtifact::debian("keeldemo", [ArtifactStatus::Snapshot])
}

fn manifest() -> DeliveryConfig {
    DeliveryConfig {
        name: "my-manifest".to_string(),
        application: "keeldemo".to_string(),
        artifacts: vec![keeldemo()],
        environments: vec![Environment::new("test")],
    }
}

fn ingest_shuffled(repository: &SqliteArtifactRepository, artifact: &DeliveryArtifact) {
    for version in [DEV9, DEV8, DEV10] {
        assert!(repository
            .store_version(artifact, version, ArtifactStatus::Snapshot)
            .expect("store version"));
    }
}

fn buckets_for<'a>(
    rollups: &'a [EnvironmentArtifactVersions],
    environment: &str,
    artifact_name: &str,
) -> &'a PromotionBuckets {
    &rollups
        .iter()
        .find(|entry| entry.environment == environment && entry.artifact_name == artifact_name)
        .expect("roll-up entry")
        .versions
}

#[test]
fn test_versions_sort_newest_first_regardless_of_ingest_order() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    assert!(repository.register(&artifact).expect("register"));
    ingest_shuffled(&repository, &artifact);

    let versions = repository.versions(&artifact, None).expect("versions");
    assert_eq!(versions, vec![DEV10, DEV9, DEV8]);
}

#[test]
fn test_storing_a_version_of_an_unregistered_artifact_fails() {
    let (repository, _clock) = setup();
    let err = repository
        .store_version(&keeldemo(), DEV8, ArtifactStatus::Snapshot)
        .expect_err("unregistered artifact");
    assert!(matches!(err, RepositoryError::NoSuchArtifact { .. }));
}

#[test]
fn test_registration_and_version_storage_are_idempotent() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    assert!(repository.register(&artifact).expect("first register"));
    assert!(!repository.register(&artifact).expect("second register"));

    assert!(repository
        .store_version(&artifact, DEV8, ArtifactStatus::Snapshot)
        .expect("first store"));
    assert!(!repository
        .store_version(&artifact, DEV8, ArtifactStatus::Snapshot)
        .expect("second store"));
}

#[test]
fn test_version_status_is_first_write_wins() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    assert!(repository
        .store_version(&artifact, DEV8, ArtifactStatus::Snapshot)
        .expect("first store"));
    assert!(!repository
        .store_version(&artifact, DEV8, ArtifactStatus::Release)
        .expect("re-store with different status"));

    // The original status stands: a release-only filter sees nothing.
    let releases = repository
        .versions(&artifact, Some(&BTreeSet::from([ArtifactStatus::Release])))
        .expect("release versions");
    assert!(releases.is_empty());

    let snapshots = repository
        .versions(&artifact, Some(&BTreeSet::from([ArtifactStatus::Snapshot])))
        .expect("snapshot versions");
    assert_eq!(snapshots, vec![DEV8]);
}

#[test]
fn test_unpromoted_artifact_shows_all_versions_pending() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    let rollups = repository
        .versions_by_environment(&manifest())
        .expect("roll-ups");
    let buckets = buckets_for(&rollups, "test", "keeldemo");
    assert_eq!(buckets.pending, vec![DEV10, DEV9, DEV8]);
    assert_eq!(buckets.current, None);
    assert_eq!(buckets.deploying, None);
    assert!(buckets.previous.is_empty());
}

#[test]
fn test_approval_and_deploying_transition() {
    let (repository, clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    assert!(repository
        .approve_version_for("my-manifest", &artifact, DEV8, "test")
        .expect("approve"));
    clock.advance(Duration::minutes(1));
    repository
        .mark_as_deploying_to("my-manifest", &artifact, DEV8, "test")
        .expect("mark deploying");

    assert_eq!(
        repository
            .latest_version_approved_in("my-manifest", &artifact, "test", None)
            .expect("latest approved"),
        Some(DEV8.to_string())
    );
    assert!(!repository
        .was_successfully_deployed_to("my-manifest", &artifact, DEV8, "test")
        .expect("deployed query"));

    let rollups = repository
        .versions_by_environment(&manifest())
        .expect("roll-ups");
    let buckets = buckets_for(&rollups, "test", "keeldemo");
    assert_eq!(buckets.pending, vec![DEV10, DEV9]);
    assert_eq!(buckets.deploying.as_deref(), Some(DEV8));
    assert_eq!(buckets.current, None);
}

#[test]
fn test_successive_deployments_supersede_the_current_version() {
    let (repository, clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    for version in [DEV8, DEV9] {
        assert!(repository
            .approve_version_for("my-manifest", &artifact, version, "test")
            .expect("approve"));
        clock.advance(Duration::minutes(1));
        repository
            .mark_as_deploying_to("my-manifest", &artifact, version, "test")
            .expect("mark deploying");
        clock.advance(Duration::minutes(5));
        repository
            .mark_as_successfully_deployed_to("my-manifest", &artifact, version, "test")
            .expect("mark deployed");
    }

    let rollups = repository
        .versions_by_environment(&manifest())
        .expect("roll-ups");
    let buckets = buckets_for(&rollups, "test", "keeldemo");
    assert_eq!(buckets.pending, vec![DEV10]);
    assert_eq!(buckets.current.as_deref(), Some(DEV9));
    assert_eq!(buckets.deploying, None);
    assert_eq!(buckets.previous, vec![DEV8]);

    for version in [DEV8, DEV9] {
        assert!(repository
            .was_successfully_deployed_to("my-manifest", &artifact, version, "test")
            .expect("deployed query"));
    }
}

#[test]
fn test_approval_is_monotonic_and_idempotent() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    assert!(repository
        .approve_version_for("my-manifest", &artifact, DEV8, "test")
        .expect("first approval"));
    assert!(!repository
        .approve_version_for("my-manifest", &artifact, DEV8, "test")
        .expect("second approval"));
    assert!(repository
        .is_approved_for("my-manifest", &artifact, DEV8, "test")
        .expect("approved query"));
}

#[test]
fn test_approving_a_version_of_an_unregistered_artifact_fails() {
    let (repository, _clock) = setup();
    let err = repository
        .approve_version_for("my-manifest", &keeldemo(), DEV8, "test")
        .expect_err("unregistered artifact");
    assert!(matches!(err, RepositoryError::NoSuchArtifact { .. }));
}

#[test]
fn test_deploying_transition_requires_approval() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    // Never approved: the transition is a no-op.
    repository
        .mark_as_deploying_to("my-manifest", &artifact, DEV8, "test")
        .expect("mark deploying");
    let rollups = repository
        .versions_by_environment(&manifest())
        .expect("roll-ups");
    let buckets = buckets_for(&rollups, "test", "keeldemo");
    assert_eq!(buckets.deploying, None);
    assert_eq!(buckets.pending, vec![DEV10, DEV9, DEV8]);
}

#[test]
fn test_at_most_one_version_is_deploying() {
    let (repository, clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    for version in [DEV8, DEV9] {
        repository
            .approve_version_for("my-manifest", &artifact, version, "test")
            .expect("approve");
    }
    repository
        .mark_as_deploying_to("my-manifest", &artifact, DEV8, "test")
        .expect("deploying dev.8");
    clock.advance(Duration::minutes(1));
    repository
        .mark_as_deploying_to("my-manifest", &artifact, DEV9, "test")
        .expect("deploying dev.9");

    let rollups = repository
        .versions_by_environment(&manifest())
        .expect("roll-ups");
    let buckets = buckets_for(&rollups, "test", "keeldemo");
    assert_eq!(buckets.deploying.as_deref(), Some(DEV9));
    assert!(buckets.pending.contains(&DEV8.to_string()));
}

#[test]
fn test_latest_version_approved_in_respects_status_filter() {
    let (repository, _clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    for version in [DEV8, DEV9] {
        repository
            .approve_version_for("my-manifest", &artifact, version, "test")
            .expect("approve");
    }

    assert_eq!(
        repository
            .latest_version_approved_in("my-manifest", &artifact, "test", None)
            .expect("latest approved"),
        Some(DEV9.to_string())
    );
    assert_eq!(
        repository
            .latest_version_approved_in(
                "my-manifest",
                &artifact,
                "test",
                Some(&BTreeSet::from([ArtifactStatus::Release]))
            )
            .expect("latest release"),
        None
    );
}

#[test]
fn test_get_all_filters_by_kind() {
    let (repository, _clock) = setup();
    let foo = DeliveryArtifact::debian("foo", [ArtifactStatus::Snapshot]);
    let bar = DeliveryArtifact::debian("bar", []);
    let baz = DeliveryArtifact::docker("baz", TagVersionStrategy::IncreasingTag);
    for artifact in [&foo, &bar, &baz] {
        assert!(repository.register(artifact).expect("register"));
    }
    repository
        .store_version(&foo, "foo-1.0.0-h3.18b6e02", ArtifactStatus::Snapshot)
        .expect("store foo 1.0.0");
    repository
        .store_version(&foo, "foo-1.0.1-h4.b4cae8a", ArtifactStatus::Snapshot)
        .expect("store foo 1.0.1");
    repository
        .store_version(&baz, "42", ArtifactStatus::Final)
        .expect("store baz 42");

    assert_eq!(repository.get_all(None).expect("all").len(), 3);
    assert_eq!(
        repository
            .get_all(Some(ArtifactKind::Docker))
            .expect("docker")
            .len(),
        1
    );
    assert_eq!(
        repository
            .get_all(Some(ArtifactKind::Debian))
            .expect("debian")
            .len(),
        2
    );
}

#[test]
fn test_promotions_are_scoped_per_environment() {
    let (repository, clock) = setup();
    let artifact = keeldemo();
    repository.register(&artifact).expect("register");
    ingest_shuffled(&repository, &artifact);

    let mut config = manifest();
    config.environments.push(Environment::new("staging"));

    repository
        .approve_version_for("my-manifest", &artifact, DEV8, "test")
        .expect("approve in test");
    clock.advance(Duration::minutes(1));
    repository
        .mark_as_deploying_to("my-manifest", &artifact, DEV8, "test")
        .expect("deploying in test");

    let rollups = repository.versions_by_environment(&config).expect("roll-ups");
    assert_eq!(
        buckets_for(&rollups, "test", "keeldemo").deploying.as_deref(),
        Some(DEV8)
    );
    assert_eq!(buckets_for(&rollups, "staging", "keeldemo").deploying, None);
    assert_eq!(
        buckets_for(&rollups, "staging", "keeldemo").pending,
        vec![DEV10, DEV9, DEV8]
    );
}
