//! Invariants of the control plane under concurrency and failure.

mod common;

use common::*;
use std::collections::HashSet;
use tenantry::events::EventType;
use tenantry::{EngineOp, LifecycleState, MigrationStatus, TenantError};

#[tokio::test]
async fn test_subdomains_stay_unique_under_contention() {
    let h = harness(1, Some(0));

    let mut tasks = Vec::new();
    for i in 0..20 {
        let registry = h.control.registry().clone();
        let subdomain = if i % 2 == 0 { "shared" } else { "SHARED" };
        tasks.push(tokio::spawn(async move {
            registry.reserve(subdomain, &format!("Contender {}", i)).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) => assert!(matches!(err, TenantError::SubdomainTaken(_))),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_concurrent_provisioning_creates_one_database() {
    let h = harness(1, None);
    let tenant = h.control.registry().reserve("solo", "Solo").await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let provisioner = h.control.provisioner().clone();
        let id = tenant.id;
        tasks.push(tokio::spawn(async move { provisioner.provision(&id).await }));
    }

    let mut descriptors = Vec::new();
    for task in tasks {
        descriptors.push(task.await.unwrap().unwrap());
    }

    assert_eq!(h.engine.create_database_calls(), 1);
    assert_eq!(h.engine.database_count(), 1);
    assert!(descriptors.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_migration_version_is_monotonic_and_committed() {
    let h = harness(6, Some(0));
    let tenant = h.control.registry().reserve("mono", "Mono").await.unwrap();
    h.control.onboard(&tenant.id).await.unwrap();
    let db = database_of(&tenant.id);

    let mut last = 0;
    let mut observe = |version: u32, committed: usize| {
        assert!(version >= last, "version went from {} to {}", last, version);
        assert!(version as usize <= committed);
        last = version;
    };

    h.control.migrate(&tenant.id, Some(2)).await.unwrap();
    observe(h.control.get(&tenant.id).await.unwrap().migration_version, h.engine.ledger(&db).len());

    h.engine.fail_step(&db, 4, "lock timeout");
    h.control.migrate(&tenant.id, None).await.unwrap();
    observe(h.control.get(&tenant.id).await.unwrap().migration_version, h.engine.ledger(&db).len());

    h.engine.clear_step_failure(&db, 4);
    h.control.migrate(&tenant.id, None).await.unwrap();
    let tenant = h.control.get(&tenant.id).await.unwrap();
    observe(tenant.migration_version, h.engine.ledger(&db).len());

    assert_eq!(tenant.migration_version, 6);
    assert_eq!(tenant.migration_status, MigrationStatus::Applied);
}

#[tokio::test]
async fn test_rerunning_applied_migrations_changes_nothing() {
    let h = harness(3, None);
    let tenant = h.control.registry().reserve("rerun", "Rerun").await.unwrap();
    h.control.onboard(&tenant.id).await.unwrap();
    let db = database_of(&tenant.id);
    let before = h.engine.ledger(&db);

    let report = h.control.migrate(&tenant.id, None).await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.version, 3);
    assert_eq!(report.status, MigrationStatus::Applied);

    let report = h.control.migrate(&tenant.id, Some(3)).await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(h.engine.ledger(&db), before);
}

#[tokio::test]
async fn test_migrate_all_isolates_failures() {
    let h = harness(3, Some(0));
    let mut ids = Vec::new();
    for name in ["one", "two", "three", "four"] {
        let tenant = h.control.registry().reserve(name, name).await.unwrap();
        h.control.onboard(&tenant.id).await.unwrap();
        ids.push(tenant.id);
    }
    h.engine.fail_step(&database_of(&ids[1]), 1, "disk full");

    let results = h.control.coordinator().migrate_all(None).await.unwrap();
    assert_eq!(results.len(), 4);

    for (id, result) in results {
        let report = result.unwrap();
        if id == ids[1] {
            assert_eq!(report.status, MigrationStatus::Failed);
            assert_eq!(report.version, 0);
        } else {
            assert_eq!(report.status, MigrationStatus::Applied);
            assert_eq!(report.version, 3);
        }
    }
}

#[tokio::test]
async fn test_resolution_outcomes() {
    let h = harness(1, None);

    assert!(matches!(h.control.resolve("nobody").await, Err(TenantError::NotFound(_))));

    let pending = h.control.registry().reserve("later", "Later").await.unwrap();
    assert!(matches!(
        h.control.resolve("later").await,
        Err(TenantError::NotReady { .. })
    ));

    h.control.onboard(&pending.id).await.unwrap();
    let resolved = h.control.resolve("LATER").await.unwrap();
    assert_eq!(resolved.tenant_id, pending.id);
    assert_eq!(resolved.descriptor, h.control.database(&pending.id).await.unwrap());

    h.control.deactivate(&pending.id).await.unwrap();
    assert!(matches!(h.control.resolve("later").await, Err(TenantError::Inactive(_))));
}

#[tokio::test]
async fn test_permanent_provisioning_failure_is_contained() {
    let h = harness(1, None);
    h.engine.set_database_quota(1);

    let first = h.control.registry().reserve("first", "First").await.unwrap();
    let second = h.control.registry().reserve("second", "Second").await.unwrap();
    h.control.onboard(&first.id).await.unwrap();

    let err = h.control.onboard(&second.id).await.unwrap_err();
    assert!(matches!(err, TenantError::PermanentProvisioning(_)));

    let second = h.control.get(&second.id).await.unwrap();
    assert_eq!(second.state, LifecycleState::Failed);
    assert!(second.failure_reason.is_some());

    let first = h.control.get(&first.id).await.unwrap();
    assert_eq!(first.state, LifecycleState::Migrated);
    assert!(h.control.resolve("first").await.is_ok());
}

#[tokio::test]
async fn test_transient_errors_are_absorbed() {
    let h = harness(1, None);
    h.engine.fail_next(EngineOp::CreateDatabase, 2);
    h.engine.fail_next(EngineOp::Connect, 1);

    let tenant = h.control.registry().reserve("flaky", "Flaky").await.unwrap();
    let onboarded = h.control.onboard(&tenant.id).await.unwrap();

    assert_eq!(onboarded.state, LifecycleState::Migrated);
    assert_eq!(h.engine.database_count(), 1);
}

#[tokio::test]
async fn test_events_survive_broker_outage_in_order() {
    let h = harness(2, None);
    h.broker.set_available(false);

    let tenant = h.control.registry().reserve("events", "Events").await.unwrap();
    h.control.onboard(&tenant.id).await.unwrap();
    h.control.deactivate(&tenant.id).await.unwrap();
    h.control.reactivate(&tenant.id).await.unwrap();

    // transitions committed regardless of the outage
    assert!(h.control.get(&tenant.id).await.unwrap().is_active);

    let stats = h.publisher.relay_once().await.unwrap();
    assert_eq!(stats.delivered, 0);
    assert!(h.broker.published().is_empty());

    h.broker.set_available(true);
    for _ in 0..10 {
        h.publisher.relay_once().await.unwrap();
    }

    let published = h.broker.published_for(&tenant.id.to_string());
    let sequences: Vec<u64> = published.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=published.len() as u64).collect();
    assert_eq!(sequences, expected);

    let types: Vec<EventType> = published.iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::TenantCreated));
    assert_eq!(types.get(1), Some(&EventType::TenantProvisioned));
    assert!(types.contains(&EventType::TenantMigrated));
    assert_eq!(
        &types[types.len() - 2..],
        &[EventType::TenantDeactivated, EventType::TenantReactivated]
    );

    let keys: HashSet<String> = published.iter().map(|e| e.dedup_key()).collect();
    assert_eq!(keys.len(), published.len());
}

#[tokio::test]
async fn test_cross_tenant_credentials_differ() {
    let h = harness(1, None);
    let a = h.control.registry().reserve("alpha", "Alpha").await.unwrap();
    let b = h.control.registry().reserve("bravo", "Bravo").await.unwrap();
    h.control.onboard(&a.id).await.unwrap();
    h.control.onboard(&b.id).await.unwrap();

    let da = h.control.database(&a.id).await.unwrap();
    let db = h.control.database(&b.id).await.unwrap();
    assert_ne!(da.db_name, db.db_name);
    assert_ne!(da.db_user, db.db_user);
    assert_ne!(da, db);
}
