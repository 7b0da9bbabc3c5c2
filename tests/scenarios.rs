//! End-to-end walkthroughs of the control API.

mod common;

use common::*;
use std::str::FromStr;
use tenantry::{LifecycleState, MigrationStatus, TenantId};

#[tokio::test]
async fn test_create_then_migrate_three_steps() {
    let h = harness(3, Some(0));

    let response = h
        .router
        .route(post("/tenants", serde_json::json!({"name": "Acme", "subdomain": "acme"})))
        .await;
    assert_eq!(response.status, 201);
    let created = body(&response);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["isActive"], true);
    assert_eq!(created["migrationVersion"], 0);

    let id = TenantId::from_str(created["id"].as_str().unwrap()).unwrap();
    wait_until(&h.control, &id, |t| t.state == LifecycleState::Migrated).await;

    let response = h
        .router
        .route(post(format!("/tenants/{}/migrations", id), serde_json::json!({})))
        .await;
    assert_eq!(response.status, 200);
    let report = body(&response);
    assert_eq!(report["migrationVersion"], 3);
    assert_eq!(report["migrationStatus"], "applied");

    let tenant = body(&h.router.route(get(format!("/tenants/{}", id))).await);
    assert_eq!(tenant["migrationVersion"], 3);
    assert_eq!(tenant["migrationStatus"], "applied");
    assert_eq!(h.engine.ledger(&database_of(&id)).len(), 3);
}

#[tokio::test]
async fn test_simultaneous_creates_yield_one_tenant() {
    let h = harness(1, None);
    let request = || post("/tenants", serde_json::json!({"name": "Beta", "subdomain": "beta"}));

    let (a, b) = tokio::join!(h.router.route(request()), h.router.route(request()));
    let mut statuses = vec![a.status, b.status];
    statuses.sort();
    assert_eq!(statuses, vec![201, 409]);

    let winner = if a.status == 201 { body(&a) } else { body(&b) };
    let id = TenantId::from_str(winner["id"].as_str().unwrap()).unwrap();
    wait_until(&h.control, &id, |t| t.state == LifecycleState::Migrated).await;

    assert_eq!(h.engine.database_count(), 1);
    assert!(h.engine.has_database(&database_of(&id)));
}

#[tokio::test]
async fn test_failed_step_is_isolated_to_one_tenant() {
    let h = harness(5, Some(0));

    let gamma = h.control.create_tenant("Gamma", "gamma").await.unwrap();
    let delta = h.control.create_tenant("Delta", "delta").await.unwrap();
    wait_until(&h.control, &gamma.id, |t| t.state == LifecycleState::Migrated).await;
    wait_until(&h.control, &delta.id, |t| t.state == LifecycleState::Migrated).await;

    h.engine.fail_step(&database_of(&gamma.id), 2, "syntax error at or near \"TABEL\"");

    let (g, d) = tokio::join!(
        h.router.route(post(format!("/tenants/{}/migrations", gamma.id), serde_json::json!({}))),
        h.router.route(post(format!("/tenants/{}/migrations", delta.id), serde_json::json!({}))),
    );
    assert_eq!(g.status, 200);
    assert_eq!(d.status, 200);

    let gamma = h.control.get(&gamma.id).await.unwrap();
    assert_eq!(gamma.migration_version, 1);
    assert_eq!(gamma.migration_status, MigrationStatus::Failed);
    let failure = gamma.migration_error.expect("failure recorded");
    assert_eq!(failure.step, 2);
    assert!(failure.message.contains("TABEL"));

    let delta = h.control.get(&delta.id).await.unwrap();
    assert_eq!(delta.migration_version, 5);
    assert_eq!(delta.migration_status, MigrationStatus::Applied);

    // gamma keeps serving at version 1
    let resolved = body(&h.router.route(get("/resolve/gamma")).await);
    assert_eq!(resolved["migrationVersion"], 1);
}

#[tokio::test]
async fn test_unknown_subdomain_is_not_found() {
    let h = harness(1, None);

    let response = h.router.route(get("/tenants/by-subdomain/ghost")).await;
    assert_eq!(response.status, 404);
    assert_eq!(body(&response)["error"]["code"], "TENANT_NOT_FOUND");

    let response = h.router.route(get("/resolve/ghost")).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_deactivated_tenant_is_refused_but_keeps_database() {
    let h = harness(2, None);
    let acme = h.control.create_tenant("Acme", "acme").await.unwrap();
    wait_until(&h.control, &acme.id, |t| t.state == LifecycleState::Migrated).await;
    assert_eq!(h.router.route(get("/resolve/acme")).await.status, 200);

    let response = h
        .router
        .route(post(format!("/tenants/{}/deactivate", acme.id), serde_json::json!({})))
        .await;
    assert_eq!(response.status, 200);

    let lookup = h.router.route(get("/tenants/by-subdomain/acme")).await;
    assert_eq!(lookup.status, 200);
    assert_eq!(body(&lookup)["status"], "inactive");

    let resolve = h.router.route(get("/resolve/acme")).await;
    assert_eq!(resolve.status, 403);
    assert_eq!(body(&resolve)["error"]["code"], "TENANT_INACTIVE");

    assert!(h.engine.has_database(&database_of(&acme.id)));

    // the subdomain stays reserved until explicitly released
    let response = h
        .router
        .route(post("/tenants", serde_json::json!({"name": "Squatter", "subdomain": "acme"})))
        .await;
    assert_eq!(response.status, 409);
}

#[tokio::test]
async fn test_database_descriptor_before_and_after_provisioning() {
    let h = harness(1, None);
    let tenant = h.control.registry().reserve("pending", "Pending Inc").await.unwrap();
    let path = format!("/tenants/{}/database", tenant.id);
    let auth = format!("Bearer {}", TOKEN);

    let response = h.router.route(get(path.clone()).with_header("authorization", auth.clone())).await;
    assert_eq!(response.status, 409);
    assert_eq!(body(&response)["error"]["code"], "TENANT_NOT_READY");

    h.control.onboard(&tenant.id).await.unwrap();

    let response = h.router.route(get(path).with_header("authorization", auth)).await;
    assert_eq!(response.status, 200);
    let db = body(&response);
    assert_eq!(db["dbName"], database_of(&tenant.id));
    assert_eq!(db["dbHost"], "localhost");
    assert_eq!(db["dbPort"], 5432);

    let response = h
        .router
        .route(get(format!("/tenants/{}/database", TenantId::new())).with_header("authorization", format!("Bearer {}", TOKEN)))
        .await;
    assert_eq!(response.status, 404);
}
