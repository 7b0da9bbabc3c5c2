//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tenantry::api::{HttpRequest, HttpResponse, Router};
use tenantry::events::{Backoff, InMemoryBroker, PublisherConfig};
use tenantry::{
    ApiState, ControlPlane, EventPublisher, InMemoryEngine, InMemoryTenantStore, MigrationCatalog,
    MigrationStep, PhysicalNames, RetryPolicy, SecretCipher, Tenant, TenantId, router,
};

pub const TOKEN: &str = "test-internal-token";

pub struct Harness {
    pub control: Arc<ControlPlane>,
    pub engine: Arc<InMemoryEngine>,
    pub broker: Arc<InMemoryBroker>,
    pub publisher: Arc<EventPublisher>,
    pub router: Router,
}

pub fn catalog(steps: u32) -> MigrationCatalog {
    MigrationCatalog::new(
        (1..=steps)
            .map(|v| {
                MigrationStep::new(
                    v,
                    format!("step_{}", v),
                    format!("CREATE TABLE IF NOT EXISTS t{} (id BIGINT PRIMARY KEY);", v),
                )
            })
            .collect(),
    )
    .unwrap()
}

/// In-memory control plane with `steps` migrations, onboarding to `baseline`.
pub fn harness(steps: u32, baseline: Option<u32>) -> Harness {
    let store = Arc::new(InMemoryTenantStore::new());
    let engine = Arc::new(InMemoryEngine::default());
    let broker = Arc::new(InMemoryBroker::new());

    let publisher = Arc::new(EventPublisher::new(
        store.clone(),
        broker.clone(),
        PublisherConfig {
            backoff: Backoff::None,
            ..Default::default()
        },
    ));

    let control = Arc::new(
        ControlPlane::builder()
            .store(store)
            .storage(engine.clone())
            .executor(engine.clone())
            .cipher(Arc::new(SecretCipher::ephemeral()))
            .catalog(catalog(steps))
            .baseline_version(baseline)
            .retry(RetryPolicy::immediate(3))
            .lease_ttl(Duration::from_secs(60))
            .outbox_signal(publisher.wake_handle())
            .build()
            .unwrap(),
    );

    let state = Arc::new(ApiState::new(control.clone(), Some(SecretString::from(TOKEN))));

    Harness {
        router: router(state),
        control,
        engine,
        broker,
        publisher,
    }
}

pub fn database_of(id: &TenantId) -> String {
    PhysicalNames::for_tenant(id).database
}

pub fn get(path: impl Into<String>) -> HttpRequest {
    HttpRequest::new("GET", path)
}

pub fn post(path: impl Into<String>, body: serde_json::Value) -> HttpRequest {
    HttpRequest::new("POST", path).with_body(body.to_string())
}

pub fn body(response: &HttpResponse) -> serde_json::Value {
    response.json().unwrap()
}

/// Poll until `done` holds for the tenant.
pub async fn wait_until<F>(control: &ControlPlane, id: &TenantId, done: F) -> Tenant
where
    F: Fn(&Tenant) -> bool,
{
    for _ in 0..400 {
        let tenant = control.get(id).await.unwrap();
        if done(&tenant) {
            return tenant;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("tenant {} never reached the expected state", id);
}
