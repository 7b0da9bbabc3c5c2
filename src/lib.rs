// Tenantry - a control plane for database-per-tenant SaaS
//
// This crate re-exports the workspace members under one roof: the tenant
// model and its components, lifecycle events, configuration, logging and
// the HTTP control API.

pub use tenantry_tenancy::*;

pub use tenantry_api as api;
pub use tenantry_config as config;
pub use tenantry_events as events;
pub use tenantry_log as log;

pub use tenantry_api::{ApiState, Server, router};
pub use tenantry_config::{ConfigManager, ControlPlaneConfig, StoreBackend};
pub use tenantry_events::{
    EventBroker, EventEnvelope, EventPublisher, EventType, InMemoryBroker, PublisherConfig, RetryPolicy,
};

#[cfg(feature = "rabbitmq")]
pub use tenantry_events::RabbitMqBroker;

// Prelude for common imports
pub mod prelude {
    pub use crate::api::{ApiState, HttpRequest, HttpResponse, Router};
    pub use crate::config::ControlPlaneConfig;
    pub use crate::events::{EventBroker, EventPublisher, EventType, InMemoryBroker, RetryPolicy};
    pub use tenantry_tenancy::prelude::*;
    pub use tenantry_tenancy::{
        InMemoryEngine, InMemoryTenantStore, MigrationCatalog, MigrationStep, ReconciliationSweep, SecretCipher,
    };
}
