// Wiring a running control plane from configuration

use crate::{ApiState, Server, router};
use std::path::Path;
use std::sync::Arc;
use tenantry_config::{ConfigError, ControlPlaneConfig, StoreBackend};
use tenantry_events::{
    Backoff, EventBroker, EventPublisher, Outbox, PublisherConfig, RetryPolicy,
};
use tenantry_tenancy::{
    CatalogError, ControlPlane, CryptoError, InMemoryEngine, InMemoryTenantStore, MigrationCatalog,
    MigrationExecutor, ReconciliationSweep, SecretCipher, StorageProvisioner, TenantError, TenantStore,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Reasons the server cannot start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid master key: {0}")]
    MasterKey(#[from] CryptoError),

    #[error("Migration catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Tenant(#[from] TenantError),

    /// Registry store or administrative connection unavailable.
    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("Backend {0} requires the `{1}` feature")]
    FeatureDisabled(&'static str, &'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the server runs: the control plane, its background tasks and
/// the API state.
pub struct Runtime {
    pub control: Arc<ControlPlane>,
    pub publisher: Arc<EventPublisher>,
    pub sweep: Arc<ReconciliationSweep>,
    pub state: Arc<ApiState>,
}

struct Backends {
    store: Arc<dyn TenantStore>,
    outbox: Arc<dyn Outbox>,
    storage: Arc<dyn StorageProvisioner>,
    executor: Arc<dyn MigrationExecutor>,
}

/// Build the runtime without starting anything.
pub async fn build(config: &ControlPlaneConfig) -> Result<Runtime, StartupError> {
    let backends = backends(config).await?;
    let cipher = Arc::new(cipher(config)?);
    let catalog = catalog(&config.migrations_dir)?;
    info!(steps = catalog.len(), latest = catalog.latest(), "Migration catalog loaded");

    let publisher_config = PublisherConfig {
        batch_size: config.outbox_batch_size,
        poll_interval: config.outbox_poll_interval(),
        ..Default::default()
    };
    let publisher = Arc::new(EventPublisher::new(backends.outbox, broker(config), publisher_config));

    let retry = RetryPolicy::new(
        config.retry_max_attempts,
        Backoff::exponential_with_jitter(config.retry_initial_delay()).with_max(config.retry_max_delay()),
    );

    let control = Arc::new(
        ControlPlane::builder()
            .store(backends.store)
            .storage(backends.storage)
            .executor(backends.executor)
            .cipher(cipher)
            .catalog(catalog)
            .baseline_version(config.baseline_version)
            .cache_ttl(config.resolver_cache_ttl())
            .retry(retry)
            .lease_ttl(config.lease_ttl())
            .workers(config.worker_pool_size)
            .base_domain(config.base_domain.clone())
            .outbox_signal(publisher.wake_handle())
            .build()?,
    );

    if config.internal_api_token.is_none() {
        warn!("internal_api_token is not set; credential lookups are disabled");
    }

    let sweep = Arc::new(ReconciliationSweep::new(control.clone(), config.sweep_interval()));
    let state = Arc::new(ApiState::new(control.clone(), config.internal_api_token.clone()));

    Ok(Runtime {
        control,
        publisher,
        sweep,
        state,
    })
}

/// Serve until Ctrl-C, then stop the relay and the sweep.
pub async fn run(config: ControlPlaneConfig) -> Result<(), StartupError> {
    let runtime = build(&config).await?;
    let listener = Server::bind(&config.listen_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = runtime.publisher.clone().spawn(shutdown_rx.clone());
    let sweep = runtime.sweep.clone().spawn(shutdown_rx.clone());

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => warn!(error = %err, "Could not listen for Ctrl-C, shutting down"),
        }
        let _ = signal_tx.send(true);
    });

    let served = Server::new(router(runtime.state.clone()))
        .serve(listener, shutdown_rx)
        .await;

    let _ = shutdown_tx.send(true);
    let _ = relay.await;
    let _ = sweep.await;
    info!("Control plane stopped");

    served.map_err(StartupError::from)
}

fn cipher(config: &ControlPlaneConfig) -> Result<SecretCipher, StartupError> {
    match config.master_key {
        Some(ref key) => Ok(SecretCipher::from_base64(key)?),
        None => {
            warn!("master_key is not set; using an ephemeral key, stored credentials will not survive a restart");
            Ok(SecretCipher::ephemeral())
        }
    }
}

fn catalog(dir: &Path) -> Result<MigrationCatalog, StartupError> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Migrations directory not found, starting with an empty catalog");
        return Ok(MigrationCatalog::default());
    }
    Ok(MigrationCatalog::load_dir(dir)?)
}

#[cfg(feature = "rabbitmq")]
fn broker(config: &ControlPlaneConfig) -> Arc<dyn EventBroker> {
    Arc::new(tenantry_events::RabbitMqBroker::new(
        config.broker_url.clone(),
        config.broker_exchange.clone(),
    ))
}

#[cfg(not(feature = "rabbitmq"))]
fn broker(_config: &ControlPlaneConfig) -> Arc<dyn EventBroker> {
    warn!("Built without the rabbitmq feature; events are delivered to an in-process broker");
    Arc::new(tenantry_events::InMemoryBroker::new())
}

async fn backends(config: &ControlPlaneConfig) -> Result<Backends, StartupError> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store and storage engine; nothing is persisted");
            let store = Arc::new(InMemoryTenantStore::new());
            let engine = Arc::new(InMemoryEngine::new(config.tenant_db_host.clone(), config.tenant_db_port));
            Ok(Backends {
                store: store.clone(),
                outbox: store,
                storage: engine.clone(),
                executor: engine,
            })
        }
        StoreBackend::Postgres => postgres_backends(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn postgres_backends(config: &ControlPlaneConfig) -> Result<Backends, StartupError> {
    use tenantry_tenancy::postgres::{PgMigrationExecutor, PgStorageProvisioner, PgTenantStore};

    let store = PgTenantStore::connect(&config.registry_database_url)
        .await
        .map_err(|e| StartupError::Backend(e.to_string()))?;
    store
        .init_schema()
        .await
        .map_err(|e| StartupError::Backend(e.to_string()))?;
    let store = Arc::new(store);

    let admin: &secrecy::SecretString = config
        .admin_database_url
        .as_ref()
        .ok_or_else(|| ConfigError::Invalid("admin_database_url is required".to_string()))?;
    let storage = PgStorageProvisioner::connect(admin, config.tenant_db_host.clone(), config.tenant_db_port)
        .await
        .map_err(|e| StartupError::Backend(e.to_string()))?;

    info!(host = %config.tenant_db_host, port = config.tenant_db_port, "PostgreSQL backends ready");

    Ok(Backends {
        store: store.clone(),
        outbox: store,
        storage: Arc::new(storage),
        executor: Arc::new(PgMigrationExecutor::new()),
    })
}

#[cfg(not(feature = "postgres"))]
async fn postgres_backends(_config: &ControlPlaneConfig) -> Result<Backends, StartupError> {
    Err(StartupError::FeatureDisabled("postgres", "postgres"))
}
