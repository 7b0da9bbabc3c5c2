// Control API routes and handlers

use crate::dto::{
    CreateTenantRequest, DatabaseView, MigrateRequest, MigrationView, ResolveView, TenantView,
};
use crate::{ApiError, HttpRequest, HttpResponse, Router};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tenantry_tenancy::{ControlPlane, LifecycleState, TenantError, TenantFilter, TenantId};
use tracing::{info, warn};

/// Shared state behind every handler.
pub struct ApiState {
    pub control: Arc<ControlPlane>,
    /// Bearer token guarding `/tenants/:id/database`. Without one the route
    /// refuses every caller.
    pub internal_token: Option<SecretString>,
}

impl ApiState {
    pub fn new(control: Arc<ControlPlane>, internal_token: Option<SecretString>) -> Self {
        Self {
            control,
            internal_token,
        }
    }

    fn authorize(&self, req: &HttpRequest) -> Result<(), ApiError> {
        let presented = req.bearer_token().ok_or(ApiError::Unauthorized)?;
        let expected = self.internal_token.as_ref().ok_or(ApiError::Forbidden)?;

        // Fixed-length digests keep the comparison independent of token length.
        let presented = Sha256::digest(presented.as_bytes());
        let expected = Sha256::digest(expected.expose_secret().as_bytes());
        if presented != expected {
            return Err(ApiError::Forbidden);
        }
        Ok(())
    }
}

/// Build the full route table.
///
/// Subdomain routes are registered before the `:id` routes of the same depth
/// so that a tenant id can never shadow them.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .get("/", |_req| banner())
        .get("/health", bind(&state, health))
        .get("/tenants", bind(&state, list_tenants))
        .post("/tenants", bind(&state, create_tenant))
        .get("/tenants/by-subdomain/:subdomain", bind(&state, get_by_subdomain))
        .get("/tenants/subdomain/:subdomain", bind(&state, get_by_subdomain))
        .get("/tenants/:id", bind(&state, get_tenant))
        .get("/tenants/:id/database", bind(&state, get_database))
        .post("/tenants/:id/migrations", bind(&state, migrate))
        .post("/tenants/:id/deactivate", bind(&state, deactivate))
        .post("/tenants/:id/reactivate", bind(&state, reactivate))
        .post("/tenants/:id/release-subdomain", bind(&state, release_subdomain))
        .post("/tenants/:id/retry-provisioning", bind(&state, retry_provisioning))
        .get("/resolve/:subdomain", bind(&state, resolve))
}

fn bind<F, Fut>(state: &Arc<ApiState>, handler: F) -> impl Fn(HttpRequest) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<ApiState>, HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
{
    let state = Arc::clone(state);
    move |req| handler(Arc::clone(&state), req)
}

fn tenant_id(req: &HttpRequest) -> Result<TenantId, ApiError> {
    let raw = req
        .param("id")
        .ok_or_else(|| ApiError::BadRequest("missing tenant id".into()))?;
    Ok(TenantId::from_str(raw)?)
}

fn subdomain(req: &HttpRequest) -> Result<&str, ApiError> {
    req.param("subdomain")
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest("missing subdomain".into()))
}

fn tenant_response(status: u16, tenant: &tenantry_tenancy::Tenant) -> Result<HttpResponse, ApiError> {
    HttpResponse::new(status).with_json(&TenantView::from(tenant))
}

async fn banner() -> Result<HttpResponse, ApiError> {
    HttpResponse::ok().with_json(&serde_json::json!({
        "service": "tenantry",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}

async fn health(state: Arc<ApiState>, _req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let probe = TenantFilter {
        limit: Some(1),
        ..Default::default()
    };
    match state.control.registry().list(&probe).await {
        Ok(_) => HttpResponse::ok().with_json(&serde_json::json!({
            "status": "ok",
            "store": "ok",
        })),
        Err(err) => {
            warn!(error = %err, "Health check could not reach the store");
            HttpResponse::new(503).with_json(&serde_json::json!({
                "status": "degraded",
                "store": "unavailable",
            }))
        }
    }
}

async fn list_tenants(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let mut filter = TenantFilter::default();

    if let Some(states) = req.query("state") {
        for raw in states.split(',').filter(|s| !s.is_empty()) {
            let parsed = LifecycleState::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown state: {}", raw)))?;
            filter.states.push(parsed);
        }
    }
    if let Some(active) = req.query("active") {
        let active = active
            .parse::<bool>()
            .map_err(|_| ApiError::BadRequest(format!("active must be true or false, got {}", active)))?;
        filter.active = Some(active);
    }
    if let Some(limit) = req.query("limit") {
        let limit = limit
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest(format!("invalid limit: {}", limit)))?;
        filter.limit = Some(limit);
    }

    let tenants = state.control.registry().list(&filter).await?;
    let views: Vec<TenantView> = tenants.iter().map(TenantView::from).collect();
    HttpResponse::ok().with_json(&views)
}

async fn create_tenant(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let body: CreateTenantRequest = req.json()?;
    let tenant = state.control.create_tenant(&body.name, &body.subdomain).await?;
    info!(tenant_id = %tenant.id, subdomain = %tenant.subdomain, "Tenant reserved via API");

    Ok(tenant_response(201, &tenant)?.with_header("location", format!("/tenants/{}", tenant.id)))
}

async fn get_tenant(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let tenant = state.control.get(&id).await?;
    tenant_response(200, &tenant)
}

/// Inactive tenants are returned with `status: "inactive"`, not as an error.
async fn get_by_subdomain(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let tenant = state.control.get_by_subdomain(subdomain(&req)?).await?;
    tenant_response(200, &tenant)
}

async fn get_database(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    if let Err(err) = state.authorize(&req) {
        warn!(path = %req.path, code = err.code(), "Rejected credential request");
        return Err(err);
    }

    let id = tenant_id(&req)?;
    let descriptor = state.control.database(&id).await?;
    info!(tenant_id = %id, "Connection descriptor served");

    HttpResponse::ok()
        .with_json(&DatabaseView::new(id.to_string(), &descriptor))
        .map(|response| response.with_header("cache-control", "no-store"))
}

async fn migrate(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let body: MigrateRequest = req.json_or_default()?;
    let report = state.control.migrate(&id, body.target_version).await?;
    HttpResponse::ok().with_json(&MigrationView::from(report))
}

async fn deactivate(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let tenant = state.control.deactivate(&id).await?;
    tenant_response(200, &tenant)
}

async fn reactivate(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let tenant = state.control.reactivate(&id).await?;
    tenant_response(200, &tenant)
}

async fn release_subdomain(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let tenant = state.control.release_subdomain(&id).await?;
    tenant_response(200, &tenant)
}

async fn retry_provisioning(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let id = tenant_id(&req)?;
    let tenant = state.control.registry().retry_provisioning(&id).await?;

    let control = Arc::clone(&state.control);
    tokio::spawn(async move {
        if let Err(err) = control.onboard(&id).await {
            warn!(tenant_id = %id, code = err.code(), error = %err, "Retried onboarding did not complete");
        }
    });

    tenant_response(202, &tenant)
}

/// Gateway lookup: 404 unknown, 403 inactive, 409 not ready.
async fn resolve(state: Arc<ApiState>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    let subdomain = subdomain(&req)?;
    let resolved = state.control.resolve(subdomain).await.inspect_err(|err| {
        if matches!(err, TenantError::Inactive(_)) {
            info!(subdomain = subdomain, "Resolution refused for inactive tenant");
        }
    })?;
    HttpResponse::ok().with_json(&ResolveView::from(&resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tenantry_events::RetryPolicy;
    use tenantry_tenancy::{
        InMemoryEngine, InMemoryTenantStore, MigrationCatalog, MigrationStatus, MigrationStep,
        SecretCipher, TenantStatus,
    };

    const TOKEN: &str = "internal-token";

    fn api(baseline: Option<u32>) -> Router {
        let engine = Arc::new(InMemoryEngine::default());
        let catalog = MigrationCatalog::new(
            (1..=3)
                .map(|v| MigrationStep::new(v, format!("step_{}", v), format!("CREATE TABLE t{} (id INT);", v)))
                .collect(),
        )
        .unwrap();
        let control = Arc::new(
            ControlPlane::builder()
                .store(Arc::new(InMemoryTenantStore::new()))
                .storage(engine.clone())
                .executor(engine)
                .cipher(Arc::new(SecretCipher::ephemeral()))
                .catalog(catalog)
                .baseline_version(baseline)
                .retry(RetryPolicy::immediate(3))
                .build()
                .unwrap(),
        );
        let state = Arc::new(ApiState::new(control.clone(), Some(SecretString::from(TOKEN))));
        router(state)
    }

    fn post(path: &str, body: serde_json::Value) -> HttpRequest {
        HttpRequest::new("POST", path).with_body(body.to_string())
    }

    async fn create(router: &Router, subdomain: &str) -> TenantView {
        let response = router
            .route(post("/tenants", serde_json::json!({"name": "Acme", "subdomain": subdomain})))
            .await;
        assert_eq!(response.status, 201);
        response.json().unwrap()
    }

    async fn wait_for_status(router: &Router, id: &str, status: TenantStatus) -> TenantView {
        for _ in 0..200 {
            let view: TenantView = router
                .route(HttpRequest::new("GET", format!("/tenants/{}", id)))
                .await
                .json()
                .unwrap();
            if view.status == status {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tenant {} never reached {:?}", id, status);
    }

    #[tokio::test]
    async fn test_banner_and_health() {
        let router = api(None);

        let response = router.route(HttpRequest::new("GET", "/")).await;
        assert_eq!(response.status, 200);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["service"], "tenantry");

        let response = router.route(HttpRequest::new("GET", "/health")).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_create_returns_pending_then_conflict() {
        let router = api(Some(0));

        let created = create(&router, "acme").await;
        assert_eq!(created.status, TenantStatus::Pending);
        assert!(created.is_active);
        assert_eq!(created.migration_version, 0);

        let response = router
            .route(post("/tenants", serde_json::json!({"name": "Other", "subdomain": "ACME"})))
            .await;
        assert_eq!(response.status, 409);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"]["code"], "SUBDOMAIN_TAKEN");
    }

    #[tokio::test]
    async fn test_create_validation_errors() {
        let router = api(None);

        let response = router
            .route(post("/tenants", serde_json::json!({"name": "Acme", "subdomain": "-bad-"})))
            .await;
        assert_eq!(response.status, 400);

        let response = router
            .route(HttpRequest::new("POST", "/tenants").with_body("not json"))
            .await;
        assert_eq!(response.status, 400);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"]["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_lookup_unknown_and_malformed_ids() {
        let router = api(None);

        let response = router
            .route(HttpRequest::new("GET", "/tenants/by-subdomain/ghost"))
            .await;
        assert_eq!(response.status, 404);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"]["code"], "TENANT_NOT_FOUND");

        let response = router
            .route(HttpRequest::new("GET", format!("/tenants/{}", TenantId::new())))
            .await;
        assert_eq!(response.status, 404);

        let response = router.route(HttpRequest::new("GET", "/tenants/not-a-uuid")).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_migrations_endpoint_applies_pending_steps() {
        let router = api(Some(0));
        let created = create(&router, "acme").await;
        wait_for_status(&router, &created.id, TenantStatus::Migrated).await;

        let response = router
            .route(HttpRequest::new("POST", format!("/tenants/{}/migrations", created.id)))
            .await;
        assert_eq!(response.status, 200);
        let report: MigrationView = response.json().unwrap();
        assert_eq!(report.migration_version, 3);
        assert_eq!(report.migration_status, MigrationStatus::Applied);
        assert_eq!(report.applied, vec![1, 2, 3]);

        let response = router
            .route(post(
                &format!("/tenants/{}/migrations", created.id),
                serde_json::json!({"targetVersion": 9}),
            ))
            .await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_database_requires_token() {
        let router = api(None);
        let created = create(&router, "acme").await;
        wait_for_status(&router, &created.id, TenantStatus::Migrated).await;
        let path = format!("/tenants/{}/database", created.id);

        let response = router.route(HttpRequest::new("GET", path.clone())).await;
        assert_eq!(response.status, 401);

        let response = router
            .route(HttpRequest::new("GET", path.clone()).with_header("Authorization", "Bearer wrong"))
            .await;
        assert_eq!(response.status, 403);

        let response = router
            .route(HttpRequest::new("GET", path).with_header("Authorization", format!("Bearer {}", TOKEN)))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("cache-control").map(String::as_str), Some("no-store"));
        let db: DatabaseView = response.json().unwrap();
        assert_eq!(db.tenant_id, created.id);
        assert!(db.db_name.starts_with("tenant_"));
        assert_eq!(db.db_password.len(), 32);
    }

    #[tokio::test]
    async fn test_tenant_view_never_contains_credentials() {
        let router = api(None);
        let created = create(&router, "acme").await;
        wait_for_status(&router, &created.id, TenantStatus::Migrated).await;

        let response = router
            .route(HttpRequest::new("GET", format!("/tenants/{}", created.id)))
            .await;
        let raw = String::from_utf8(response.body).unwrap();
        assert!(!raw.contains("password"));
        assert!(!raw.contains("ciphertext"));
    }

    #[tokio::test]
    async fn test_resolve_and_deactivate_flow() {
        let router = api(None);

        let response = router.route(HttpRequest::new("GET", "/resolve/acme")).await;
        assert_eq!(response.status, 404);

        let created = create(&router, "acme").await;
        wait_for_status(&router, &created.id, TenantStatus::Migrated).await;

        let response = router.route(HttpRequest::new("GET", "/resolve/acme")).await;
        assert_eq!(response.status, 200);
        let resolved: ResolveView = response.json().unwrap();
        assert_eq!(resolved.tenant_id, created.id);
        assert_eq!(resolved.migration_version, 3);

        let response = router
            .route(HttpRequest::new("POST", format!("/tenants/{}/deactivate", created.id)))
            .await;
        assert_eq!(response.status, 200);

        let response = router.route(HttpRequest::new("GET", "/resolve/acme")).await;
        assert_eq!(response.status, 403);

        let view: TenantView = router
            .route(HttpRequest::new("GET", "/tenants/subdomain/acme"))
            .await
            .json()
            .unwrap();
        assert_eq!(view.status, TenantStatus::Inactive);

        let response = router
            .route(HttpRequest::new("POST", format!("/tenants/{}/reactivate", created.id)))
            .await;
        assert_eq!(response.status, 200);
        let response = router.route(HttpRequest::new("GET", "/resolve/acme")).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_release_subdomain_requires_inactive() {
        let router = api(None);
        let created = create(&router, "acme").await;
        let release = format!("/tenants/{}/release-subdomain", created.id);

        let response = router.route(HttpRequest::new("POST", release.clone())).await;
        assert_eq!(response.status, 409);

        router
            .route(HttpRequest::new("POST", format!("/tenants/{}/deactivate", created.id)))
            .await;
        let response = router.route(HttpRequest::new("POST", release)).await;
        assert_eq!(response.status, 200);

        let again = create(&router, "acme").await;
        assert_ne!(again.id, created.id);
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let router = api(None);
        let created = create(&router, "acme").await;
        wait_for_status(&router, &created.id, TenantStatus::Migrated).await;

        let response = router.route(HttpRequest::new("GET", "/tenants?state=migrated")).await;
        let views: Vec<TenantView> = response.json().unwrap();
        assert_eq!(views.len(), 1);

        let response = router.route(HttpRequest::new("GET", "/tenants?state=pending")).await;
        let views: Vec<TenantView> = response.json().unwrap();
        assert!(views.is_empty());

        let response = router.route(HttpRequest::new("GET", "/tenants?state=bogus")).await;
        assert_eq!(response.status, 400);
    }
}
