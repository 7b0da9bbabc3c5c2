// Wire shapes of the control API

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tenantry_tenancy::{
    ConnectionDescriptor, MigrationReport, MigrationStatus, ResolvedTenant, Tenant, TenantStatus,
};

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub subdomain: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub target_version: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationErrorView {
    pub step: u32,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// Tenant record as returned to callers. Never carries credentials.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantView {
    pub id: String,
    pub name: String,
    pub subdomain: String,
    pub status: TenantStatus,
    pub is_active: bool,
    pub subdomain_released: bool,
    pub provisioned: bool,
    pub migration_version: u32,
    pub migration_status: MigrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_target: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_error: Option<MigrationErrorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Tenant> for TenantView {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.to_string(),
            name: tenant.name.clone(),
            subdomain: tenant.subdomain.as_str().to_string(),
            status: tenant.status(),
            is_active: tenant.is_active,
            subdomain_released: tenant.subdomain_released,
            provisioned: tenant.is_provisioned(),
            migration_version: tenant.migration_version,
            migration_status: tenant.migration_status,
            migration_target: tenant.migration_target,
            migration_error: tenant.migration_error.as_ref().map(|e| MigrationErrorView {
                step: e.step,
                message: e.message.clone(),
                failed_at: e.failed_at,
            }),
            failure_reason: tenant.failure_reason.clone(),
            created_at: tenant.created_at,
            updated_at: tenant.updated_at,
        }
    }
}

/// Plaintext connection details, served only to authorized internal callers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseView {
    pub tenant_id: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
}

impl DatabaseView {
    pub fn new(tenant_id: String, descriptor: &ConnectionDescriptor) -> Self {
        Self {
            tenant_id,
            db_name: descriptor.db_name.clone(),
            db_host: descriptor.db_host.clone(),
            db_port: descriptor.db_port,
            db_user: descriptor.db_user.clone(),
            db_password: descriptor.db_password.expose_secret().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveView {
    pub tenant_id: String,
    pub subdomain: String,
    pub migration_version: u32,
}

impl From<&ResolvedTenant> for ResolveView {
    fn from(resolved: &ResolvedTenant) -> Self {
        Self {
            tenant_id: resolved.tenant_id.to_string(),
            subdomain: resolved.subdomain.as_str().to_string(),
            migration_version: resolved.migration_version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationView {
    pub tenant_id: String,
    pub migration_status: MigrationStatus,
    pub migration_version: u32,
    pub target_version: u32,
    pub applied: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<MigrationReport> for MigrationView {
    fn from(report: MigrationReport) -> Self {
        Self {
            tenant_id: report.tenant_id.to_string(),
            migration_status: report.status,
            migration_version: report.version,
            target_version: report.target,
            applied: report.applied,
            failed_step: report.failed_step,
            error: report.error,
        }
    }
}
