//! Storage engine seam used by the provisioner.
//!
//! Physical names are always derived from the tenant id. The in-memory
//! engine implements both [`StorageProvisioner`] and [`MigrationExecutor`]
//! and supports fault injection for tests.

use crate::error::TenantError;
use crate::migration::{AppliedStep, ExecError, MigrationExecutor, MigrationStep, recorded_step};
use crate::tenant::{ConnectionDescriptor, TenantId};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Connectivity problem or timeout.
    #[error("Storage engine unavailable: {0}")]
    Transient(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Name already taken by something that is not ours.
    #[error("Name conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<StorageError> for TenantError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(msg) => TenantError::TransientProvisioning(msg),
            other => TenantError::PermanentProvisioning(other.to_string()),
        }
    }
}

/// Database and role names for a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalNames {
    pub database: String,
    pub role: String,
}

impl PhysicalNames {
    pub fn for_tenant(id: &TenantId) -> Self {
        let base = format!("tenant_{}", id.simple());
        Self {
            role: format!("{}_owner", base),
            database: base,
        }
    }
}

/// Administrative operations against the engine that hosts tenant databases.
///
/// Implementations hold the shared administrative credentials; nothing else
/// in the control plane sees them.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    fn engine(&self) -> &'static str;

    /// Host and port tenants connect to.
    fn endpoint(&self) -> (String, u16);

    async fn role_exists(&self, role: &str) -> Result<bool, StorageError>;

    /// Create a login role with no privileges beyond its own database.
    async fn create_role(&self, role: &str, password: &SecretString) -> Result<(), StorageError>;

    async fn set_role_password(&self, role: &str, password: &SecretString) -> Result<(), StorageError>;

    async fn drop_role(&self, role: &str) -> Result<(), StorageError>;

    async fn database_exists(&self, database: &str) -> Result<bool, StorageError>;

    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StorageError>;

    async fn drop_database(&self, database: &str) -> Result<(), StorageError>;

    /// Revoke public access so only `role` can connect.
    async fn restrict_access(&self, database: &str, role: &str) -> Result<(), StorageError>;

    /// Connect with the tenant's own credentials.
    async fn verify_connectivity(&self, conn: &ConnectionDescriptor) -> Result<(), StorageError>;
}

/// Operations of the in-memory engine that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateRole,
    CreateDatabase,
    RestrictAccess,
    Connect,
    ApplyStep,
    /// The step commits but the caller sees a dropped connection.
    CommitAck,
}

#[derive(Debug, Default)]
struct Database {
    owner: String,
    restricted: bool,
    ledger: Vec<AppliedStep>,
}

#[derive(Debug, Default)]
struct EngineState {
    roles: HashMap<String, String>,
    databases: HashMap<String, Database>,
    faults: HashMap<EngineOp, u32>,
    step_failures: HashMap<(String, u32), String>,
    database_quota: Option<usize>,
    create_database_calls: usize,
}

impl EngineState {
    fn take_fault(&mut self, op: EngineOp) -> Result<(), String> {
        match self.faults.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(format!("injected {:?} failure", op))
            }
            _ => Ok(()),
        }
    }

    fn connect(&mut self, conn: &ConnectionDescriptor) -> Result<&mut Database, String> {
        self.take_fault(EngineOp::Connect)?;
        match self.roles.get(&conn.db_user) {
            Some(password) if password == conn.db_password.expose_secret() => {}
            _ => return Err(format!("authentication failed for {}", conn.db_user)),
        }
        let db = self
            .databases
            .get_mut(&conn.db_name)
            .ok_or_else(|| format!("database {} does not exist", conn.db_name))?;
        if db.restricted && db.owner != conn.db_user {
            return Err(format!("permission denied for database {}", conn.db_name));
        }
        Ok(db)
    }
}

/// Storage engine kept in process memory.
#[derive(Debug)]
pub struct InMemoryEngine {
    host: String,
    port: u16,
    state: Mutex<EngineState>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new("localhost", 5432)
    }
}

impl InMemoryEngine {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Make the next `times` calls of `op` fail with a transient error.
    pub fn fail_next(&self, op: EngineOp, times: u32) {
        self.state.lock().faults.insert(op, times);
    }

    /// Refuse database creation once `max` databases exist.
    pub fn set_database_quota(&self, max: usize) {
        self.state.lock().database_quota = Some(max);
    }

    /// Make migration `version` fail inside `database` until cleared.
    pub fn fail_step(&self, database: &str, version: u32, message: impl Into<String>) {
        self.state
            .lock()
            .step_failures
            .insert((database.to_string(), version), message.into());
    }

    pub fn clear_step_failure(&self, database: &str, version: u32) {
        self.state.lock().step_failures.remove(&(database.to_string(), version));
    }

    pub fn database_count(&self) -> usize {
        self.state.lock().databases.len()
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state.lock().databases.contains_key(database)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.state.lock().roles.contains_key(role)
    }

    pub fn create_database_calls(&self) -> usize {
        self.state.lock().create_database_calls
    }

    /// Committed ledger rows of a database.
    pub fn ledger(&self, database: &str) -> Vec<AppliedStep> {
        self.state
            .lock()
            .databases
            .get(database)
            .map(|db| db.ledger.clone())
            .unwrap_or_default()
    }

    /// Rewrite a ledger checksum, as if the script had been edited after it ran.
    pub fn tamper_checksum(&self, database: &str, version: u32, checksum: &str) {
        if let Some(db) = self.state.lock().databases.get_mut(database) {
            if let Some(row) = db.ledger.iter_mut().find(|r| r.version == version) {
                row.checksum = checksum.to_string();
            }
        }
    }

    /// Remove a database behind the control plane's back.
    pub fn lose_database(&self, database: &str) {
        self.state.lock().databases.remove(database);
    }
}

#[async_trait]
impl StorageProvisioner for InMemoryEngine {
    fn engine(&self) -> &'static str {
        "memory"
    }

    fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    async fn role_exists(&self, role: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().roles.contains_key(role))
    }

    async fn create_role(&self, role: &str, password: &SecretString) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.take_fault(EngineOp::CreateRole).map_err(StorageError::Transient)?;
        if state.roles.contains_key(role) {
            return Err(StorageError::Conflict(format!("role {} already exists", role)));
        }
        state.roles.insert(role.to_string(), password.expose_secret().to_string());
        Ok(())
    }

    async fn set_role_password(&self, role: &str, password: &SecretString) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let entry = state
            .roles
            .get_mut(role)
            .ok_or_else(|| StorageError::Other(format!("role {} does not exist", role)))?;
        *entry = password.expose_secret().to_string();
        Ok(())
    }

    async fn drop_role(&self, role: &str) -> Result<(), StorageError> {
        self.state.lock().roles.remove(role);
        Ok(())
    }

    async fn database_exists(&self, database: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().databases.contains_key(database))
    }

    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.take_fault(EngineOp::CreateDatabase).map_err(StorageError::Transient)?;
        if let Some(max) = state.database_quota {
            if state.databases.len() >= max {
                return Err(StorageError::QuotaExceeded(format!("at most {} databases", max)));
            }
        }
        if state.databases.contains_key(database) {
            return Err(StorageError::Conflict(format!("database {} already exists", database)));
        }
        state.create_database_calls += 1;
        state.databases.insert(
            database.to_string(),
            Database {
                owner: owner.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<(), StorageError> {
        self.state.lock().databases.remove(database);
        Ok(())
    }

    async fn restrict_access(&self, database: &str, role: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.take_fault(EngineOp::RestrictAccess).map_err(StorageError::Transient)?;
        let db = state
            .databases
            .get_mut(database)
            .ok_or_else(|| StorageError::Other(format!("database {} does not exist", database)))?;
        db.owner = role.to_string();
        db.restricted = true;
        Ok(())
    }

    async fn verify_connectivity(&self, conn: &ConnectionDescriptor) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.connect(conn).map(|_| ()).map_err(StorageError::Transient)
    }
}

#[async_trait]
impl MigrationExecutor for InMemoryEngine {
    async fn applied_steps(&self, conn: &ConnectionDescriptor) -> Result<Vec<AppliedStep>, ExecError> {
        let mut state = self.state.lock();
        let db = state.connect(conn).map_err(ExecError::Transient)?;
        Ok(db.ledger.clone())
    }

    async fn apply_step(&self, conn: &ConnectionDescriptor, step: &MigrationStep) -> Result<AppliedStep, ExecError> {
        let mut state = self.state.lock();
        state.take_fault(EngineOp::ApplyStep).map_err(ExecError::Transient)?;
        if let Some(message) = state.step_failures.get(&(conn.db_name.clone(), step.version)) {
            return Err(ExecError::Step(message.clone()));
        }

        let db = state.connect(conn).map_err(ExecError::Transient)?;
        if let Some(row) = recorded_step(&db.ledger, step)? {
            return Ok(row);
        }
        let row = AppliedStep {
            version: step.version,
            name: step.name.clone(),
            checksum: step.checksum.clone(),
            applied_at: Utc::now(),
        };
        db.ledger.push(row.clone());
        state.take_fault(EngineOp::CommitAck).map_err(ExecError::Transient)?;
        Ok(row)
    }
}
