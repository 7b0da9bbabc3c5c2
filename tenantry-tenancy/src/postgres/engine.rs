use super::{connect, is_connection_error, quote_ident, quote_literal, sqlstate};
use crate::migration::{AppliedStep, ExecError, LEDGER_TABLE, MigrationExecutor, MigrationStep, recorded_step};
use crate::storage::{StorageError, StorageProvisioner};
use crate::tenant::ConnectionDescriptor;
use async_trait::async_trait;
use dashmap::DashMap;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, SqlErr, Statement, TransactionTrait};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

fn tenant_url(conn: &ConnectionDescriptor) -> SecretString {
    SecretString::from(format!(
        "postgres://{}:{}@{}:{}/{}",
        urlencoding::encode(&conn.db_user),
        urlencoding::encode(conn.db_password.expose_secret()),
        conn.db_host,
        conn.db_port,
        urlencoding::encode(&conn.db_name)
    ))
}

fn classify(err: DbErr) -> StorageError {
    if is_connection_error(&err) {
        return StorageError::Transient(err.to_string());
    }
    let code = sqlstate(&err);
    classify_sqlstate(code.as_deref(), err.to_string())
}

fn classify_sqlstate(code: Option<&str>, message: String) -> StorageError {
    match code {
        // duplicate_object, duplicate_database
        Some("42710" | "42P04") => StorageError::Conflict(message),
        // disk_full, insufficient_resources, program_limit_exceeded
        Some("53100" | "53000" | "54000") => StorageError::QuotaExceeded(message),
        // too_many_connections, cannot_connect_now, serialization_failure, deadlock_detected
        Some("53300" | "57P03" | "40001" | "40P01") => StorageError::Transient(message),
        Some(code) if code.starts_with("08") => StorageError::Transient(message),
        _ => StorageError::Other(message),
    }
}

/// Administrative operations on a PostgreSQL server, using the shared admin
/// credentials.
pub struct PgStorageProvisioner {
    admin: DatabaseConnection,
    host: String,
    port: u16,
}

impl PgStorageProvisioner {
    /// `host` and `port` are what tenants connect to, which may differ from
    /// the admin URL (e.g. behind a pooler).
    pub async fn connect(admin_url: &SecretString, host: impl Into<String>, port: u16) -> Result<Self, StorageError> {
        let admin = connect(admin_url.expose_secret(), 2).await.map_err(classify)?;
        Ok(Self {
            admin,
            host: host.into(),
            port,
        })
    }

    async fn exists(&self, sql: &str, name: &str) -> Result<bool, StorageError> {
        let row = self
            .admin
            .query_one(Statement::from_sql_and_values(DbBackend::Postgres, sql, [name.into()]))
            .await
            .map_err(classify)?;
        Ok(row.is_some())
    }

    async fn run(&self, sql: &str) -> Result<(), StorageError> {
        self.admin.execute_unprepared(sql).await.map_err(classify)?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvisioner for PgStorageProvisioner {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    fn endpoint(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    async fn role_exists(&self, role: &str) -> Result<bool, StorageError> {
        self.exists("SELECT 1 FROM pg_roles WHERE rolname = $1", role).await
    }

    async fn create_role(&self, role: &str, password: &SecretString) -> Result<(), StorageError> {
        // DDL takes no bind parameters
        self.run(&format!(
            "CREATE ROLE {} LOGIN NOSUPERUSER NOCREATEDB NOCREATEROLE NOINHERIT PASSWORD {}",
            quote_ident(role),
            quote_literal(password.expose_secret())
        ))
        .await
    }

    async fn set_role_password(&self, role: &str, password: &SecretString) -> Result<(), StorageError> {
        self.run(&format!(
            "ALTER ROLE {} WITH PASSWORD {}",
            quote_ident(role),
            quote_literal(password.expose_secret())
        ))
        .await
    }

    async fn drop_role(&self, role: &str) -> Result<(), StorageError> {
        self.run(&format!("DROP ROLE IF EXISTS {}", quote_ident(role))).await
    }

    async fn database_exists(&self, database: &str) -> Result<bool, StorageError> {
        self.exists("SELECT 1 FROM pg_database WHERE datname = $1", database)
            .await
    }

    async fn create_database(&self, database: &str, owner: &str) -> Result<(), StorageError> {
        self.run(&format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(owner)
        ))
        .await
    }

    async fn drop_database(&self, database: &str) -> Result<(), StorageError> {
        self.run(&format!("DROP DATABASE IF EXISTS {}", quote_ident(database)))
            .await
    }

    async fn restrict_access(&self, database: &str, role: &str) -> Result<(), StorageError> {
        self.run(&format!("REVOKE ALL ON DATABASE {} FROM PUBLIC", quote_ident(database)))
            .await?;
        self.run(&format!(
            "GRANT CONNECT, TEMPORARY ON DATABASE {} TO {}",
            quote_ident(database),
            quote_ident(role)
        ))
        .await
    }

    async fn verify_connectivity(&self, conn: &ConnectionDescriptor) -> Result<(), StorageError> {
        let url = tenant_url(conn);
        let db = connect(url.expose_secret(), 1)
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        let result = db.execute_unprepared("SELECT 1").await;
        let _ = db.close().await;
        result.map_err(|e| StorageError::Transient(e.to_string()))?;
        debug!(database = %conn.db_name, "Tenant database reachable with scoped credentials");
        Ok(())
    }
}

/// Runs migration steps inside tenant databases, one small pool per tenant.
#[derive(Default)]
pub struct PgMigrationExecutor {
    pools: DashMap<String, DatabaseConnection>,
}

impl PgMigrationExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, conn: &ConnectionDescriptor) -> Result<DatabaseConnection, ExecError> {
        if let Some(pool) = self.pools.get(&conn.db_name) {
            return Ok(pool.clone());
        }
        let pool = connect(tenant_url(conn).expose_secret(), 2)
            .await
            .map_err(|e| ExecError::Transient(e.to_string()))?;
        pool.execute_unprepared(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                version INTEGER PRIMARY KEY, \
                name TEXT NOT NULL, \
                checksum TEXT NOT NULL, \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            quote_ident(LEDGER_TABLE)
        ))
        .await
        .map_err(|e| ExecError::Ledger(e.to_string()))?;

        self.pools.insert(conn.db_name.clone(), pool.clone());
        Ok(pool)
    }

    async fn recorded(&self, conn: &ConnectionDescriptor, step: &MigrationStep) -> Result<Option<AppliedStep>, ExecError> {
        let ledger = self.applied_steps(conn).await?;
        recorded_step(&ledger, step)
    }
}

#[async_trait]
impl MigrationExecutor for PgMigrationExecutor {
    async fn applied_steps(&self, conn: &ConnectionDescriptor) -> Result<Vec<AppliedStep>, ExecError> {
        let pool = self.pool(conn).await?;
        let rows = pool
            .query_all(Statement::from_string(
                DbBackend::Postgres,
                format!(
                    "SELECT version, name, checksum, applied_at FROM {} ORDER BY version",
                    quote_ident(LEDGER_TABLE)
                ),
            ))
            .await
            .map_err(|e| ExecError::Transient(e.to_string()))?;

        rows.iter()
            .map(|row| -> Result<AppliedStep, DbErr> {
                let version: i32 = row.try_get("", "version")?;
                Ok(AppliedStep {
                    version: version as u32,
                    name: row.try_get("", "name")?,
                    checksum: row.try_get("", "checksum")?,
                    applied_at: row.try_get("", "applied_at")?,
                })
            })
            .collect::<Result<Vec<_>, DbErr>>()
            .map_err(|e| ExecError::Ledger(e.to_string()))
    }

    async fn apply_step(&self, conn: &ConnectionDescriptor, step: &MigrationStep) -> Result<AppliedStep, ExecError> {
        if let Some(row) = self.recorded(conn, step).await? {
            debug!(database = %conn.db_name, version = step.version, "Step already in the ledger");
            return Ok(row);
        }

        let pool = self.pool(conn).await?;
        let txn = pool.begin().await.map_err(|e| ExecError::Transient(e.to_string()))?;

        // the step and its ledger row commit together or not at all
        txn.execute_unprepared(&step.sql)
            .await
            .map_err(|e| ExecError::Step(e.to_string()))?;

        let row = txn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Postgres,
                format!(
                    "INSERT INTO {} (version, name, checksum) VALUES ($1, $2, $3) RETURNING applied_at",
                    quote_ident(LEDGER_TABLE)
                ),
                [(step.version as i32).into(), step.name.clone().into(), step.checksum.clone().into()],
            ))
            .await
            .map_err(|e| match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    ExecError::Ledger(format!("version {} already recorded", step.version))
                }
                _ => ExecError::Ledger(e.to_string()),
            })?
            .ok_or_else(|| ExecError::Ledger("ledger insert returned no row".to_string()))?;
        let applied_at = row.try_get("", "applied_at").map_err(|e| ExecError::Ledger(e.to_string()))?;

        if let Err(err) = txn.commit().await {
            // the server may have committed before the connection dropped
            return match self.recorded(conn, step).await {
                Ok(Some(row)) => Ok(row),
                _ => Err(ExecError::Transient(err.to_string())),
            };
        }

        Ok(AppliedStep {
            version: step.version,
            name: step.name.clone(),
            checksum: step.checksum.clone(),
            applied_at,
        })
    }
}
