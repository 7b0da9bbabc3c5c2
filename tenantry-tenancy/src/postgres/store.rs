use super::connect;
use crate::error::StoreError;
use crate::store::{Lease, LeaseKind, TenantFilter, TenantStore, lease_expiry};
use crate::tenant::{LifecycleState, MigrationStatus, Subdomain, Tenant, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, QueryResult, SqlErr, Statement, TransactionTrait, Value,
};
use std::time::Duration;
use tenantry_events::{EventError, EventType, NewEvent, Outbox, OutboxRecord};
use tracing::info;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS tenants (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        subdomain TEXT NOT NULL,
        state TEXT NOT NULL,
        is_active BOOLEAN NOT NULL,
        subdomain_released BOOLEAN NOT NULL DEFAULT FALSE,
        storage JSONB,
        migration_version INTEGER NOT NULL DEFAULT 0,
        migration_status TEXT NOT NULL,
        migration_target INTEGER,
        migration_error JSONB,
        failure_reason TEXT,
        revision BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )"#,
    // released subdomains drop out of the index so they can be reserved again
    r#"CREATE UNIQUE INDEX IF NOT EXISTS tenants_subdomain_key
        ON tenants (subdomain) WHERE NOT subdomain_released"#,
    r#"CREATE INDEX IF NOT EXISTS tenants_state_idx ON tenants (state)"#,
    r#"CREATE TABLE IF NOT EXISTS tenant_events (
        id BIGSERIAL PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        delivered_at TIMESTAMPTZ,
        UNIQUE (tenant_id, sequence)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS tenant_events_undelivered_idx
        ON tenant_events (id) WHERE delivered_at IS NULL"#,
    r#"CREATE TABLE IF NOT EXISTS tenant_leases (
        tenant_id UUID NOT NULL,
        kind TEXT NOT NULL,
        holder TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant_id, kind)
    )"#,
];

const TENANT_COLUMNS: &str = "id, name, subdomain, state, is_active, subdomain_released, storage, \
    migration_version, migration_status, migration_target, migration_error, failure_reason, \
    revision, created_at, updated_at";

const EVENT_COLUMNS: &str =
    "tenant_id, sequence, event_type, payload, created_at, attempts, last_error, next_attempt_at, delivered_at";

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        StoreError::Backend(err.to_string())
    }
}

fn outbox_err(err: DbErr) -> EventError {
    EventError::Outbox(err.to_string())
}

fn stmt(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
}

/// Tenant registry storage in PostgreSQL.
#[derive(Clone)]
pub struct PgTenantStore {
    conn: DatabaseConnection,
}

impl PgTenantStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let conn = connect(url, 10).await?;
        Ok(Self::new(conn))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for sql in SCHEMA {
            self.conn.execute_unprepared(sql).await?;
        }
        info!("Tenant registry schema ready");
        Ok(())
    }

    fn tenant_values(tenant: &Tenant, revision: u64) -> Result<Vec<Value>, StoreError> {
        let storage = tenant
            .storage
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let migration_error = tenant
            .migration_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(vec![
            (*tenant.id.as_uuid()).into(),
            tenant.name.clone().into(),
            tenant.subdomain.as_str().into(),
            tenant.state.as_str().into(),
            tenant.is_active.into(),
            tenant.subdomain_released.into(),
            storage.into(),
            (tenant.migration_version as i32).into(),
            tenant.migration_status.as_str().into(),
            tenant.migration_target.map(|v| v as i32).into(),
            migration_error.into(),
            tenant.failure_reason.clone().into(),
            (revision as i64).into(),
            tenant.created_at.into(),
            tenant.updated_at.into(),
        ])
    }

    async fn append_events<C: ConnectionTrait>(
        txn: &C,
        tenant: &Tenant,
        events: Vec<NewEvent>,
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let tenant_id = tenant.id.to_string();
        let row = txn
            .query_one(stmt(
                "SELECT COALESCE(MAX(sequence), 0) AS last FROM tenant_events WHERE tenant_id = $1",
                vec![tenant_id.clone().into()],
            ))
            .await?;
        let mut sequence = match row {
            Some(row) => row.try_get::<i64>("", "last")? as u64,
            None => 0,
        };

        for event in events {
            sequence += 1;
            let envelope = event.into_envelope(tenant_id.clone(), sequence, tenant.updated_at);
            txn.execute(stmt(
                "INSERT INTO tenant_events (tenant_id, sequence, event_type, payload, created_at, next_attempt_at) \
                 VALUES ($1, $2, $3, $4, $5, $5)",
                vec![
                    envelope.tenant_id.into(),
                    (envelope.sequence as i64).into(),
                    envelope.event_type.as_str().into(),
                    envelope.payload.into(),
                    envelope.timestamp.into(),
                ],
            ))
            .await?;
        }
        Ok(())
    }

    async fn query_tenants(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Tenant>, StoreError> {
        let rows = self.conn.query_all(stmt(sql, values)).await?;
        rows.iter().map(tenant_from_row).collect()
    }
}

fn tenant_from_row(row: &QueryResult) -> Result<Tenant, StoreError> {
    let corrupt = |what: &str| StoreError::Backend(format!("corrupt tenant row: {}", what));

    let subdomain: String = row.try_get("", "subdomain")?;
    let state: String = row.try_get("", "state")?;
    let migration_status: String = row.try_get("", "migration_status")?;
    let storage: Option<serde_json::Value> = row.try_get("", "storage")?;
    let migration_error: Option<serde_json::Value> = row.try_get("", "migration_error")?;
    let migration_version: i32 = row.try_get("", "migration_version")?;
    let migration_target: Option<i32> = row.try_get("", "migration_target")?;
    let revision: i64 = row.try_get("", "revision")?;

    Ok(Tenant {
        id: TenantId::from_uuid(row.try_get::<Uuid>("", "id")?),
        name: row.try_get("", "name")?,
        subdomain: Subdomain::parse(&subdomain).map_err(|_| corrupt("subdomain"))?,
        state: LifecycleState::parse(&state).ok_or_else(|| corrupt("state"))?,
        is_active: row.try_get("", "is_active")?,
        subdomain_released: row.try_get("", "subdomain_released")?,
        storage: storage
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| corrupt("storage"))?,
        migration_version: migration_version as u32,
        migration_status: MigrationStatus::parse(&migration_status).ok_or_else(|| corrupt("migration_status"))?,
        migration_target: migration_target.map(|v| v as u32),
        migration_error: migration_error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| corrupt("migration_error"))?,
        failure_reason: row.try_get("", "failure_reason")?,
        revision: revision as u64,
        created_at: row.try_get("", "created_at")?,
        updated_at: row.try_get("", "updated_at")?,
    })
}

fn record_from_row(row: &QueryResult) -> Result<OutboxRecord, DbErr> {
    let event_type: String = row.try_get("", "event_type")?;
    let event_type = EventType::parse(&event_type)
        .ok_or_else(|| DbErr::Custom(format!("unknown event type {}", event_type)))?;
    let sequence: i64 = row.try_get("", "sequence")?;
    let attempts: i32 = row.try_get("", "attempts")?;
    let tenant_id: String = row.try_get("", "tenant_id")?;

    Ok(OutboxRecord {
        envelope: NewEvent::new(event_type, row.try_get("", "payload")?).into_envelope(
            tenant_id,
            sequence as u64,
            row.try_get("", "created_at")?,
        ),
        attempts: attempts as u32,
        last_error: row.try_get("", "last_error")?,
        next_attempt_at: row.try_get("", "next_attempt_at")?,
        delivered_at: row.try_get("", "delivered_at")?,
    })
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn insert(&self, tenant: &Tenant, events: Vec<NewEvent>) -> Result<Tenant, StoreError> {
        let txn = self.conn.begin().await?;

        let sql = format!(
            "INSERT INTO tenants ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            TENANT_COLUMNS
        );
        if let Err(err) = txn.execute(stmt(&sql, Self::tenant_values(tenant, 1)?)).await {
            return Err(match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    StoreError::AlreadyExists(tenant.subdomain.to_string())
                }
                _ => err.into(),
            });
        }
        Self::append_events(&txn, tenant, events).await?;
        txn.commit().await?;

        let mut stored = tenant.clone();
        stored.revision = 1;
        Ok(stored)
    }

    async fn update(
        &self,
        tenant: &Tenant,
        expected_revision: u64,
        events: Vec<NewEvent>,
    ) -> Result<Tenant, StoreError> {
        let txn = self.conn.begin().await?;
        let revision = expected_revision + 1;

        let mut values = Self::tenant_values(tenant, revision)?;
        values.push((expected_revision as i64).into());
        let result = txn
            .execute(stmt(
                "UPDATE tenants SET name = $2, subdomain = $3, state = $4, is_active = $5, \
                 subdomain_released = $6, storage = $7, migration_version = $8, migration_status = $9, \
                 migration_target = $10, migration_error = $11, failure_reason = $12, revision = $13, \
                 created_at = $14, updated_at = $15 \
                 WHERE id = $1 AND revision = $16",
                values,
            ))
            .await?;

        if result.rows_affected() == 0 {
            let exists = txn
                .query_one(stmt(
                    "SELECT revision FROM tenants WHERE id = $1",
                    vec![(*tenant.id.as_uuid()).into()],
                ))
                .await?;
            txn.rollback().await?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(format!(
                    "tenant {} changed since revision {}",
                    tenant.id, expected_revision
                )),
                None => StoreError::NotFound(tenant.id.to_string()),
            });
        }

        Self::append_events(&txn, tenant, events).await?;
        txn.commit().await?;

        let mut stored = tenant.clone();
        stored.revision = revision;
        Ok(stored)
    }

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let sql = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        Ok(self
            .query_tenants(&sql, vec![(*id.as_uuid()).into()])
            .await?
            .into_iter()
            .next())
    }

    async fn find_by_subdomain(&self, subdomain: &Subdomain) -> Result<Option<Tenant>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tenants WHERE subdomain = $1 AND NOT subdomain_released",
            TENANT_COLUMNS
        );
        Ok(self
            .query_tenants(&sql, vec![subdomain.as_str().into()])
            .await?
            .into_iter()
            .next())
    }

    async fn list(&self, filter: &TenantFilter) -> Result<Vec<Tenant>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.states.is_empty() {
            let placeholders: Vec<String> = filter
                .states
                .iter()
                .map(|state| {
                    values.push(state.as_str().into());
                    format!("${}", values.len())
                })
                .collect();
            clauses.push(format!("state IN ({})", placeholders.join(", ")));
        }
        if let Some(active) = filter.active {
            values.push(active.into());
            clauses.push(format!("is_active = ${}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM tenants", TENANT_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.query_tenants(&sql, values).await
    }

    async fn try_acquire_lease(
        &self,
        id: &TenantId,
        kind: LeaseKind,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl);

        let row = self
            .conn
            .query_one(stmt(
                "INSERT INTO tenant_leases (tenant_id, kind, holder, expires_at) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (tenant_id, kind) DO UPDATE \
                 SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
                 WHERE tenant_leases.expires_at <= $5 OR tenant_leases.holder = EXCLUDED.holder \
                 RETURNING expires_at",
                vec![
                    (*id.as_uuid()).into(),
                    kind.as_str().into(),
                    holder.into(),
                    expires_at.into(),
                    now.into(),
                ],
            ))
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Lease {
            tenant_id: *id,
            kind,
            holder: holder.to_string(),
            expires_at: row.try_get::<DateTime<Utc>>("", "expires_at")?,
        }))
    }

    async fn release_lease(&self, id: &TenantId, kind: LeaseKind, holder: &str) -> Result<(), StoreError> {
        self.conn
            .execute(stmt(
                "DELETE FROM tenant_leases WHERE tenant_id = $1 AND kind = $2 AND holder = $3",
                vec![(*id.as_uuid()).into(), kind.as_str().into(), holder.into()],
            ))
            .await?;
        Ok(())
    }

    async fn events(&self, id: &TenantId) -> Result<Vec<OutboxRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tenant_events WHERE tenant_id = $1 ORDER BY sequence",
            EVENT_COLUMNS
        );
        let rows = self.conn.query_all(stmt(&sql, vec![id.to_string().into()])).await?;
        Ok(rows.iter().map(record_from_row).collect::<Result<_, _>>()?)
    }
}

#[async_trait]
impl Outbox for PgTenantStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, EventError> {
        // a tenant whose oldest undelivered event is backing off holds back
        // everything after it
        let sql = format!(
            "SELECT {} FROM tenant_events e \
             WHERE e.delivered_at IS NULL AND e.next_attempt_at <= $1 \
             AND NOT EXISTS (SELECT 1 FROM tenant_events b \
                 WHERE b.tenant_id = e.tenant_id AND b.sequence < e.sequence \
                 AND b.delivered_at IS NULL AND b.next_attempt_at > $1) \
             ORDER BY e.id LIMIT $2",
            EVENT_COLUMNS
        );
        let rows = self
            .conn
            .query_all(stmt(&sql, vec![Utc::now().into(), (limit as i64).into()]))
            .await
            .map_err(outbox_err)?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()
            .map_err(outbox_err)
    }

    async fn mark_delivered(&self, tenant_id: &str, sequence: u64) -> Result<(), EventError> {
        self.conn
            .execute(stmt(
                "UPDATE tenant_events SET attempts = attempts + 1, last_error = NULL, \
                 delivered_at = COALESCE(delivered_at, $3) WHERE tenant_id = $1 AND sequence = $2",
                vec![tenant_id.into(), (sequence as i64).into(), Utc::now().into()],
            ))
            .await
            .map_err(outbox_err)?;
        Ok(())
    }

    async fn record_failure(
        &self,
        tenant_id: &str,
        sequence: u64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), EventError> {
        self.conn
            .execute(stmt(
                "UPDATE tenant_events SET attempts = attempts + 1, last_error = $3, next_attempt_at = $4 \
                 WHERE tenant_id = $1 AND sequence = $2",
                vec![tenant_id.into(), (sequence as i64).into(), error.into(), retry_at.into()],
            ))
            .await
            .map_err(outbox_err)?;
        Ok(())
    }
}
