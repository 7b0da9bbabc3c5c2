//! Tenant lifecycle events and their broker envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// Kind of lifecycle transition being announced.
///
/// The serialized name doubles as the broker routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "tenant.created")]
    TenantCreated,
    #[serde(rename = "tenant.provisioned")]
    TenantProvisioned,
    /// Payload carries the reached `version`.
    #[serde(rename = "tenant.migrated")]
    TenantMigrated,
    #[serde(rename = "tenant.deactivated")]
    TenantDeactivated,
    #[serde(rename = "tenant.reactivated")]
    TenantReactivated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TenantCreated => "tenant.created",
            EventType::TenantProvisioned => "tenant.provisioned",
            EventType::TenantMigrated => "tenant.migrated",
            EventType::TenantDeactivated => "tenant.deactivated",
            EventType::TenantReactivated => "tenant.reactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tenant.created" => Some(EventType::TenantCreated),
            "tenant.provisioned" => Some(EventType::TenantProvisioned),
            "tenant.migrated" => Some(EventType::TenantMigrated),
            "tenant.deactivated" => Some(EventType::TenantDeactivated),
            "tenant.reactivated" => Some(EventType::TenantReactivated),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event produced by a state transition, before the store assigns its
/// sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    pub fn tenant_created(name: &str, subdomain: &str) -> Self {
        Self::new(
            EventType::TenantCreated,
            json!({ "name": name, "subdomain": subdomain }),
        )
    }

    /// Never includes credentials.
    pub fn tenant_provisioned(db_name: &str, db_host: &str, db_port: u16) -> Self {
        Self::new(
            EventType::TenantProvisioned,
            json!({ "dbName": db_name, "dbHost": db_host, "dbPort": db_port }),
        )
    }

    pub fn tenant_migrated(version: u32) -> Self {
        Self::new(EventType::TenantMigrated, json!({ "version": version }))
    }

    pub fn tenant_deactivated() -> Self {
        Self::new(EventType::TenantDeactivated, json!({}))
    }

    pub fn tenant_reactivated() -> Self {
        Self::new(EventType::TenantReactivated, json!({}))
    }

    /// Seal the event with its per-tenant sequence number.
    pub fn into_envelope(
        self,
        tenant_id: impl Into<String>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    ) -> EventEnvelope {
        EventEnvelope {
            event_type: self.event_type,
            tenant_id: tenant_id.into(),
            sequence,
            timestamp,
            payload: self.payload,
        }
    }
}

/// Broker payload: `{eventType, tenantId, sequence, timestamp, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub tenant_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Consumers de-duplicate on this key.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.tenant_id, self.event_type, self.sequence)
    }

    pub fn routing_key(&self) -> &'static str {
        self.event_type.as_str()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, crate::EventError> {
        Ok(serde_json::to_vec(self)?)
    }
}
