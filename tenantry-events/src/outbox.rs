//! Append-only event log with delivery bookkeeping.
//!
//! Events are appended in the same critical section or transaction as the
//! state change that produced them; delivery to the broker happens later.

use crate::{EventEnvelope, EventError, NewEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// One logged event and its delivery state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub envelope: EventEnvelope,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// Read side of the outbox used by the relay.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Undelivered records that are due, oldest first. A tenant whose oldest
    /// undelivered record is not yet due contributes nothing, so per-tenant
    /// order is preserved.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, EventError>;

    async fn mark_delivered(&self, tenant_id: &str, sequence: u64) -> Result<(), EventError>;

    async fn record_failure(
        &self,
        tenant_id: &str,
        sequence: u64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), EventError>;
}

/// Plain data structure behind the in-memory outboxes.
///
/// It does no locking of its own so that a store can embed it next to the
/// tenant records and mutate both under one lock.
#[derive(Debug, Default)]
pub struct OutboxLog {
    records: Vec<OutboxRecord>,
    index: HashMap<(String, u64), usize>,
    sequences: HashMap<String, u64>,
}

impl OutboxLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, assigning the next sequence number for its tenant.
    pub fn append(&mut self, tenant_id: &str, event: NewEvent, now: DateTime<Utc>) -> EventEnvelope {
        let sequence = self.sequences.entry(tenant_id.to_string()).or_insert(0);
        *sequence += 1;
        let envelope = event.into_envelope(tenant_id, *sequence, now);

        self.index
            .insert((tenant_id.to_string(), *sequence), self.records.len());
        self.records.push(OutboxRecord {
            envelope: envelope.clone(),
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            delivered_at: None,
        });

        envelope
    }

    pub fn last_sequence(&self, tenant_id: &str) -> u64 {
        self.sequences.get(tenant_id).copied().unwrap_or(0)
    }

    pub fn pending(&self, limit: usize, now: DateTime<Utc>) -> Vec<OutboxRecord> {
        let mut held_back: HashSet<&str> = HashSet::new();
        let mut due = Vec::new();

        for record in self.records.iter().filter(|r| !r.is_delivered()) {
            if due.len() >= limit {
                break;
            }
            let tenant = record.envelope.tenant_id.as_str();
            if held_back.contains(tenant) {
                continue;
            }
            if record.next_attempt_at > now {
                held_back.insert(tenant);
                continue;
            }
            due.push(record.clone());
        }

        due
    }

    pub fn mark_delivered(&mut self, tenant_id: &str, sequence: u64, now: DateTime<Utc>) -> bool {
        match self.record_mut(tenant_id, sequence) {
            Some(record) => {
                record.attempts += 1;
                record.last_error = None;
                record.delivered_at.get_or_insert(now);
                true
            }
            None => false,
        }
    }

    pub fn record_failure(
        &mut self,
        tenant_id: &str,
        sequence: u64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> bool {
        match self.record_mut(tenant_id, sequence) {
            Some(record) => {
                record.attempts += 1;
                record.last_error = Some(error.to_string());
                record.next_attempt_at = retry_at;
                true
            }
            None => false,
        }
    }

    /// Full history for one tenant, in sequence order.
    pub fn records_for(&self, tenant_id: &str) -> Vec<OutboxRecord> {
        self.records
            .iter()
            .filter(|r| r.envelope.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn record_mut(&mut self, tenant_id: &str, sequence: u64) -> Option<&mut OutboxRecord> {
        let position = *self.index.get(&(tenant_id.to_string(), sequence))?;
        self.records.get_mut(position)
    }
}

/// Standalone in-memory outbox.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    log: Mutex<OutboxLog>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, tenant_id: &str, event: NewEvent) -> EventEnvelope {
        self.log.lock().append(tenant_id, event, Utc::now())
    }

    pub fn records_for(&self, tenant_id: &str) -> Vec<OutboxRecord> {
        self.log.lock().records_for(tenant_id)
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, EventError> {
        Ok(self.log.lock().pending(limit, Utc::now()))
    }

    async fn mark_delivered(&self, tenant_id: &str, sequence: u64) -> Result<(), EventError> {
        if self.log.lock().mark_delivered(tenant_id, sequence, Utc::now()) {
            Ok(())
        } else {
            Err(EventError::Outbox(format!("unknown record {}:{}", tenant_id, sequence)))
        }
    }

    async fn record_failure(
        &self,
        tenant_id: &str,
        sequence: u64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), EventError> {
        if self.log.lock().record_failure(tenant_id, sequence, error, retry_at) {
            Ok(())
        } else {
            Err(EventError::Outbox(format!("unknown record {}:{}", tenant_id, sequence)))
        }
    }
}
