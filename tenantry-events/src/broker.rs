//! Broker abstraction and an in-memory implementation.

use crate::{EventEnvelope, EventError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Destination for lifecycle events.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Publish one envelope. Returning `Ok` means the broker has accepted
    /// responsibility for it.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), EventError>;

    fn name(&self) -> &'static str;
}

/// Broker that keeps everything it receives. Supports outage simulation.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<EventEnvelope>>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish until set back to `true`.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Reject the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.published.lock().clone()
    }

    pub fn published_for(&self, tenant_id: &str) -> Vec<EventEnvelope> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventError::Connection("broker unavailable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(EventError::Publish("injected failure".to_string()));
        }

        self.published.lock().push(envelope.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
