//! Tenant lifecycle events for the tenantry control plane.
//!
//! Every tenant state transition appends an event to an outbox in the same
//! write as the transition itself. The [`EventPublisher`] relays those
//! records to an [`EventBroker`] afterwards, so a broker outage delays
//! announcements without ever blocking or rolling back tenant state.
//!
//! ## Delivery contract
//!
//! - at least once
//! - in `sequence` order per tenant
//! - consumers de-duplicate on `(tenantId, eventType, sequence)`, exposed as
//!   [`EventEnvelope::dedup_key`]
//!
//! ## Brokers
//!
//! - [`InMemoryBroker`] for tests and single-process setups
//! - `RabbitMqBroker` (feature `rabbitmq`), a durable topic exchange keyed by
//!   event type

pub mod broker;
pub mod error;
pub mod event;
pub mod outbox;
pub mod publisher;
pub mod retry;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use broker::{EventBroker, InMemoryBroker};
pub use error::EventError;
pub use event::{EventEnvelope, EventType, NewEvent};
pub use outbox::{InMemoryOutbox, Outbox, OutboxLog, OutboxRecord};
pub use publisher::{EventPublisher, PublisherConfig, RelayStats};
pub use retry::{Backoff, RetryPolicy};

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqBroker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::broker::{EventBroker, InMemoryBroker};
    pub use crate::error::EventError;
    pub use crate::event::{EventEnvelope, EventType, NewEvent};
    pub use crate::outbox::{Outbox, OutboxRecord};
    pub use crate::publisher::{EventPublisher, PublisherConfig};
    pub use crate::retry::{Backoff, RetryPolicy};
}
