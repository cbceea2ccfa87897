#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event bus shared by every component of the runtime.
//!
//! Producers publish [`Event`]s into a single queue; one dispatch loop delivers each event
//! to the handlers subscribed to its type, in subscription order, awaiting every handler
//! before moving on. Handlers of a given type therefore observe events in publish order.

/// Dispatcher and queue policy.
pub mod bus;
/// Append-only JSON-lines event log.
pub mod journal;
/// Structured log + event telemetry handle.
pub mod telemetry;

use std::{future::Future, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{BusConfig, BusError, BusStats, EventBus, Overflow, QueuePolicy};
pub use journal::EventJournal;
pub use telemetry::{Telemetry, TelemetryBuilder};

/// Message delivered through the bus. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: Uuid,
    /// Discriminator used for routing (e.g. `perception_received`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Open JSON payload; its shape is a contract between emitter and subscribers.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Component that produced the event.
    pub source: String,
}

impl Event {
    /// Builds an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

/// Subscriber contract. Every handler may suspend; the dispatcher awaits it before
/// invoking the next one.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles a delivered event. Errors are logged by the dispatcher and otherwise ignored.
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Shared handle to a subscribed handler. Identity (pointer equality) is used by
/// [`EventBus::unsubscribe`].
pub type HandlerRef = Arc<dyn EventHandler>;

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wraps the closure.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Event publisher interface, for components that only need to emit.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event.
    async fn publish(&self, event: Event) -> Result<()>;
}
