//! In-process publish/subscribe for user domain events.
//!
//! The bus owns two things: the dispatched-flag bookkeeping on the outbox
//! row, and the fan-out to registered handlers. Callers reach it only
//! through [`Publisher::notify`], invoked by the aggregate strictly after
//! its unit of work has committed.

pub mod local;
pub mod log;

use async_trait::async_trait;
use usr_common::{EventKind, EventPayload, Result};
use uuid::Uuid;

pub use local::LocalBus;
pub use log::{register_log_subscribers, LogSubscriber};

/// What a handler receives: the envelope names the outbox row, the payload
/// is the tagged variant written with it.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// A registered event handler. Handlers run as independent spawned tasks;
/// a panic or failure in one never reaches its siblings or the notifier.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, event: EventEnvelope);
}

/// Post-commit notification entry point.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Mark the outbox row dispatched in a scope of its own, then fan out
    /// to the handlers registered for `kind` at call time. Returns once
    /// bookkeeping has committed and dispatch has been initiated; handler
    /// completion is never awaited.
    async fn notify(&self, event_id: Uuid, kind: EventKind, payload: EventPayload) -> Result<()>;
}
