//! Logging subscriber: the default downstream consumer.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use usr_common::{EventKind, EventPayload};

use crate::{EventEnvelope, LocalBus, Subscriber};

pub struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    async fn handle(&self, event: EventEnvelope) {
        // A payload variant that does not match the envelope kind is a bug
        // upstream; log it and move on, never take the process down.
        if event.payload.kind() != event.kind {
            warn!(
                event_id = %event.event_id,
                kind = %event.kind,
                payload_kind = %event.payload.kind(),
                "payload variant does not match event kind"
            );
            return;
        }
        match &event.payload {
            EventPayload::Created(user) => info!(
                event_id = %event.event_id,
                user_id = %user.id,
                nickname = %user.nickname,
                "USER_CREATED"
            ),
            EventPayload::Updated(user) => info!(
                event_id = %event.event_id,
                user_id = %user.id,
                nickname = %user.nickname,
                "USER_UPDATED"
            ),
            EventPayload::SoftDeleted { user_id } => info!(
                event_id = %event.event_id,
                user_id = %user_id,
                "USER_SOFT_DELETED"
            ),
        }
    }
}

/// Register the logging subscriber for every event kind. Called by the
/// bootstrap before any traffic is accepted.
pub fn register_log_subscribers(bus: &LocalBus) {
    for kind in [
        EventKind::UserCreated,
        EventKind::UserUpdated,
        EventKind::UserSoftDeleted,
    ] {
        bus.subscribe(kind, Arc::new(LogSubscriber));
    }
}
