//! The in-process bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, info};
use usr_common::{EventKind, EventPayload, Result};
use usr_store::UserStore;
use uuid::Uuid;

use crate::{EventEnvelope, Publisher, Subscriber};

/// Registry of event-kind -> handler-list plus the store handle used for
/// dispatched-flag bookkeeping. Constructed once at bootstrap and passed
/// down explicitly; there is no process-wide singleton.
pub struct LocalBus {
    store: Arc<dyn UserStore>,
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn Subscriber>>>>,
}

impl LocalBus {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Append a handler for `kind`. Registration is append-only; the same
    /// handler registered twice is invoked twice per event; no
    /// deduplication is performed.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn Subscriber>) {
        self.subscribers.write().entry(kind).or_default().push(handler);
    }

    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn Subscriber>> {
        self.subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for LocalBus {
    async fn notify(&self, event_id: Uuid, kind: EventKind, payload: EventPayload) -> Result<()> {
        // Bookkeeping first: if the row cannot be recorded as dispatched,
        // handlers must not run.
        if let Err(e) = self.store.mark_dispatched(event_id).await {
            error!(event_id = %event_id, kind = %kind, error = %e, "failed to mark event dispatched");
            return Err(e);
        }

        // Snapshot under the read lock: handlers registered after this
        // point do not receive this event.
        let handlers = self.handlers_for(kind);
        info!(
            event_id = %event_id,
            kind = %kind,
            handlers = handlers.len(),
            "event dispatched"
        );

        // Fire-and-forget: one independent task per handler. A panic is
        // contained by the task boundary and cannot reach siblings or the
        // caller, and dropping the caller's future cannot abort a handler.
        for handler in handlers {
            let event = EventEnvelope {
                event_id,
                kind,
                payload: payload.clone(),
            };
            tokio::spawn(async move {
                handler.handle(event).await;
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use usr_common::{NewUser, OutboxEvent, User};
    use usr_store::memory::MemoryStore;

    struct ChannelSubscriber {
        tx: mpsc::UnboundedSender<EventEnvelope>,
    }

    #[async_trait]
    impl Subscriber for ChannelSubscriber {
        async fn handle(&self, event: EventEnvelope) {
            let _ = self.tx.send(event);
        }
    }

    struct PanickingSubscriber;

    #[async_trait]
    impl Subscriber for PanickingSubscriber {
        async fn handle(&self, _event: EventEnvelope) {
            panic!("handler blew up");
        }
    }

    fn user() -> User {
        User::create(NewUser {
            first_name: "A".to_string(),
            last_name: "B".to_string(),
            nickname: "ab1".to_string(),
            password: "12345678".to_string(),
            email: "a@b.com".to_string(),
            country: "VE".to_string(),
        })
        .unwrap()
    }

    async fn seeded_event(store: &MemoryStore) -> (User, OutboxEvent, EventPayload) {
        let u = user();
        let payload = EventPayload::created(&u);
        let event = OutboxEvent::new(
            u.id,
            EventKind::UserCreated,
            serde_json::to_value(&payload).unwrap(),
        );
        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&u).await.unwrap();
        tx.insert_event(&event).await.unwrap();
        tx.commit().await.unwrap();
        (u, event, payload)
    }

    #[tokio::test]
    async fn notify_marks_dispatched_and_invokes_handlers() {
        let store = MemoryStore::new();
        let (u, event, payload) = seeded_event(&store).await;

        let bus = LocalBus::new(Arc::new(store.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::UserCreated, Arc::new(ChannelSubscriber { tx }));

        bus.notify(event.id, EventKind::UserCreated, payload)
            .await
            .unwrap();

        assert!(store.event(event.id).unwrap().dispatched);
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("handler should run")
            .unwrap();
        assert_eq!(received.event_id, event.id);
        assert_eq!(received.payload.user_id(), u.id);
    }

    #[tokio::test]
    async fn notify_unknown_event_errors_and_skips_handlers() {
        let store = MemoryStore::new();
        let bus = LocalBus::new(Arc::new(store));
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::UserCreated, Arc::new(ChannelSubscriber { tx }));

        let u = user();
        let err = bus
            .notify(Uuid::new_v4(), EventKind::UserCreated, EventPayload::created(&u))
            .await
            .unwrap_err();
        assert!(matches!(err, usr_common::Error::NotFound { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handlers_registered_after_notify_do_not_receive_the_event() {
        let store = MemoryStore::new();
        let (_, event, payload) = seeded_event(&store).await;
        let bus = LocalBus::new(Arc::new(store));

        bus.notify(event.id, EventKind::UserCreated, payload)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::UserCreated, Arc::new(ChannelSubscriber { tx }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_invoked_twice() {
        let store = MemoryStore::new();
        let (_, event, payload) = seeded_event(&store).await;
        let bus = LocalBus::new(Arc::new(store));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelSubscriber { tx });
        bus.subscribe(EventKind::UserCreated, handler.clone());
        bus.subscribe(EventKind::UserCreated, handler);

        bus.notify(event.id, EventKind::UserCreated, payload)
            .await
            .unwrap();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("both registrations should fire")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_siblings() {
        let store = MemoryStore::new();
        let (_, event, payload) = seeded_event(&store).await;
        let bus = LocalBus::new(Arc::new(store));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::UserCreated, Arc::new(PanickingSubscriber));
        bus.subscribe(EventKind::UserCreated, Arc::new(ChannelSubscriber { tx }));

        bus.notify(event.id, EventKind::UserCreated, payload)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sibling handler should still run")
            .unwrap();
    }

    #[tokio::test]
    async fn handlers_for_other_kinds_are_not_invoked() {
        let store = MemoryStore::new();
        let (_, event, payload) = seeded_event(&store).await;
        let bus = LocalBus::new(Arc::new(store));

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(EventKind::UserUpdated, Arc::new(ChannelSubscriber { tx }));

        bus.notify(event.id, EventKind::UserCreated, payload)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
