//! End-to-end behavior of the aggregate over the in-memory backend: every
//! mutation and its outbox event commit or vanish together, and the bus
//! only hears about committed work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use usr_aggregate::UserAggregate;
use usr_bus::{EventEnvelope, LocalBus, Publisher, Subscriber};
use usr_common::{Error, EventKind, NewUser};
use usr_store::memory::MemoryStore;
use uuid::Uuid;

struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn handle(&self, event: EventEnvelope) {
        let _ = self.tx.send(event);
    }
}

fn draft(nickname: &str, email: &str) -> NewUser {
    NewUser {
        first_name: "Alicia".to_string(),
        last_name: "Koch".to_string(),
        nickname: nickname.to_string(),
        password: "correcthorse".to_string(),
        email: email.to_string(),
        country: "VE".to_string(),
    }
}

fn harness() -> (MemoryStore, Arc<LocalBus>, UserAggregate) {
    let store = MemoryStore::new();
    let bus = Arc::new(LocalBus::new(Arc::new(store.clone())));
    let aggregate = UserAggregate::new(Arc::new(store.clone()), bus.clone());
    (store, bus, aggregate)
}

#[tokio::test]
async fn create_persists_user_and_one_dispatched_event() {
    let (store, _bus, aggregate) = harness();

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();

    let stored = store.user(user.id).expect("user should be committed");
    assert_eq!(stored.nickname, "ak1");
    assert_ne!(stored.password_hash, "correcthorse");

    let events = store.events_for_user(user.id);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::UserCreated);
    assert!(events[0].dispatched);
    assert_eq!(events[0].payload["id"], user.id.to_string());
    assert!(events[0].payload.get("password_hash").is_none());
}

#[tokio::test]
async fn invalid_draft_is_rejected_before_the_store_is_touched() {
    let (store, _bus, aggregate) = harness();

    let err = aggregate
        .create(draft("ak1", "not-an-email"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));

    assert_eq!(store.user_count(), 0);
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn duplicate_nickname_leaves_no_user_and_no_event() {
    let (store, _bus, aggregate) = harness();

    aggregate.create(draft("ak1", "first@x.com")).await.unwrap();
    let err = aggregate
        .create(draft("ak1", "second@x.com"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate { field: "nickname", .. }));

    assert_eq!(store.user_count(), 1);
    assert_eq!(store.events().len(), 1);
}

#[tokio::test]
async fn update_changes_nickname_and_appends_updated_event() {
    let (store, _bus, aggregate) = harness();

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();
    let updated = aggregate.update(user.id, "ak2").await.unwrap();

    assert_eq!(updated.nickname, "ak2");
    assert_eq!(store.user(user.id).unwrap().nickname, "ak2");

    let events = store.events_for_user(user.id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, EventKind::UserUpdated);
    assert!(events[1].dispatched);
}

#[tokio::test]
async fn update_unknown_user_is_not_found_and_writes_nothing() {
    let (store, _bus, aggregate) = harness();

    let err = aggregate.update(Uuid::new_v4(), "nick").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn update_rejects_blank_nickname() {
    let (store, _bus, aggregate) = harness();
    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();

    let err = aggregate.update(user.id, "   ").await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(store.events_for_user(user.id).len(), 1);
}

#[tokio::test]
async fn delete_soft_deletes_and_hides_user_from_find() {
    let (store, _bus, aggregate) = harness();

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();
    aggregate.delete(user.id).await.unwrap();

    let stored = store.user(user.id).unwrap();
    assert!(stored.deleted_at.is_some());

    let listed = aggregate.find(None, 1, 10).await.unwrap();
    assert!(listed.iter().all(|u| u.id != user.id));

    let events = store.events_for_user(user.id);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind, EventKind::UserSoftDeleted);
    assert!(events[1].dispatched);
}

#[tokio::test]
async fn second_delete_is_not_found_and_appends_no_event() {
    let (store, _bus, aggregate) = harness();

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();
    aggregate.delete(user.id).await.unwrap();

    let err = aggregate.delete(user.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(store.events_for_user(user.id).len(), 2);
}

#[tokio::test]
async fn delete_unknown_user_discards_the_event_with_the_rollback() {
    let (store, _bus, aggregate) = harness();

    let err = aggregate.delete(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn find_filters_by_country() {
    let (_store, _bus, aggregate) = harness();

    aggregate.create(draft("ve1", "ve1@x.com")).await.unwrap();
    let mut de = draft("de1", "de1@x.com");
    de.country = "DE".to_string();
    aggregate.create(de).await.unwrap();

    let only_de = aggregate.find(Some("DE"), 1, 10).await.unwrap();
    assert_eq!(only_de.len(), 1);
    assert_eq!(only_de[0].nickname, "de1");
}

#[tokio::test]
async fn concurrent_updates_serialize_without_losing_events() {
    let (store, _bus, aggregate) = harness();
    let aggregate = Arc::new(aggregate);

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();

    let a = {
        let aggregate = aggregate.clone();
        let id = user.id;
        tokio::spawn(async move { aggregate.update(id, "left").await })
    };
    let b = {
        let aggregate = aggregate.clone();
        let id = user.id;
        tokio::spawn(async move { aggregate.update(id, "right").await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let final_nick = store.user(user.id).unwrap().nickname;
    assert!(final_nick == "left" || final_nick == "right");

    let updates: Vec<_> = store
        .events_for_user(user.id)
        .into_iter()
        .filter(|e| e.kind == EventKind::UserUpdated)
        .collect();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|e| e.dispatched));
}

#[tokio::test]
async fn subscriber_receives_created_payload_after_commit() {
    let (store, bus, aggregate) = harness();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(EventKind::UserCreated, Arc::new(ChannelSubscriber { tx }));

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();

    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("handler should run")
        .unwrap();
    assert_eq!(envelope.kind, EventKind::UserCreated);
    assert_eq!(envelope.payload.user_id(), user.id);
    // The handler saw committed state.
    assert!(store.user(user.id).is_some());
}

#[tokio::test]
async fn notify_failure_does_not_fail_the_mutation() {
    // Bus wired to a different store: mark_dispatched cannot find the row,
    // so notification fails while the mutation has already committed.
    let store = MemoryStore::new();
    let other = MemoryStore::new();
    let bus = Arc::new(LocalBus::new(Arc::new(other)));
    let aggregate = UserAggregate::new(Arc::new(store.clone()), bus);

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();

    assert!(store.user(user.id).is_some());
    let events = store.events_for_user(user.id);
    assert_eq!(events.len(), 1);
    assert!(!events[0].dispatched);
}

struct FailingPublisher;

#[async_trait]
impl Publisher for FailingPublisher {
    async fn notify(
        &self,
        _event_id: Uuid,
        _kind: EventKind,
        _payload: usr_common::EventPayload,
    ) -> usr_common::Result<()> {
        Err(Error::internal("bus offline"))
    }
}

#[tokio::test]
async fn delete_survives_publisher_failure() {
    let store = MemoryStore::new();
    let aggregate = UserAggregate::new(Arc::new(store.clone()), Arc::new(FailingPublisher));

    let user = aggregate.create(draft("ak1", "ak@x.com")).await.unwrap();
    aggregate.delete(user.id).await.unwrap();

    assert!(store.user(user.id).unwrap().deleted_at.is_some());
    assert!(store
        .events_for_user(user.id)
        .iter()
        .all(|e| !e.dispatched));
}
