//! Domain-transaction coordinator for the user aggregate.
//!
//! Every mutating operation follows one protocol: validate, open a unit of
//! work, mutate, append the outbox event through the same unit of work,
//! commit, and only then notify the bus. A failure anywhere before commit
//! rolls back both the mutation and the event; a notification failure
//! after commit is logged and never surfaced to the caller: the mutation
//! is already durable and the event row simply stays undispatched.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};
use usr_bus::Publisher;
use usr_common::{Error, EventPayload, NewUser, Result, User};
use usr_store::{outbox, StoreTx, UserStore};
use uuid::Uuid;

pub struct UserAggregate {
    store: Arc<dyn UserStore>,
    publisher: Arc<dyn Publisher>,
}

impl UserAggregate {
    pub fn new(store: Arc<dyn UserStore>, publisher: Arc<dyn Publisher>) -> Self {
        Self { store, publisher }
    }

    /// Create a user. On success exactly one `USER_CREATED` outbox row
    /// referencing the new id exists, committed atomically with the row.
    pub async fn create(&self, draft: NewUser) -> Result<User> {
        // Validation and hashing happen before any scope is opened.
        let user = User::create(draft)?;
        let payload = EventPayload::created(&user);

        let mut tx = self.store.begin().await?;
        let staged = async {
            tx.insert_user(&user).await?;
            outbox::append(tx.as_mut(), user.id, &payload).await
        }
        .await;

        let event_id = match staged {
            Ok(event_id) => event_id,
            Err(e) => {
                log_failure("create", &e);
                rollback(tx).await;
                return Err(e);
            }
        };

        tx.commit().await?;
        self.notify(event_id, payload).await;
        Ok(user)
    }

    /// Replace the nickname of an existing user. The row is re-read with a
    /// locking read first, so two concurrent updates to the same user
    /// serialize instead of losing one change.
    pub async fn update(&self, id: Uuid, nickname: &str) -> Result<User> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(Error::validation("nickname cannot be empty"));
        }

        let mut tx = self.store.begin().await?;
        let staged = async {
            let mut user = tx.user_for_update(id).await?;
            user.nickname = nickname.to_string();
            user.updated_at = Utc::now();
            tx.update_nickname(&user).await?;
            let payload = EventPayload::updated(&user);
            let event_id = outbox::append(tx.as_mut(), user.id, &payload).await?;
            Ok((user, event_id, payload))
        }
        .await;

        let (user, event_id, payload) = match staged {
            Ok(parts) => parts,
            Err(e) => {
                log_failure("update", &e);
                rollback(tx).await;
                return Err(e);
            }
        };

        tx.commit().await?;
        self.notify(event_id, payload).await;
        Ok(user)
    }

    /// Soft-delete a user. The event payload is derived from the id alone;
    /// event append and soft-delete share one unit of work, so a missing
    /// user discards the event with the rollback.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let payload = EventPayload::soft_deleted(id);

        let mut tx = self.store.begin().await?;
        let staged = async {
            let event_id = outbox::append(tx.as_mut(), id, &payload).await?;
            tx.soft_delete_user(id, Utc::now()).await?;
            Ok(event_id)
        }
        .await;

        let event_id = match staged {
            Ok(event_id) => event_id,
            Err(e) => {
                log_failure("delete", &e);
                rollback(tx).await;
                return Err(e);
            }
        };

        tx.commit().await?;
        self.notify(event_id, payload).await;
        Ok(())
    }

    /// Read-only listing; bypasses the outbox entirely.
    pub async fn find(&self, country: Option<&str>, page: u32, limit: u32) -> Result<Vec<User>> {
        self.store.find_users(country, page, limit).await
    }

    /// Post-commit notification. Failure leaves the event row undispatched
    /// for later reconciliation and is never reported to the caller.
    async fn notify(&self, event_id: Uuid, payload: EventPayload) {
        let kind = payload.kind();
        if let Err(e) = self.publisher.notify(event_id, kind, payload).await {
            warn!(
                event_id = %event_id,
                kind = %kind,
                error = %e,
                "post-commit notification failed; event remains undispatched"
            );
        }
    }
}

async fn rollback(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

/// Caller mistakes (not-found, duplicates, bad input) are routine; only
/// server-side failures deserve an error-level record.
fn log_failure(op: &'static str, e: &Error) {
    if e.is_client_error() {
        debug!(op, error = %e, "mutation rejected");
    } else {
        error!(op, error = %e, "mutation failed");
    }
}
