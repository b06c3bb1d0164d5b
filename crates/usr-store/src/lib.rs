//! Storage layer for the user service.
//!
//! A [`UserStore`] opens units of work ([`StoreTx`]) against the backing
//! store. Every mutation performed through one session commits or rolls
//! back as a whole; the outbox row describing a mutation is written through
//! the same session as the mutation itself (see [`outbox::append`]).
//!
//! Two backends: [`postgres::PgUserStore`] for production and
//! [`memory::MemoryStore`] for tests and the dev runner.

pub mod memory;
pub mod outbox;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use usr_common::{OutboxEvent, Result, User};
use uuid::Uuid;

/// Applied when a caller passes `limit = 0` to `find_users`.
pub const DEFAULT_FIND_LIMIT: u32 = 10;

/// Store construction options.
///
/// `test_mode` gates pass-through sessions: a store wrapped around a
/// harness-owned scope hands out sessions whose commit/rollback are no-ops,
/// so the harness keeps control of the real transaction boundary. Supplying
/// a pass-through scope without `test_mode` is a configuration error.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub test_mode: bool,
}

/// One open unit of work. All writes are invisible to other readers until
/// `commit` succeeds; dropping or rolling back discards them.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_user(&mut self, user: &User) -> Result<()>;

    /// Locking read: holds the row against concurrent writers until this
    /// session commits or rolls back.
    async fn user_for_update(&mut self, id: Uuid) -> Result<User>;

    /// Persist the nickname (and `updated_at`) of an existing row.
    async fn update_nickname(&mut self, user: &User) -> Result<()>;

    /// Soft-delete: stamps `deleted_at`, never removes the row.
    async fn soft_delete_user(&mut self, id: Uuid, deleted_at: DateTime<Utc>) -> Result<()>;

    async fn insert_event(&mut self, event: &OutboxEvent) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Storage backend: opens units of work and serves the paths that do not
/// participate in one.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Read-only listing. Excludes soft-deleted rows; `limit = 0` falls back
    /// to [`DEFAULT_FIND_LIMIT`], `page` is 1-based.
    async fn find_users(&self, country: Option<&str>, page: u32, limit: u32) -> Result<Vec<User>>;

    /// Flip an outbox row's dispatched flag, exactly once, in a short-lived
    /// unit of work of its own. Errors if the row is missing or already
    /// dispatched.
    async fn mark_dispatched(&self, event_id: Uuid) -> Result<()>;
}

pub(crate) fn page_window(page: u32, limit: u32) -> (u64, u32) {
    let limit = if limit == 0 { DEFAULT_FIND_LIMIT } else { limit };
    let page = u64::from(page.max(1));
    // The offset binds as a BIGINT downstream; clamp rather than wrap.
    let offset = ((page - 1) * u64::from(limit)).min(i64::MAX as u64);
    (offset, limit)
}
