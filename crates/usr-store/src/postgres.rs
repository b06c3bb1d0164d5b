//! Postgres store backend (sqlx).
//!
//! Sessions wrap a `sqlx` transaction; row locking uses `SELECT ... FOR
//! UPDATE`, and the nickname/email uniqueness invariant lives in partial
//! unique indexes over non-soft-deleted rows. In pass-through mode all
//! sessions borrow one harness-owned transaction and never commit or roll
//! it back themselves.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::info;
use usr_common::{Error, OutboxEvent, Result, User};
use uuid::Uuid;

use crate::{page_window, StoreConfig, StoreTx, UserStore};

pub struct PgUserStore {
    pool: PgPool,
    /// Present only in pass-through mode: the harness-owned transaction
    /// every session (and read) runs inside.
    test_tx: Option<Arc<Mutex<Transaction<'static, Postgres>>>>,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            test_tx: None,
        }
    }

    /// Wrap a harness-owned, already-open transaction. The harness keeps
    /// control of the boundary and discards all writes after the test.
    /// Fails fast unless `test_mode` is set.
    pub fn with_test_transaction(
        pool: PgPool,
        tx: Transaction<'static, Postgres>,
        config: &StoreConfig,
    ) -> Result<Self> {
        if !config.test_mode {
            return Err(Error::configuration(
                "pass-through transactions are only allowed in test mode",
            ));
        }
        Ok(Self {
            pool,
            test_tx: Some(Arc::new(Mutex::new(tx))),
        })
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("user store schema initialized");
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        nickname TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        email TEXT NOT NULL,
        country TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        deleted_at TIMESTAMPTZ
    )
    "#,
    // Uniqueness holds among live rows only; soft-deleted rows free the name.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_nickname_live ON users (nickname) WHERE deleted_at IS NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_live ON users (email) WHERE deleted_at IS NULL",
    r#"
    CREATE TABLE IF NOT EXISTS user_events (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        dispatched BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_events_undispatched ON user_events (dispatched, created_at)",
];

#[async_trait]
impl UserStore for PgUserStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        match &self.test_tx {
            Some(tx) => Ok(Box::new(PgStoreTx {
                inner: PgTx::Shared(tx.clone()),
            })),
            None => Ok(Box::new(PgStoreTx {
                inner: PgTx::Owned(self.pool.begin().await?),
            })),
        }
    }

    async fn find_users(&self, country: Option<&str>, page: u32, limit: u32) -> Result<Vec<User>> {
        let (offset, limit) = page_window(page, limit);
        match &self.test_tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                queries::find_users(&mut **guard, country, offset, limit).await
            }
            None => queries::find_users(&self.pool, country, offset, limit).await,
        }
    }

    async fn mark_dispatched(&self, event_id: Uuid) -> Result<()> {
        match &self.test_tx {
            Some(tx) => {
                let mut guard = tx.lock().await;
                queries::mark_dispatched(&mut **guard, event_id).await
            }
            None => {
                // Short-lived bookkeeping scope, independent of any caller's.
                let mut tx = self.pool.begin().await?;
                queries::mark_dispatched(&mut *tx, event_id).await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }
}

enum PgTx {
    Owned(Transaction<'static, Postgres>),
    Shared(Arc<Mutex<Transaction<'static, Postgres>>>),
}

pub struct PgStoreTx {
    inner: PgTx,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn insert_user(&mut self, user: &User) -> Result<()> {
        match &mut self.inner {
            PgTx::Owned(tx) => queries::insert_user(&mut **tx, user).await,
            PgTx::Shared(tx) => {
                let mut guard = tx.lock().await;
                queries::insert_user(&mut **guard, user).await
            }
        }
    }

    async fn user_for_update(&mut self, id: Uuid) -> Result<User> {
        match &mut self.inner {
            PgTx::Owned(tx) => queries::user_for_update(&mut **tx, id).await,
            PgTx::Shared(tx) => {
                let mut guard = tx.lock().await;
                queries::user_for_update(&mut **guard, id).await
            }
        }
    }

    async fn update_nickname(&mut self, user: &User) -> Result<()> {
        match &mut self.inner {
            PgTx::Owned(tx) => queries::update_nickname(&mut **tx, user).await,
            PgTx::Shared(tx) => {
                let mut guard = tx.lock().await;
                queries::update_nickname(&mut **guard, user).await
            }
        }
    }

    async fn soft_delete_user(&mut self, id: Uuid, deleted_at: DateTime<Utc>) -> Result<()> {
        match &mut self.inner {
            PgTx::Owned(tx) => queries::soft_delete_user(&mut **tx, id, deleted_at).await,
            PgTx::Shared(tx) => {
                let mut guard = tx.lock().await;
                queries::soft_delete_user(&mut **guard, id, deleted_at).await
            }
        }
    }

    async fn insert_event(&mut self, event: &OutboxEvent) -> Result<()> {
        match &mut self.inner {
            PgTx::Owned(tx) => queries::insert_event(&mut **tx, event).await,
            PgTx::Shared(tx) => {
                let mut guard = tx.lock().await;
                queries::insert_event(&mut **guard, event).await
            }
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        match self.inner {
            PgTx::Owned(tx) => Ok(tx.commit().await?),
            // The harness owns the boundary.
            PgTx::Shared(_) => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        match self.inner {
            PgTx::Owned(tx) => Ok(tx.rollback().await?),
            PgTx::Shared(_) => Ok(()),
        }
    }
}

mod queries {
    use sqlx::postgres::PgRow;
    use sqlx::{Executor, Postgres, Row};

    use super::*;

    const USER_COLUMNS: &str = "id, first_name, last_name, nickname, password_hash, email, \
                                country, created_at, updated_at, deleted_at";

    pub(super) async fn insert_user<'e, E>(ex: E, user: &User) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, nickname, password_hash, email, \
             country, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(user.id)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.nickname)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(&user.country)
        .bind(user.created_at)
        .bind(user.updated_at)
        .bind(user.deleted_at)
        .execute(ex)
        .await
        .map_err(|e| map_unique_violation(e, user))?;
        Ok(())
    }

    pub(super) async fn user_for_update<'e, E>(ex: E, id: Uuid) -> Result<User>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(ex)
        .await?;
        match row {
            Some(row) => user_from_row(&row),
            None => Err(Error::not_found("user", id)),
        }
    }

    pub(super) async fn update_nickname<'e, E>(ex: E, user: &User) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE users SET nickname = $1, updated_at = $2 \
             WHERE id = $3 AND deleted_at IS NULL",
        )
        .bind(&user.nickname)
        .bind(user.updated_at)
        .bind(user.id)
        .execute(ex)
        .await
        .map_err(|e| map_unique_violation(e, user))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("user", user.id));
        }
        Ok(())
    }

    pub(super) async fn soft_delete_user<'e, E>(
        ex: E,
        id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = $1, updated_at = $1 \
             WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(deleted_at)
        .bind(id)
        .execute(ex)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("user", id));
        }
        Ok(())
    }

    pub(super) async fn insert_event<'e, E>(ex: E, event: &OutboxEvent) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO user_events (id, user_id, event_type, payload, dispatched, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.id)
        .bind(event.user_id)
        .bind(event.kind.as_str())
        .bind(&event.payload)
        .bind(event.dispatched)
        .bind(event.created_at)
        .execute(ex)
        .await?;
        Ok(())
    }

    pub(super) async fn mark_dispatched<'e, E>(ex: E, event_id: Uuid) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let result =
            sqlx::query("UPDATE user_events SET dispatched = TRUE WHERE id = $1 AND dispatched = FALSE")
                .bind(event_id)
                .execute(ex)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("undispatched outbox event", event_id));
        }
        Ok(())
    }

    pub(super) async fn find_users<'e, E>(
        ex: E,
        country: Option<&str>,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<User>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows = match country {
            Some(country) => {
                sqlx::query(&format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE deleted_at IS NULL AND country = $1 \
                     ORDER BY created_at, id LIMIT $2 OFFSET $3"
                ))
                .bind(country)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(ex)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE deleted_at IS NULL \
                     ORDER BY created_at, id LIMIT $1 OFFSET $2"
                ))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(ex)
                .await?
            }
        };
        rows.iter().map(user_from_row).collect()
    }

    fn user_from_row(row: &PgRow) -> Result<User> {
        Ok(User {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            nickname: row.try_get("nickname")?,
            password_hash: row.try_get("password_hash")?,
            email: row.try_get("email")?,
            country: row.try_get("country")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }

    /// SQLSTATE 23505 from one of the partial unique indexes becomes a
    /// domain-level duplicate error.
    fn map_unique_violation(e: sqlx::Error, user: &User) -> Error {
        if let Some(db) = e.as_database_error() {
            if db.code().as_deref() == Some("23505") {
                let constraint = db.constraint().unwrap_or_default();
                if constraint.contains("email") {
                    return Error::duplicate("email", user.email.clone());
                }
                return Error::duplicate("nickname", user.nickname.clone());
            }
        }
        Error::Database(e)
    }
}
