//! In-memory store backend.
//!
//! Used by the test suites and the dev runner. Mirrors the Postgres
//! backend's observable semantics: sessions stage writes and apply them
//! atomically at commit, `user_for_update` blocks concurrent writers until
//! the session finishes, and nickname/email uniqueness holds among
//! non-soft-deleted rows.
//!
//! The writer lock is store-wide rather than per-row. Coarser than real
//! row locks, but it preserves the lost-update guarantee the aggregate
//! relies on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use usr_common::{Error, OutboxEvent, Result, User};
use uuid::Uuid;

use crate::{page_window, StoreConfig, StoreTx, UserStore};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    events: HashMap<Uuid, OutboxEvent>,
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    write_lock: Arc<Mutex<()>>,
    passthrough: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            write_lock: Arc::new(Mutex::new(())),
            passthrough: false,
        }
    }

    /// A store whose sessions never commit or roll back on their own: every
    /// write lands immediately and stays until the harness discards the
    /// store. Requires `test_mode`.
    pub fn with_passthrough(config: &StoreConfig) -> Result<Self> {
        if !config.test_mode {
            return Err(Error::configuration(
                "pass-through sessions are only allowed in test mode",
            ));
        }
        Ok(Self {
            passthrough: true,
            ..Self::new()
        })
    }

    // Inspection helpers for tests and the dev runner.

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.tables.read().users.get(&id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.tables.read().users.len()
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        let mut events: Vec<_> = self.tables.read().events.values().cloned().collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events
    }

    pub fn events_for_user(&self, user_id: Uuid) -> Vec<OutboxEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .collect()
    }

    pub fn event(&self, event_id: Uuid) -> Option<OutboxEvent> {
        self.tables.read().events.get(&event_id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            tables: self.tables.clone(),
            write_lock: self.write_lock.clone(),
            row_guard: None,
            staged: Vec::new(),
            passthrough: self.passthrough,
        }))
    }

    async fn find_users(&self, country: Option<&str>, page: u32, limit: u32) -> Result<Vec<User>> {
        let (offset, limit) = page_window(page, limit);
        let tables = self.tables.read();
        let mut users: Vec<_> = tables
            .users
            .values()
            .filter(|u| !u.is_deleted())
            .filter(|u| country.map_or(true, |c| u.country == c))
            .cloned()
            .collect();
        users.sort_by_key(|u| (u.created_at, u.id));
        Ok(users
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn mark_dispatched(&self, event_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.events.get_mut(&event_id) {
            Some(event) if !event.dispatched => {
                event.dispatched = true;
                Ok(())
            }
            Some(_) => Err(Error::not_found("undispatched outbox event", event_id)),
            None => Err(Error::not_found("outbox event", event_id)),
        }
    }
}

enum Staged {
    InsertUser(User),
    UpdateNickname {
        id: Uuid,
        nickname: String,
        updated_at: DateTime<Utc>,
    },
    SoftDelete {
        id: Uuid,
        deleted_at: DateTime<Utc>,
    },
    InsertEvent(OutboxEvent),
}

pub struct MemoryTx {
    tables: Arc<RwLock<Tables>>,
    write_lock: Arc<Mutex<()>>,
    row_guard: Option<OwnedMutexGuard<()>>,
    staged: Vec<Staged>,
    passthrough: bool,
}

impl MemoryTx {
    /// Validate `op` against `users` and apply it. `users` starts as the
    /// committed table and accumulates the session's earlier staged writes,
    /// so checks see the session's own uncommitted state.
    fn apply(users: &mut HashMap<Uuid, User>, events: &mut Vec<OutboxEvent>, op: &Staged) -> Result<()> {
        match op {
            Staged::InsertUser(user) => {
                check_unique(users, user.id, &user.nickname, &user.email)?;
                users.insert(user.id, user.clone());
            }
            Staged::UpdateNickname {
                id,
                nickname,
                updated_at,
            } => {
                let email = users
                    .get(id)
                    .filter(|u| !u.is_deleted())
                    .map(|u| u.email.clone())
                    .ok_or_else(|| Error::not_found("user", id))?;
                check_unique(users, *id, nickname, &email)?;
                if let Some(user) = users.get_mut(id) {
                    user.nickname = nickname.clone();
                    user.updated_at = *updated_at;
                }
            }
            Staged::SoftDelete { id, deleted_at } => {
                let user = users
                    .get_mut(id)
                    .filter(|u| !u.is_deleted())
                    .ok_or_else(|| Error::not_found("user", id))?;
                user.deleted_at = Some(*deleted_at);
                user.updated_at = *deleted_at;
            }
            Staged::InsertEvent(event) => events.push(event.clone()),
        }
        Ok(())
    }

    /// Run `op` against the session's effective view (committed state plus
    /// staged writes), then stage it. In pass-through mode the write goes
    /// straight to the tables.
    fn run(&mut self, op: Staged) -> Result<()> {
        if self.passthrough {
            let mut tables = self.tables.write();
            let mut users = tables.users.clone();
            let mut events = Vec::new();
            Self::apply(&mut users, &mut events, &op)?;
            tables.users = users;
            for event in events {
                tables.events.insert(event.id, event);
            }
            return Ok(());
        }

        let (mut users, _) = self.effective()?;
        let mut events = Vec::new();
        Self::apply(&mut users, &mut events, &op)?;
        self.staged.push(op);
        Ok(())
    }

    /// Committed users with this session's staged writes replayed on top.
    fn effective(&self) -> Result<(HashMap<Uuid, User>, Vec<OutboxEvent>)> {
        let mut users = self.tables.read().users.clone();
        let mut events = Vec::new();
        for op in &self.staged {
            Self::apply(&mut users, &mut events, op)?;
        }
        Ok((users, events))
    }
}

fn check_unique(
    users: &HashMap<Uuid, User>,
    candidate_id: Uuid,
    nickname: &str,
    email: &str,
) -> Result<()> {
    for other in users.values() {
        if other.id == candidate_id || other.is_deleted() {
            continue;
        }
        if other.nickname == nickname {
            return Err(Error::duplicate("nickname", nickname));
        }
        if other.email == email {
            return Err(Error::duplicate("email", email));
        }
    }
    Ok(())
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_user(&mut self, user: &User) -> Result<()> {
        self.run(Staged::InsertUser(user.clone()))
    }

    async fn user_for_update(&mut self, id: Uuid) -> Result<User> {
        if self.row_guard.is_none() {
            self.row_guard = Some(self.write_lock.clone().lock_owned().await);
        }
        let (users, _) = self.effective()?;
        users
            .get(&id)
            .filter(|u| !u.is_deleted())
            .cloned()
            .ok_or_else(|| Error::not_found("user", id))
    }

    async fn update_nickname(&mut self, user: &User) -> Result<()> {
        self.run(Staged::UpdateNickname {
            id: user.id,
            nickname: user.nickname.clone(),
            updated_at: user.updated_at,
        })
    }

    async fn soft_delete_user(&mut self, id: Uuid, deleted_at: DateTime<Utc>) -> Result<()> {
        self.run(Staged::SoftDelete { id, deleted_at })
    }

    async fn insert_event(&mut self, event: &OutboxEvent) -> Result<()> {
        self.run(Staged::InsertEvent(event.clone()))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.passthrough {
            self.row_guard.take();
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.tables.write();
        // Replay against a copy so a late conflict discards the whole batch.
        let mut users = tables.users.clone();
        let mut events = Vec::new();
        for op in &staged {
            Self::apply(&mut users, &mut events, op)?;
        }
        tables.users = users;
        for event in events {
            tables.events.insert(event.id, event);
        }
        drop(tables);
        self.row_guard.take();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.staged.clear();
        self.row_guard.take();
        Ok(())
    }
}
