//! Outbox event kinds, tagged payload variants, and the persisted record.
//!
//! Handlers pattern-match on [`EventPayload`]'s closed set of variants;
//! there is no runtime type probing anywhere on the dispatch path.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::user::User;

/// The closed set of domain event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "USER_CREATED")]
    UserCreated,
    #[serde(rename = "USER_UPDATED")]
    UserUpdated,
    #[serde(rename = "USER_SOFT_DELETED")]
    UserSoftDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCreated => "USER_CREATED",
            Self::UserUpdated => "USER_UPDATED",
            Self::UserSoftDeleted => "USER_SOFT_DELETED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER_CREATED" => Ok(Self::UserCreated),
            "USER_UPDATED" => Ok(Self::UserUpdated),
            "USER_SOFT_DELETED" => Ok(Self::UserSoftDeleted),
            other => Err(Error::internal(format!("unknown event kind: {other}"))),
        }
    }
}

/// Entity snapshot carried by created/updated events. Deliberately omits
/// the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub nickname: String,
    pub email: String,
    pub country: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for UserSnapshot {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            nickname: user.nickname.clone(),
            email: user.email.clone(),
            country: user.country.clone(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// Tagged event payload, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    #[serde(rename = "USER_CREATED")]
    Created(UserSnapshot),
    #[serde(rename = "USER_UPDATED")]
    Updated(UserSnapshot),
    #[serde(rename = "USER_SOFT_DELETED")]
    SoftDeleted { user_id: Uuid },
}

impl EventPayload {
    pub fn created(user: &User) -> Self {
        Self::Created(user.into())
    }

    pub fn updated(user: &User) -> Self {
        Self::Updated(user.into())
    }

    pub fn soft_deleted(user_id: Uuid) -> Self {
        Self::SoftDeleted { user_id }
    }

    /// The kind this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::UserCreated,
            Self::Updated(_) => EventKind::UserUpdated,
            Self::SoftDeleted { .. } => EventKind::UserSoftDeleted,
        }
    }

    /// The id of the user the event is about.
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Created(s) | Self::Updated(s) => s.id,
            Self::SoftDeleted { user_id } => *user_id,
        }
    }
}

/// One append-only outbox row. `kind` and `payload` are immutable once
/// written; only `dispatched` transitions false -> true, after the owning
/// unit of work has committed.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub dispatched: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(user_id: Uuid, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            payload,
            dispatched: false,
            created_at: Utc::now(),
        }
    }
}
