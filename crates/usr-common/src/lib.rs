//! Shared domain types for the user service.
//!
//! Everything the other crates agree on lives here: the `User` entity and
//! its validation rules, the outbox event kinds and tagged payload
//! variants, and the error taxonomy.

pub mod error;
pub mod event;
pub mod user;

pub use error::{Error, Result};
pub use event::{EventKind, EventPayload, OutboxEvent, UserSnapshot};
pub use user::{NewUser, User};
