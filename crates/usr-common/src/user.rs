//! User entity, creation draft, and validation.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::error::{Error, Result};

pub const MIN_PASSWORD_LEN: usize = 8;

/// The user aggregate root as persisted. `password_hash` is an argon2 PHC
/// string; the clear-text password never leaves [`NewUser`].
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub nickname: String,
    pub password_hash: String,
    pub email: String,
    pub country: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Input for creating a user. Carries the clear-text password until
/// [`User::create`] hashes it.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub nickname: String,
    pub password: String,
    pub email: String,
    pub country: String,
}

impl NewUser {
    /// Reject drafts that must never reach the store. Runs before any unit
    /// of work is opened.
    pub fn validate(&self) -> Result<()> {
        require("first name", &self.first_name)?;
        require("last name", &self.last_name)?;
        require("nickname", &self.nickname)?;
        if self.password.trim().len() < MIN_PASSWORD_LEN {
            return Err(Error::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        require("email", &self.email)?;
        if !self.email.validate_email() {
            return Err(Error::validation("invalid email format"));
        }
        require("country", &self.country)?;
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

impl User {
    /// Validate the draft, hash its password, and mint a new entity with a
    /// fresh id and timestamps.
    pub fn create(draft: NewUser) -> Result<Self> {
        draft.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            first_name: draft.first_name,
            last_name: draft.last_name,
            nickname: draft.nickname,
            password_hash: hash_password(&draft.password)?,
            email: draft.email,
            country: draft.country,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Hash a clear-text password into an argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::PasswordHash(e.to_string()))
}
