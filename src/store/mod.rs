//! Storage contracts for users, personas and the conversation log
//!
//! The session core only talks to these traits. [`SqliteStore`] is the
//! implementation the binary ships with.

mod sqlite;

pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::identity::UserIdentity;
use crate::persona::Persona;

// ─────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────

/// A row about to be appended to the conversation log.
///
/// The constructors keep `sender` set exactly when the row is from a user.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    sender_user_id: Option<i64>,
    persona_id: i64,
    content: String,
    speaker: Option<String>,
}

impl NewMessage {
    /// Message typed by a human user
    pub fn from_user(sender_user_id: i64, persona_id: i64, content: impl Into<String>) -> Self {
        Self {
            sender_user_id: Some(sender_user_id),
            persona_id,
            content: content.into(),
            speaker: None,
        }
    }

    /// Message produced by an agent; `speaker` names the persona or slot
    pub fn from_agent(persona_id: i64, content: impl Into<String>, speaker: Option<String>) -> Self {
        Self {
            sender_user_id: None,
            persona_id,
            content: content.into(),
            speaker,
        }
    }

    pub fn is_from_user(&self) -> bool {
        self.sender_user_id.is_some()
    }
}

/// A row read back from the conversation log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_user_id: Option<i64>,
    pub persona_id: i64,
    pub content: String,
    pub speaker: Option<String>,
    pub is_from_user: bool,
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: i64) -> Result<Option<UserIdentity>>;

    async fn find_user_by_handle(&self, handle: &str) -> Result<Option<UserIdentity>>;

    /// Return the user with this handle, creating it if absent
    async fn ensure_user(&self, handle: &str) -> Result<UserIdentity>;
}

#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Atomic get-or-create on `(owner, name)`. The flag is true when a row
    /// was inserted by this call.
    async fn get_or_create_persona(
        &self,
        owner_user_id: i64,
        name: &str,
        traits: &serde_json::Value,
    ) -> Result<(Persona, bool)>;

    /// Insert or overwrite the trait blob on `(owner, name)`
    async fn upsert_persona(
        &self,
        owner_user_id: i64,
        name: &str,
        traits: &serde_json::Value,
    ) -> Result<(Persona, bool)>;

    async fn find_persona(&self, owner_user_id: i64, name: &str) -> Result<Option<Persona>>;

    /// First persona with this name regardless of owner
    async fn find_persona_by_name(&self, name: &str) -> Result<Option<Persona>>;

    async fn list_personas(&self, owner_user_id: i64) -> Result<Vec<Persona>>;
}

/// Append-only conversation log
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage>;

    /// Newest first
    async fn history(&self, persona_id: i64, limit: usize) -> Result<Vec<StoredMessage>>;
}

pub type SharedUserStore = Arc<dyn UserStore>;
pub type SharedPersonaStore = Arc<dyn PersonaStore>;
pub type SharedMessageLog = Arc<dyn MessageLog>;
