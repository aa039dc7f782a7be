//! SQLite-backed store
//!
//! One connection behind a mutex. Every operation runs on the blocking
//! pool and touches the database with a single statement or a short
//! statement sequence under the lock, so appends are atomic per row.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::persona::Persona;

use super::{MessageLog, NewMessage, PersonaStore, StoredMessage, UserStore};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        handle TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS personas (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_user_id INTEGER NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        traits TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        UNIQUE (owner_user_id, name)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_user_id INTEGER REFERENCES users(id),
        persona_id INTEGER NOT NULL REFERENCES personas(id),
        content TEXT NOT NULL,
        speaker TEXT,
        is_from_user INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        CHECK ((is_from_user = 1) = (sender_user_id IS NOT NULL))
    );

    CREATE INDEX IF NOT EXISTS idx_messages_persona ON messages (persona_id, created_at);
";

const PERSONA_COLUMNS: &str = "SELECT id, owner_user_id, name, traits, created_at FROM personas";

const MESSAGE_COLUMNS: &str =
    "SELECT id, sender_user_id, persona_id, content, speaker, is_from_user, created_at FROM messages";

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(db = %path.display(), "Conversation store opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            op(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("Storage task failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserIdentity> {
    Ok(UserIdentity {
        id: row.get(0)?,
        handle: row.get(1)?,
    })
}

fn persona_from_row(row: &Row<'_>) -> rusqlite::Result<Persona> {
    let traits: String = row.get(3)?;
    Ok(Persona {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        traits: serde_json::from_str(&traits).map_err(|e| conversion_error(3, e))?,
        created_at: timestamp_at(row, 4)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        sender_user_id: row.get(1)?,
        persona_id: row.get(2)?,
        content: row.get(3)?,
        speaker: row.get(4)?,
        is_from_user: row.get(5)?,
        created_at: timestamp_at(row, 6)?,
    })
}

fn select_persona(conn: &Connection, owner_user_id: i64, name: &str) -> Result<Option<Persona>> {
    let sql = format!("{} WHERE owner_user_id = ?1 AND name = ?2", PERSONA_COLUMNS);
    Ok(conn
        .query_row(&sql, params![owner_user_id, name], persona_from_row)
        .optional()?)
}

fn require_persona(conn: &Connection, owner_user_id: i64, name: &str) -> Result<Persona> {
    select_persona(conn, owner_user_id, name)?.ok_or_else(|| {
        Error::Internal(format!("persona '{}' vanished after insert", name))
    })
}

// ─────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────

#[async_trait]
impl UserStore for SqliteStore {
    async fn find_user(&self, id: i64) -> Result<Option<UserIdentity>> {
        self.run(move |conn| {
            Ok(conn
                .query_row("SELECT id, handle FROM users WHERE id = ?1", params![id], user_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_user_by_handle(&self, handle: &str) -> Result<Option<UserIdentity>> {
        let handle = handle.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, handle FROM users WHERE handle = ?1",
                    params![handle],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn ensure_user(&self, handle: &str) -> Result<UserIdentity> {
        let handle = handle.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (handle, created_at) VALUES (?1, ?2)",
                params![handle, now()],
            )?;
            Ok(conn.query_row(
                "SELECT id, handle FROM users WHERE handle = ?1",
                params![handle],
                user_from_row,
            )?)
        })
        .await
    }
}

#[async_trait]
impl PersonaStore for SqliteStore {
    async fn get_or_create_persona(
        &self,
        owner_user_id: i64,
        name: &str,
        traits: &serde_json::Value,
    ) -> Result<(Persona, bool)> {
        let name = name.to_string();
        let traits = serde_json::to_string(traits)?;
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO personas (owner_user_id, name, traits, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![owner_user_id, name, traits, now()],
            )?;
            Ok((require_persona(conn, owner_user_id, &name)?, inserted == 1))
        })
        .await
    }

    async fn upsert_persona(
        &self,
        owner_user_id: i64,
        name: &str,
        traits: &serde_json::Value,
    ) -> Result<(Persona, bool)> {
        let name = name.to_string();
        let traits = serde_json::to_string(traits)?;
        self.run(move |conn| {
            let existed = select_persona(conn, owner_user_id, &name)?.is_some();
            conn.execute(
                "INSERT INTO personas (owner_user_id, name, traits, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (owner_user_id, name) DO UPDATE SET traits = excluded.traits",
                params![owner_user_id, name, traits, now()],
            )?;
            Ok((require_persona(conn, owner_user_id, &name)?, !existed))
        })
        .await
    }

    async fn find_persona(&self, owner_user_id: i64, name: &str) -> Result<Option<Persona>> {
        let name = name.to_string();
        self.run(move |conn| select_persona(conn, owner_user_id, &name)).await
    }

    async fn find_persona_by_name(&self, name: &str) -> Result<Option<Persona>> {
        let name = name.to_string();
        self.run(move |conn| {
            let sql = format!("{} WHERE name = ?1 ORDER BY id LIMIT 1", PERSONA_COLUMNS);
            Ok(conn.query_row(&sql, params![name], persona_from_row).optional()?)
        })
        .await
    }

    async fn list_personas(&self, owner_user_id: i64) -> Result<Vec<Persona>> {
        self.run(move |conn| {
            let sql = format!("{} WHERE owner_user_id = ?1 ORDER BY name", PERSONA_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![owner_user_id], persona_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl MessageLog for SqliteStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage> {
        self.run(move |conn| {
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO messages
                    (sender_user_id, persona_id, content, speaker, is_from_user, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.sender_user_id,
                    message.persona_id,
                    message.content,
                    message.speaker,
                    message.is_from_user(),
                    created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;

            Ok(StoredMessage {
                id: conn.last_insert_rowid(),
                is_from_user: message.is_from_user(),
                sender_user_id: message.sender_user_id,
                persona_id: message.persona_id,
                content: message.content,
                speaker: message.speaker,
                created_at,
            })
        })
        .await
    }

    async fn history(&self, persona_id: i64, limit: usize) -> Result<Vec<StoredMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let sql = format!(
                "{} WHERE persona_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![persona_id, limit], message_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
