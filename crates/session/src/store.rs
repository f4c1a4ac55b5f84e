//! SQLite-backed session store.
//!
//! Two tables:
//! - `conversations` — one row per session header (owner, created, last activity)
//! - `messages` — append-only rows ordered by an autoincrement sequence
//!
//! Consistency is delegated to SQLite's per-statement transaction semantics.
//! Two concurrent saves for the same user racing the find-or-create step may
//! create two active conversations; that weak consistency is accepted.

use chrono::{DateTime, SecondsFormat, Utc};
use mealmind_core::error::SessionError;
use mealmind_core::message::{Message, MessageContent, Role};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Expiry and trimming policy for stored conversations.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Inactivity duration after which a conversation is expired.
    pub ttl: chrono::Duration,
    /// Maximum retained messages per conversation.
    pub max_messages: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::hours(8),
            max_messages: 100,
        }
    }
}

/// A reconstructed active session.
#[derive(Debug)]
pub struct LoadedSession {
    /// The conversation this history belongs to.
    pub conversation_id: String,
    /// Ordered history; each message carries its optional display text.
    pub messages: Vec<Message>,
}

/// The durable session store.
pub struct SessionStore {
    pool: SqlitePool,
    policy: SessionPolicy,
}

impl SessionStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database
    /// (useful for tests).
    pub async fn new(path: &str, policy: SessionPolicy) -> Result<Self, SessionError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| SessionError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool, policy };
        store.run_migrations().await?;
        info!("Session store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool, policy: SessionPolicy) -> Result<Self, SessionError> {
        let store = Self { pool, policy };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), SessionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                last_activity TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Migration(format!("conversations table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role            TEXT NOT NULL,
                content         TEXT NOT NULL,
                display         TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Migration(format!("messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user
             ON conversations(user_id, last_activity DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Migration(format!("user index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Migration(format!("message index: {e}")))?;

        debug!("Session store migrations complete");
        Ok(())
    }

    /// Load the user's active conversation, if any.
    ///
    /// Returns `Ok(None)` when there is no conversation within the TTL —
    /// that means "start fresh", not an error. Messages whose stored payload
    /// no longer deserializes are skipped with a warning; partial history is
    /// preferable to no history.
    pub async fn load_active(&self, user_id: &str) -> Result<Option<LoadedSession>, SessionError> {
        let Some(conversation_id) = self.find_active(user_id, Utc::now()).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT role, content, display, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )
        .bind(&conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SessionError::Query(format!("message load: {e}")))?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_message(row) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "Skipping undeserializable message");
                }
            }
        }

        debug!(
            conversation_id = %conversation_id,
            messages = messages.len(),
            "Loaded active session"
        );

        Ok(Some(LoadedSession { conversation_id, messages }))
    }

    /// Append a completed turn's messages to the user's active conversation,
    /// creating a new conversation if the old one has expired.
    pub async fn save_turn(&self, user_id: &str, messages: &[Message]) -> Result<(), SessionError> {
        let now = Utc::now();
        let conversation_id = match self.find_active(user_id, now).await? {
            Some(id) => {
                sqlx::query("UPDATE conversations SET last_activity = ?1 WHERE id = ?2")
                    .bind(format_ts(now))
                    .bind(&id)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| SessionError::Storage(format!("activity bump: {e}")))?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO conversations (id, user_id, created_at, last_activity)
                     VALUES (?1, ?2, ?3, ?3)",
                )
                .bind(&id)
                .bind(user_id)
                .bind(format_ts(now))
                .execute(&self.pool)
                .await
                .map_err(|e| SessionError::Storage(format!("conversation insert: {e}")))?;
                debug!(conversation_id = %id, user_id, "Started new conversation");
                id
            }
        };

        for msg in messages {
            let content = serde_json::to_string(&msg.content)
                .map_err(|e| SessionError::Storage(format!("content serialization: {e}")))?;
            sqlx::query(
                "INSERT INTO messages (conversation_id, role, content, display, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&conversation_id)
            .bind(msg.role.as_str())
            .bind(&content)
            .bind(&msg.display)
            .bind(format_ts(msg.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Storage(format!("message insert: {e}")))?;
        }

        self.trim(&conversation_id).await
    }

    /// Delete all conversations (and their messages) owned by the user.
    pub async fn clear(&self, user_id: &str) -> Result<(), SessionError> {
        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN
             (SELECT id FROM conversations WHERE user_id = ?1)",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Storage(format!("message clear: {e}")))?;

        let result = sqlx::query("DELETE FROM conversations WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Storage(format!("conversation clear: {e}")))?;

        debug!(user_id, conversations = result.rows_affected(), "Cleared sessions");
        Ok(())
    }

    /// Find the most recently active conversation within the TTL.
    ///
    /// The TTL check happens in Rust after fetching the newest row, so the
    /// comparison never depends on string ordering of timestamps.
    async fn find_active(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, SessionError> {
        let row = sqlx::query(
            "SELECT id, last_activity FROM conversations
             WHERE user_id = ?1 ORDER BY last_activity DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SessionError::Query(format!("active lookup: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: String = row
            .try_get("id")
            .map_err(|e| SessionError::Query(format!("id column: {e}")))?;
        let last_activity: String = row
            .try_get("last_activity")
            .map_err(|e| SessionError::Query(format!("last_activity column: {e}")))?;

        let last_activity = DateTime::parse_from_rfc3339(&last_activity)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SessionError::Query(format!("last_activity parse: {e}")))?;

        if now - last_activity <= self.policy.ttl {
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    /// Delete the oldest messages above the retained cap, preserving the
    /// relative order of survivors.
    async fn trim(&self, conversation_id: &str) -> Result<(), SessionError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SessionError::Query(format!("message count: {e}")))?;
        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| SessionError::Query(format!("cnt column: {e}")))?;

        let excess = count - i64::from(self.policy.max_messages);
        if excess <= 0 {
            return Ok(());
        }

        sqlx::query(
            "DELETE FROM messages WHERE seq IN
             (SELECT seq FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC LIMIT ?2)",
        )
        .bind(conversation_id)
        .bind(excess)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionError::Storage(format!("trim: {e}")))?;

        debug!(conversation_id, trimmed = excess, "Trimmed oldest messages");
        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, SessionError> {
        let role_str: String = row
            .try_get("role")
            .map_err(|e| SessionError::Query(format!("role column: {e}")))?;
        let role = Role::parse(&role_str)
            .ok_or_else(|| SessionError::Query(format!("unknown role: {role_str}")))?;

        let content_json: String = row
            .try_get("content")
            .map_err(|e| SessionError::Query(format!("content column: {e}")))?;
        let content: MessageContent = serde_json::from_str(&content_json)
            .map_err(|e| SessionError::Query(format!("content deserialization: {e}")))?;

        let display: Option<String> = row
            .try_get("display")
            .map_err(|e| SessionError::Query(format!("display column: {e}")))?;

        let created_at_str: String = row
            .try_get("created_at")
            .map_err(|e| SessionError::Query(format!("created_at column: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Message { role, content, display, created_at })
    }
}

/// Fixed-width RFC 3339 so lexicographic `ORDER BY` agrees with time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
