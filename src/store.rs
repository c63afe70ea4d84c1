//! SQLite persistence gateway for channels, conversations, and messages.
//!
//! The ingestion pipeline exclusively owns the create-or-update decision for
//! conversations and messages; adapters reach this module only through the
//! pipeline's outbound bookkeeping path.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

use crate::error::Result;
use crate::model::{
    Channel, ContentKind, Conversation, ConversationStatus, DeliveryStatus, Direction,
    MessageRecord,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    config      TEXT,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id      INTEGER NOT NULL REFERENCES channels(id),
    external_id     TEXT NOT NULL,
    contact_name    TEXT,
    contact_info    TEXT,
    status          TEXT NOT NULL DEFAULT 'open',
    metadata        TEXT,
    last_message_at TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(channel_id, external_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id     INTEGER NOT NULL REFERENCES conversations(id),
    channel_id          INTEGER NOT NULL REFERENCES channels(id),
    external_message_id TEXT,
    direction           TEXT NOT NULL,
    kind                TEXT NOT NULL DEFAULT 'text',
    content             TEXT NOT NULL,
    media_url           TEXT,
    status              TEXT NOT NULL DEFAULT 'sent',
    metadata            TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_conversations_last_message ON conversations(last_message_at);
"#;

// ---------------------------------------------------------------------------
// Row tuples
// ---------------------------------------------------------------------------

type ChannelRow = (
    i64,
    String,
    String,
    Option<String>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

type ConversationRow = (
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
);

type MessageRow = (
    i64,
    i64,
    i64,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const CONVERSATION_COLUMNS: &str = "id, channel_id, external_id, contact_name, contact_info, \
     status, metadata, last_message_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, channel_id, external_message_id, direction, \
     kind, content, media_url, status, metadata, created_at, updated_at";

fn channel_from_row(row: ChannelRow) -> Channel {
    Channel {
        id: row.0,
        name: row.1,
        kind: row.2,
        config: parse_json_column(row.3),
        active: row.4,
        created_at: row.5,
        updated_at: row.6,
    }
}

fn conversation_from_row(row: ConversationRow) -> Conversation {
    Conversation {
        id: row.0,
        channel_id: row.1,
        external_id: row.2,
        contact_name: row.3,
        contact_info: parse_json_column(row.4),
        status: ConversationStatus::parse(&row.5),
        metadata: parse_json_column(row.6),
        last_message_at: row.7,
        created_at: row.8,
        updated_at: row.9,
    }
}

fn message_from_row(row: MessageRow) -> MessageRecord {
    MessageRecord {
        id: row.0,
        conversation_id: row.1,
        channel_id: row.2,
        external_message_id: row.3,
        direction: Direction::parse(&row.4),
        kind: ContentKind::parse(&row.5),
        content: row.6,
        media_url: row.7,
        status: DeliveryStatus::from_provider(&row.8),
        metadata: parse_json_column(row.9),
        created_at: row.10,
        updated_at: row.11,
    }
}

fn parse_json_column(raw: Option<String>) -> Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(Value::Null)
}

fn json_column(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Parameters for inserting a message row.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    /// Owning conversation
    pub conversation_id: i64,
    /// Owning channel
    pub channel_id: i64,
    /// Provider-assigned message id, when known
    pub external_message_id: Option<&'a str>,
    /// Inbound or outbound
    pub direction: Direction,
    /// Canonical content kind
    pub kind: ContentKind,
    /// Textual content
    pub content: &'a str,
    /// Media reference, when present
    pub media_url: Option<&'a str>,
    /// Initial delivery status
    pub status: DeliveryStatus,
    /// Free-form metadata
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// SQLite-backed persistence gateway.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    /// Open a store backed by a file, creating it and the schema if needed.
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory store for testing.
    ///
    /// Pinned to a single connection so every query sees the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the underlying pool. Subsequent operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Channels -----------------------------------------------------------

    /// Insert a channel row (administrative setup and tests).
    pub async fn create_channel(
        &self,
        name: &str,
        kind: &str,
        config: &Value,
        active: bool,
    ) -> Result<Channel> {
        let now = Utc::now();
        let row: ChannelRow = sqlx::query_as(
            "INSERT INTO channels (name, kind, config, active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             RETURNING id, name, kind, config, active, created_at, updated_at",
        )
        .bind(name)
        .bind(kind)
        .bind(json_column(config))
        .bind(active)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(channel_from_row(row))
    }

    /// Load a channel by database id.
    pub async fn channel_by_id(&self, id: i64) -> Result<Option<Channel>> {
        let row: Option<ChannelRow> = sqlx::query_as(
            "SELECT id, name, kind, config, active, created_at, updated_at \
             FROM channels WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(channel_from_row))
    }

    /// Load a channel by its unique name.
    pub async fn channel_by_name(&self, name: &str) -> Result<Option<Channel>> {
        let row: Option<ChannelRow> = sqlx::query_as(
            "SELECT id, name, kind, config, active, created_at, updated_at \
             FROM channels WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(channel_from_row))
    }

    /// List every configured channel.
    pub async fn channels_all(&self) -> Result<Vec<Channel>> {
        let rows: Vec<ChannelRow> = sqlx::query_as(
            "SELECT id, name, kind, config, active, created_at, updated_at \
             FROM channels ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(channel_from_row).collect())
    }

    // -- Conversations ------------------------------------------------------

    /// Find the existing conversation for `(channel_id, external_id)` or
    /// create one, atomically.
    ///
    /// Implemented as a single upsert guarded by the table's uniqueness
    /// constraint, so concurrent inbound bursts for an unseen correspondent
    /// still produce exactly one row. `contact_name` and `metadata` seed a
    /// newly created row only; an existing row is left untouched apart from
    /// its update timestamp.
    pub async fn resolve_or_create_conversation(
        &self,
        channel_id: i64,
        external_id: &str,
        contact_name: Option<&str>,
        metadata: &Value,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let row: ConversationRow = sqlx::query_as(&format!(
            "INSERT INTO conversations \
                 (channel_id, external_id, contact_name, status, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?5) \
             ON CONFLICT(channel_id, external_id) DO UPDATE SET updated_at = excluded.updated_at \
             RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(channel_id)
        .bind(external_id)
        .bind(contact_name)
        .bind(json_column(metadata))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(conversation_from_row(row))
    }

    /// Load a conversation by database id.
    pub async fn conversation_by_id(&self, id: i64) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(conversation_from_row))
    }

    /// Look up a conversation by its correspondent identity.
    pub async fn conversation_by_external_id(
        &self,
        channel_id: i64,
        external_id: &str,
    ) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE channel_id = ?1 AND external_id = ?2"
        ))
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(conversation_from_row))
    }

    /// Update a conversation's last-message timestamp.
    pub async fn touch_conversation(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET last_message_at = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update a conversation's lifecycle status (administrative surface).
    pub async fn update_conversation_status(
        &self,
        id: i64,
        status: ConversationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Messages -----------------------------------------------------------

    /// Insert a message row.
    pub async fn insert_message(&self, msg: NewMessage<'_>) -> Result<MessageRecord> {
        let now = Utc::now();
        let row: MessageRow = sqlx::query_as(&format!(
            "INSERT INTO messages \
                 (conversation_id, channel_id, external_message_id, direction, kind, content, \
                  media_url, status, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(msg.conversation_id)
        .bind(msg.channel_id)
        .bind(msg.external_message_id)
        .bind(msg.direction.as_str())
        .bind(msg.kind.as_str())
        .bind(msg.content)
        .bind(msg.media_url)
        .bind(msg.status.as_str())
        .bind(json_column(&msg.metadata))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(message_from_row(row))
    }

    /// List messages of a conversation, newest first.
    pub async fn messages_by_conversation(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    /// Update a message's delivery status (administrative surface; the
    /// ingestion pipeline does not correlate status updates to rows).
    pub async fn update_message_status(&self, id: i64, status: DeliveryStatus) -> Result<()> {
        sqlx::query("UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
