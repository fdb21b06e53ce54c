//! SQLite storage for message history and settings

use async_trait::async_trait;
use meshgate_core::{AckStatus, Direction, HistoryQuery, MessageRecord, PersistenceGateway};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Result, StateError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        packet_id INTEGER,
        sender TEXT NOT NULL,
        receiver TEXT,
        channel INTEGER NOT NULL DEFAULT 0,
        text TEXT NOT NULL,
        direction TEXT NOT NULL,
        ack_status TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_packet_id ON messages(packet_id)",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel)",
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

const SELECT_MESSAGES: &str = "SELECT id, packet_id, sender, receiver, channel, text, direction, ack_status, timestamp FROM messages";

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))
            .map_err(|e| StateError::Connection(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(%path, "Message store opened");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self> {
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StateError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    /// Store a message and return its row id
    pub async fn insert_message(&self, record: &MessageRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (packet_id, sender, receiver, channel, text, direction, ack_status, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.packet_id.map(i64::from))
        .bind(&record.sender)
        .bind(&record.receiver)
        .bind(i64::from(record.channel))
        .bind(&record.text)
        .bind(direction_str(record.direction))
        .bind(record.ack_status.as_str())
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id, packet_id = ?record.packet_id, "Message stored");
        Ok(id)
    }

    /// Set the ack status of every message with `packet_id`
    ///
    /// Rows already in `status` are left alone, so repeating an update
    /// changes nothing. Returns whether any row changed.
    pub async fn set_ack_status(&self, packet_id: u32, status: AckStatus) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET ack_status = ? WHERE packet_id = ? AND ack_status != ?")
                .bind(status.as_str())
                .bind(i64::from(packet_id))
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;

        let changed = result.rows_affected() > 0;
        debug!(packet_id, status = status.as_str(), changed, "Ack status updated");
        Ok(changed)
    }

    /// Messages matching `query`, oldest first
    pub async fn query_messages(&self, query: &HistoryQuery) -> Result<Vec<MessageRecord>> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = match (&query.dm_partner, &query.my_node_id, query.channel) {
            (Some(partner), Some(me), _) => {
                sqlx::query(&format!(
                    "{} WHERE (sender = ? AND receiver = ?) OR (sender = ? AND receiver = ?) ORDER BY id DESC LIMIT ?",
                    SELECT_MESSAGES
                ))
                .bind(partner)
                .bind(me)
                .bind(me)
                .bind(partner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(partner), None, _) => {
                sqlx::query(&format!(
                    "{} WHERE sender = ? OR receiver = ? ORDER BY id DESC LIMIT ?",
                    SELECT_MESSAGES
                ))
                .bind(partner)
                .bind(partner)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, _, Some(channel)) => {
                sqlx::query(&format!(
                    "{} WHERE channel = ? AND receiver IS NULL ORDER BY id DESC LIMIT ?",
                    SELECT_MESSAGES
                ))
                .bind(i64::from(channel))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, _, None) => {
                sqlx::query(&format!("{} ORDER BY id DESC LIMIT ?", SELECT_MESSAGES))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    /// Read a setting
    pub async fn setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    /// Write a setting
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of stored messages
    pub async fn message_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::Incoming => "incoming",
        Direction::Outgoing => "outgoing",
    }
}

fn row_to_record(row: &SqliteRow) -> Result<MessageRecord> {
    let direction: String = row.try_get("direction")?;
    let direction = match direction.as_str() {
        "incoming" => Direction::Incoming,
        "outgoing" => Direction::Outgoing,
        other => return Err(StateError::InvalidData(format!("direction '{}'", other))),
    };

    let ack_status: String = row.try_get("ack_status")?;
    let ack_status = AckStatus::parse(&ack_status)
        .ok_or_else(|| StateError::InvalidData(format!("ack_status '{}'", ack_status)))?;

    let packet_id: Option<i64> = row.try_get("packet_id")?;
    let channel: i64 = row.try_get("channel")?;

    Ok(MessageRecord {
        id: Some(row.try_get("id")?),
        packet_id: packet_id.and_then(|id| u32::try_from(id).ok()),
        sender: row.try_get("sender")?,
        receiver: row.try_get("receiver")?,
        channel: u32::try_from(channel)
            .map_err(|_| StateError::InvalidData(format!("channel {}", channel)))?,
        text: row.try_get("text")?,
        direction,
        ack_status,
        timestamp: row.try_get("timestamp")?,
    })
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn save_message(&self, record: &MessageRecord) -> meshgate_core::Result<i64> {
        Ok(self.insert_message(record).await?)
    }

    async fn update_ack(&self, packet_id: u32, status: AckStatus) -> meshgate_core::Result<bool> {
        Ok(self.set_ack_status(packet_id, status).await?)
    }

    async fn get_messages(
        &self,
        query: &HistoryQuery,
    ) -> meshgate_core::Result<Vec<MessageRecord>> {
        Ok(self.query_messages(query).await?)
    }

    async fn get_setting(&self, key: &str) -> meshgate_core::Result<Option<String>> {
        Ok(self.setting(key).await?)
    }

    async fn save_setting(&self, key: &str, value: &str) -> meshgate_core::Result<()> {
        Ok(self.set_setting(key, value).await?)
    }
}
