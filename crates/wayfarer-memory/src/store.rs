use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use crate::migrations::run_migrations;
use crate::models::{Conversation, MessageRole, NewMessage, StoredMessage, ToolCallRecord};

/// Durable append-only log of conversations and their messages.
///
/// Implementations must be safe for concurrent use without external locking.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_or_create_conversation(&self, user_id: &str) -> Result<Conversation>;
    async fn get_conversation(&self, user_id: &str) -> Result<Option<Conversation>>;
    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage>;
    /// The most recent `limit` messages, returned oldest first.
    async fn fetch_last_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;
    async fn update_context(&self, conversation_id: Uuid, context: serde_json::Value)
        -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening conversation store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get_or_create_conversation(&self, user_id: &str) -> Result<Conversation> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = Utc::now().to_rfc3339();
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO conversations (id, user_id, created_at, last_activity, context)
                VALUES (?1, ?2, ?3, ?3, '{}')
                "#,
                params![Uuid::new_v4().to_string(), user_id, now],
            )?;
            if inserted > 0 {
                tracing::debug!(user_id = %user_id, "created conversation");
            }
            let conversation = conn.query_row(
                r#"
                SELECT id, user_id, created_at, last_activity, context
                FROM conversations WHERE user_id = ?1
                "#,
                params![user_id],
                row_to_conversation,
            )?;
            Ok::<Conversation, anyhow::Error>(conversation)
        })
        .await?
    }

    async fn get_conversation(&self, user_id: &str) -> Result<Option<Conversation>> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let conversation = conn
                .query_row(
                    r#"
                    SELECT id, user_id, created_at, last_activity, context
                    FROM conversations WHERE user_id = ?1
                    "#,
                    params![user_id],
                    row_to_conversation,
                )
                .optional()?;
            Ok::<Option<Conversation>, anyhow::Error>(conversation)
        })
        .await?
    }

    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let tool_call = message
                .tool_call
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            let conversation_id = message.conversation_id.to_string();

            let (last_seq, last_us): (Option<i64>, Option<i64>) = tx.query_row(
                "SELECT MAX(seq), MAX(created_at_us) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let seq = last_seq.map_or(0, |s| s + 1);
            let now_us = Utc::now().timestamp_micros();
            let created_at_us = match last_us {
                Some(prev) if prev >= now_us => prev + 1,
                _ => now_us,
            };
            let id = Uuid::new_v4();

            tx.execute(
                r#"
                INSERT INTO messages (id, conversation_id, seq, role, content, tool_call, created_at_us)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    id.to_string(),
                    conversation_id,
                    seq,
                    message.role.as_str(),
                    message.content,
                    tool_call,
                    created_at_us,
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET last_activity = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), conversation_id],
            )?;
            tx.commit()?;

            Ok::<StoredMessage, anyhow::Error>(StoredMessage {
                id,
                conversation_id: message.conversation_id,
                seq,
                role: message.role,
                content: message.content,
                tool_call: message.tool_call,
                created_at: micros_to_datetime(created_at_us),
            })
        })
        .await?
    }

    async fn fetch_last_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, conversation_id, seq, role, content, tool_call, created_at_us
                FROM messages
                WHERE conversation_id = ?1
                ORDER BY created_at_us DESC, seq DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), limit as i64],
                row_to_message,
            )?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages.reverse();
            Ok::<Vec<StoredMessage>, anyhow::Error>(messages)
        })
        .await?
    }

    async fn update_context(
        &self,
        conversation_id: Uuid,
        context: serde_json::Value,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let raw = serde_json::to_string(&context)?;
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let updated = conn.execute(
                "UPDATE conversations SET context = ?1 WHERE id = ?2",
                params![raw, conversation_id.to_string()],
            )?;
            if updated == 0 {
                anyhow::bail!("conversation not found: {conversation_id}");
            }
            Ok::<(), anyhow::Error>(())
        })
        .await?
    }
}

fn micros_to_datetime(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let id_raw: String = row.get(0)?;
    let created_raw: String = row.get(2)?;
    let last_raw: String = row.get(3)?;
    let context_raw: String = row.get(4)?;

    Ok(Conversation {
        id: parse_uuid_sql(&id_raw)?,
        user_id: row.get(1)?,
        created_at: parse_datetime_sql(&created_raw)?,
        last_activity: parse_datetime_sql(&last_raw)?,
        context: serde_json::from_str(&context_raw).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_raw: String = row.get(0)?;
    let conversation_raw: String = row.get(1)?;
    let role_raw: String = row.get(3)?;
    let tool_raw: Option<String> = row.get(5)?;
    let tool_call: Option<ToolCallRecord> =
        tool_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(StoredMessage {
        id: parse_uuid_sql(&id_raw)?,
        conversation_id: parse_uuid_sql(&conversation_raw)?,
        seq: row.get(2)?,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::System),
        content: row.get(4)?,
        tool_call,
        created_at: micros_to_datetime(row.get(6)?),
    })
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid_sql(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_returns_same_conversation() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let first = store.get_or_create_conversation("u1").await.unwrap();
        let second = store.get_or_create_conversation("u1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.user_id, "u1");

        let other = store.get_or_create_conversation("u2").await.unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn get_conversation_is_none_before_first_contact() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        assert!(store.get_conversation("ghost").await.unwrap().is_none());
        store.get_or_create_conversation("ghost").await.unwrap();
        assert!(store.get_conversation("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn appended_messages_are_strictly_ordered() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let conv = store.get_or_create_conversation("u1").await.unwrap();

        let mut written = Vec::new();
        for i in 0..20 {
            let msg = store
                .append_message(NewMessage::text(conv.id, MessageRole::User, format!("m{i}")))
                .await
                .unwrap();
            written.push(msg);
        }

        for pair in written.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
            assert_eq!(pair[0].seq + 1, pair[1].seq);
        }
    }

    #[tokio::test]
    async fn fetch_last_returns_oldest_first() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let conv = store.get_or_create_conversation("u1").await.unwrap();
        for i in 0..5 {
            store
                .append_message(NewMessage::text(conv.id, MessageRole::User, format!("m{i}")))
                .await
                .unwrap();
        }

        let last = store.fetch_last_messages(conv.id, 3).await.unwrap();
        let texts: Vec<_> = last.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn tool_records_round_trip() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let conv = store.get_or_create_conversation("u1").await.unwrap();
        let record = ToolCallRecord {
            tool: "record_expense".into(),
            args_summary: r#"{"amount":12.5}"#.into(),
            ok: true,
            result_preview: "recorded".into(),
        };
        store
            .append_message(NewMessage::tool(conv.id, record.clone()))
            .await
            .unwrap();

        let fetched = store.fetch_last_messages(conv.id, 10).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].role, MessageRole::Tool);
        assert_eq!(fetched[0].tool_call.as_ref(), Some(&record));
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_fails() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let result = store
            .append_message(NewMessage::text(Uuid::new_v4(), MessageRole::User, "orphan"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_context_persists_json() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        let conv = store.get_or_create_conversation("u1").await.unwrap();
        store
            .update_context(conv.id, serde_json::json!({"units": "imperial"}))
            .await
            .unwrap();
        let reloaded = store.get_conversation("u1").await.unwrap().unwrap();
        assert_eq!(reloaded.context["units"], "imperial");

        assert!(store
            .update_context(Uuid::new_v4(), serde_json::json!({}))
            .await
            .is_err());
    }
}
