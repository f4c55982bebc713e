//! SQLite 存储实现（sqlx，异步）
//!
//! 两张表：chat_sessions 与 conversations；metadata / reflection_steps 以 JSON 文本落盘。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::ChatError;
use crate::store::types::{
    ChatSession, ConversationEntry, EntryRole, EntryStatus, Metadata, ReasoningStep,
};
use crate::store::ChatStore;

/// SQLite 存储：连接池 + 建表
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT,
                reflection_steps TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user ON chat_sessions(user_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> ChatSession {
        ChatSession {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            created_at: millis_to_utc(row.get("created_at")),
            updated_at: millis_to_utc(row.get("updated_at")),
            is_active: row.get::<i64, _>("is_active") != 0,
        }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> ConversationEntry {
        ConversationEntry {
            id: row.get("id"),
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            role: EntryRole::parse(row.get::<String, _>("role").as_str()),
            content: row.get("content"),
            status: EntryStatus::parse(row.get::<String, _>("status").as_str()),
            metadata: row
                .get::<Option<String>, _>("metadata")
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            reflection_steps: row
                .get::<Option<String>, _>("reflection_steps")
                .and_then(|s| serde_json::from_str(&s).ok()),
            created_at: millis_to_utc(row.get("created_at")),
            updated_at: millis_to_utc(row.get("updated_at")),
        }
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn persistence(e: sqlx::Error) -> ChatError {
    ChatError::Persistence(e.to_string())
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn insert_session(&self, session: ChatSession) -> Result<ChatSession, ChatError> {
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at, is_active)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(session.created_at.timestamp_millis())
        .bind(session.updated_at.timestamp_millis())
        .bind(session.is_active as i64)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(session)
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatSession>, ChatError> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(row.as_ref().map(Self::row_to_session))
    }

    async fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ChatSession>, ChatError> {
        let sql = if active_only {
            "SELECT * FROM chat_sessions WHERE user_id = ? AND is_active = 1 ORDER BY updated_at DESC"
        } else {
            "SELECT * FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC"
        };
        let rows = sqlx::query(sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(rows.iter().map(Self::row_to_session).collect())
    }

    async fn touch_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let result =
            sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ? AND user_id = ?")
                .bind(Utc::now().timestamp_millis())
                .bind(session_id)
                .bind(user_id)
                .execute(&self.pool)
                .await
                .map_err(persistence)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_session_active(
        &self,
        session_id: &str,
        user_id: &str,
        active: bool,
    ) -> Result<bool, ChatError> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET is_active = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(active as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        sqlx::query("DELETE FROM conversations WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_entry(&self, entry: ConversationEntry) -> Result<String, ChatError> {
        let metadata = serde_json::to_string(&entry.metadata).ok();
        let steps = entry
            .reflection_steps
            .as_ref()
            .and_then(|s| serde_json::to_string(s).ok());
        sqlx::query(
            "INSERT INTO conversations
             (id, session_id, user_id, role, content, status, metadata, reflection_steps, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.session_id)
        .bind(&entry.user_id)
        .bind(entry.role.as_str())
        .bind(&entry.content)
        .bind(entry.status.as_str())
        .bind(&metadata)
        .bind(&steps)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(entry.id)
    }

    async fn get_entry(
        &self,
        entry_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationEntry>, ChatError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ? AND user_id = ?")
            .bind(entry_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(row.as_ref().map(Self::row_to_entry))
    }

    async fn find_entry(&self, entry_id: &str) -> Result<Option<ConversationEntry>, ChatError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(row.as_ref().map(Self::row_to_entry))
    }

    async fn list_entries(
        &self,
        session_id: &str,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationEntry>, ChatError> {
        let rows = match limit {
            Some(n) => sqlx::query(
                "SELECT * FROM conversations WHERE session_id = ? AND user_id = ?
                 ORDER BY created_at ASC LIMIT ?",
            )
            .bind(session_id)
            .bind(user_id)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?,
            None => sqlx::query(
                "SELECT * FROM conversations WHERE session_id = ? AND user_id = ?
                 ORDER BY created_at ASC",
            )
            .bind(session_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?,
        };
        Ok(rows.iter().map(Self::row_to_entry).collect())
    }

    async fn set_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
    ) -> Result<(), ChatError> {
        let result = sqlx::query("UPDATE conversations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("entry {}", entry_id)));
        }
        Ok(())
    }

    async fn set_entry_steps(
        &self,
        entry_id: &str,
        steps: &[ReasoningStep],
    ) -> Result<(), ChatError> {
        let json = serde_json::to_string(steps)
            .map_err(|e| ChatError::Persistence(e.to_string()))?;
        let result =
            sqlx::query("UPDATE conversations SET reflection_steps = ?, updated_at = ? WHERE id = ?")
                .bind(&json)
                .bind(Utc::now().timestamp_millis())
                .bind(entry_id)
                .execute(&self.pool)
                .await
                .map_err(persistence)?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("entry {}", entry_id)));
        }
        Ok(())
    }

    async fn finalize_entry(
        &self,
        entry_id: &str,
        content: &str,
        status: EntryStatus,
        metadata: Option<&Metadata>,
        steps: Option<&[ReasoningStep]>,
    ) -> Result<(), ChatError> {
        let metadata_json = metadata.and_then(|m| serde_json::to_string(m).ok());
        let steps_json = steps.and_then(|s| serde_json::to_string(s).ok());
        let result = sqlx::query(
            "UPDATE conversations SET
                content = ?,
                status = ?,
                metadata = COALESCE(?, metadata),
                reflection_steps = COALESCE(?, reflection_steps),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(content)
        .bind(status.as_str())
        .bind(&metadata_json)
        .bind(&steps_json)
        .bind(Utc::now().timestamp_millis())
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        if result.rows_affected() == 0 {
            return Err(ChatError::NotFound(format!("entry {}", entry_id)));
        }
        Ok(())
    }
}
