//! 内存存储实现
//!
//! 条目以插入顺序保存（与 created_at 正序一致），供单进程部署与测试使用。

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::ChatError;
use crate::store::types::{
    ChatSession, ConversationEntry, EntryStatus, Metadata, ReasoningStep,
};
use crate::store::ChatStore;

#[derive(Default)]
struct Inner {
    sessions: Vec<ChatSession>,
    entries: Vec<ConversationEntry>,
}

/// 内存存储：RwLock 包裹的会话与条目表
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn insert_session(&self, session: ChatSession) -> Result<ChatSession, ChatError> {
        let mut inner = self.inner.write().await;
        inner.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatSession>, ChatError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .iter()
            .find(|s| s.id == session_id && s.user_id == user_id)
            .cloned())
    }

    async fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ChatSession>, ChatError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<_> = inner
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && (!active_only || s.is_active))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn touch_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let mut inner = self.inner.write().await;
        match inner
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.user_id == user_id)
        {
            Some(s) => {
                s.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_session_active(
        &self,
        session_id: &str,
        user_id: &str,
        active: bool,
    ) -> Result<bool, ChatError> {
        let mut inner = self.inner.write().await;
        match inner
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.user_id == user_id)
        {
            Some(s) => {
                s.is_active = active;
                s.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let mut inner = self.inner.write().await;
        inner
            .entries
            .retain(|e| !(e.session_id == session_id && e.user_id == user_id));
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|s| !(s.id == session_id && s.user_id == user_id));
        Ok(inner.sessions.len() < before)
    }

    async fn insert_entry(&self, entry: ConversationEntry) -> Result<String, ChatError> {
        let id = entry.id.clone();
        let mut inner = self.inner.write().await;
        inner.entries.push(entry);
        Ok(id)
    }

    async fn get_entry(
        &self,
        entry_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationEntry>, ChatError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .find(|e| e.id == entry_id && e.user_id == user_id)
            .cloned())
    }

    async fn find_entry(&self, entry_id: &str) -> Result<Option<ConversationEntry>, ChatError> {
        let inner = self.inner.read().await;
        Ok(inner.entries.iter().find(|e| e.id == entry_id).cloned())
    }

    async fn list_entries(
        &self,
        session_id: &str,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationEntry>, ChatError> {
        let inner = self.inner.read().await;
        let iter = inner
            .entries
            .iter()
            .filter(|e| e.session_id == session_id && e.user_id == user_id)
            .cloned();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    async fn set_entry_status(
        &self,
        entry_id: &str,
        status: EntryStatus,
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| ChatError::NotFound(format!("entry {}", entry_id)))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn set_entry_steps(
        &self,
        entry_id: &str,
        steps: &[ReasoningStep],
    ) -> Result<(), ChatError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| ChatError::NotFound(format!("entry {}", entry_id)))?;
        entry.reflection_steps = Some(steps.to_vec());
        entry.updated_at = Utc::now();
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
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| ChatError::NotFound(format!("entry {}", entry_id)))?;
        entry.content = content.to_string();
        entry.status = status;
        if let Some(m) = metadata {
            entry.metadata = m.clone();
        }
        if let Some(s) = steps {
            entry.reflection_steps = Some(s.to_vec());
        }
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::EntryRole;

    #[tokio::test]
    async fn test_session_crud() {
        let store = MemoryChatStore::new();
        let session = store
            .insert_session(ChatSession::new("user_1", Some("Plano Q3".into())))
            .await
            .unwrap();

        assert!(store.get_session(&session.id, "user_1").await.unwrap().is_some());
        assert!(store.get_session(&session.id, "user_2").await.unwrap().is_none());

        assert!(store.set_session_active(&session.id, "user_1", false).await.unwrap());
        let listed = store.list_sessions("user_1", true).await.unwrap();
        assert!(listed.is_empty());
        let all = store.list_sessions("user_1", false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_session_removes_entries() {
        let store = MemoryChatStore::new();
        let session = store
            .insert_session(ChatSession::new("user_1", None))
            .await
            .unwrap();
        store
            .insert_entry(ConversationEntry::new(&session.id, "user_1", EntryRole::User, "oi"))
            .await
            .unwrap();

        assert!(store.delete_session(&session.id, "user_1").await.unwrap());
        let entries = store.list_entries(&session.id, "user_1", None).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_status_idempotent() {
        let store = MemoryChatStore::new();
        let session = store
            .insert_session(ChatSession::new("user_1", None))
            .await
            .unwrap();
        let id = store
            .insert_entry(
                ConversationEntry::new(&session.id, "user_1", EntryRole::Assistant, "resposta")
                    .with_status(EntryStatus::Complete),
            )
            .await
            .unwrap();

        store.set_entry_status(&id, EntryStatus::Complete).await.unwrap();
        store.set_entry_status(&id, EntryStatus::Complete).await.unwrap();

        let entry = store.get_entry(&id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.content, "resposta");
        assert_eq!(entry.status, EntryStatus::Complete);
        assert!(entry.reflection_steps.is_none());
    }

    #[tokio::test]
    async fn test_list_entries_limit_takes_oldest() {
        let store = MemoryChatStore::new();
        let session = store
            .insert_session(ChatSession::new("user_1", None))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .insert_entry(ConversationEntry::new(
                    &session.id,
                    "user_1",
                    EntryRole::User,
                    format!("m{}", i),
                ))
                .await
                .unwrap();
        }

        let limited = store.list_entries(&session.id, "user_1", Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].content, "m0");
        assert_eq!(limited[1].content, "m1");
    }
}
