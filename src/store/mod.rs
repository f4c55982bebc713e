//! 持久化边界
//!
//! 定义统一的存储接口，支持内存和 SQLite 两种实现。存储是事实来源（source of
//! truth）：ContextWindow 只是按轮次重建的缓存。接口假定 last-write-wins，
//! 不做跨表事务。

use std::sync::Arc;

use async_trait::async_trait;

pub mod memory;
pub mod types;

#[cfg(feature = "async-sqlite")]
pub mod sqlite;

pub use memory::MemoryChatStore;
pub use types::{
    ChatSession, ConversationEntry, EntryRole, EntryStatus, Metadata, ReasoningStep, StepType,
};

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteChatStore;

use crate::core::ChatError;

/// 会话与对话条目的存储接口
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 插入新会话
    async fn insert_session(&self, session: ChatSession) -> Result<ChatSession, ChatError>;

    /// 按 id + 属主查询会话
    async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ChatSession>, ChatError>;

    /// 用户的会话列表，按 updated_at 倒序
    async fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ChatSession>, ChatError>;

    /// 刷新会话的 updated_at；会话不存在时返回 false
    async fn touch_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError>;

    /// 设置会话活跃标记（软删除用）
    async fn set_session_active(
        &self,
        session_id: &str,
        user_id: &str,
        active: bool,
    ) -> Result<bool, ChatError>;

    /// 硬删除会话及其全部对话条目
    async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError>;

    /// 插入对话条目，返回条目 id
    async fn insert_entry(&self, entry: ConversationEntry) -> Result<String, ChatError>;

    /// 按 id + 属主查询条目
    async fn get_entry(
        &self,
        entry_id: &str,
        user_id: &str,
    ) -> Result<Option<ConversationEntry>, ChatError>;

    /// 按 id 查询条目，不过滤属主；用于区分「不存在」与「属于别人」
    async fn find_entry(&self, entry_id: &str) -> Result<Option<ConversationEntry>, ChatError>;

    /// 会话内条目，按 created_at 正序；limit 截取最早的 N 条
    async fn list_entries(
        &self,
        session_id: &str,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationEntry>, ChatError>;

    /// 仅更新条目状态（同值重设是幂等的：内容与轨迹不动）
    async fn set_entry_status(&self, entry_id: &str, status: EntryStatus)
        -> Result<(), ChatError>;

    /// 覆盖条目的推理轨迹（反思过程中的实时写入）
    async fn set_entry_steps(
        &self,
        entry_id: &str,
        steps: &[ReasoningStep],
    ) -> Result<(), ChatError>;

    /// 终写：内容 + 状态，连同可选的元数据与轨迹
    async fn finalize_entry(
        &self,
        entry_id: &str,
        content: &str,
        status: EntryStatus,
        metadata: Option<&Metadata>,
        steps: Option<&[ReasoningStep]>,
    ) -> Result<(), ChatError>;
}

/// 创建存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_chat_store(db_path: Option<&std::path::Path>) -> Arc<dyn ChatStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteChatStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite chat store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to create SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory chat store");
    Arc::new(MemoryChatStore::new())
}
