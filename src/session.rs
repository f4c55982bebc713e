//! 会话管理
//!
//! 存储接口上的薄封装：创建、查询、列表、软删除（置 inactive）与硬删除。
//! 所有操作都带 user_id 做属主校验，查不到即视为无权限或不存在。

use std::sync::Arc;

use crate::core::ChatError;
use crate::store::{ChatSession, ChatStore};

/// 会话管理器
pub struct SessionManager {
    store: Arc<dyn ChatStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// 创建新会话
    pub async fn create(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<ChatSession, ChatError> {
        let session = self.store.insert_session(ChatSession::new(user_id, title)).await?;
        tracing::info!("Created session {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// 查询会话；不存在或不属于该用户时返回 NotFound
    pub async fn get(&self, session_id: &str, user_id: &str) -> Result<ChatSession, ChatError> {
        self.store
            .get_session(session_id, user_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("session {}", session_id)))
    }

    /// 用户的会话列表，按最近更新倒序
    pub async fn list(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ChatSession>, ChatError> {
        self.store.list_sessions(user_id, active_only).await
    }

    /// 刷新会话的 updated_at
    pub async fn touch(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        self.store.touch_session(session_id, user_id).await
    }

    /// 软删除：置为 inactive，历史保留
    pub async fn deactivate(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let found = self.store.set_session_active(session_id, user_id, false).await?;
        if found {
            tracing::info!("Deactivated session {}", session_id);
        }
        Ok(found)
    }

    /// 硬删除：会话与其全部条目一并删除
    pub async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let found = self.store.delete_session(session_id, user_id).await?;
        if found {
            tracing::info!("Deleted session {}", session_id);
        }
        Ok(found)
    }
}
