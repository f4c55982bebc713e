//! 上下文窗口：缓冲 + 滚动摘要
//!
//! load 时从存储按创建顺序重放历史；每次 append 同时写缓冲与存储行（存储是事实
//! 来源，缓冲只是本轮缓存）。缓冲估算 token 超预算时，最旧的消息被折叠进滚动
//! 摘要（一次 LLM 调用），只保留最近部分原文。

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::{Message, Role, TokenEstimator};
use crate::prompts::PromptLibrary;
use crate::store::{ChatStore, ConversationEntry, EntryRole, Metadata};

/// 超预算剪枝时至少保留的最近消息条数
const MIN_RECENT_MESSAGES: usize = 2;

/// 供提示构建使用的记忆变量
#[derive(Debug, Clone)]
pub struct MemoryVariables {
    pub recent_messages: Vec<Message>,
    pub summary: String,
}

/// 会话级上下文窗口
pub struct ContextWindow {
    store: Arc<dyn ChatStore>,
    llm: Arc<dyn LlmClient>,
    prompts: PromptLibrary,
    session_id: String,
    user_id: String,
    max_token_limit: usize,
    messages: Vec<Message>,
    summary: String,
}

impl ContextWindow {
    /// 加载会话记忆：重放已持久化的 user/assistant 条目，随后执行一次预算剪枝
    pub async fn load(
        store: Arc<dyn ChatStore>,
        llm: Arc<dyn LlmClient>,
        prompts: PromptLibrary,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        max_token_limit: usize,
    ) -> Self {
        let session_id = session_id.into();
        let user_id = user_id.into();

        let mut window = Self {
            store,
            llm,
            prompts,
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            max_token_limit,
            messages: Vec::new(),
            summary: String::new(),
        };

        match window
            .store
            .list_entries(&session_id, &user_id, None)
            .await
        {
            Ok(entries) => {
                for entry in entries {
                    match entry.role {
                        EntryRole::User => window.messages.push(Message::user(entry.content)),
                        EntryRole::Assistant => {
                            window.messages.push(Message::assistant(entry.content))
                        }
                        EntryRole::System => {}
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error loading conversation history: {}", e);
            }
        }

        window.prune().await;
        window
    }

    /// 追加用户消息：写缓冲并持久化，返回条目 id（持久化失败时返回空串）
    pub async fn append_user(&mut self, content: &str, metadata: Metadata) -> String {
        self.messages.push(Message::user(content));
        let id = self.persist(EntryRole::User, content, metadata).await;
        self.prune().await;
        id
    }

    /// 追加助手消息：写缓冲并持久化，返回条目 id（持久化失败时返回空串）
    pub async fn append_assistant(&mut self, content: &str, metadata: Metadata) -> String {
        self.messages.push(Message::assistant(content));
        let id = self.persist(EntryRole::Assistant, content, metadata).await;
        self.prune().await;
        id
    }

    /// 提示构建用变量：最近消息原文 + 滚动摘要
    pub fn variables(&self) -> MemoryVariables {
        MemoryVariables {
            recent_messages: self.messages.clone(),
            summary: self.summary.clone(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn persist(&self, role: EntryRole, content: &str, metadata: Metadata) -> String {
        let entry = ConversationEntry::new(&self.session_id, &self.user_id, role, content)
            .with_metadata(metadata);
        match self.store.insert_entry(entry).await {
            Ok(id) => id,
            Err(e) => {
                // 缓冲已前进，本轮仍可完成；空 id 表示「未持久化」
                tracing::error!("Error persisting message: {}", e);
                String::new()
            }
        }
    }

    fn buffer_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| TokenEstimator::estimate(&m.content))
            .sum()
    }

    /// 超预算时把最旧的消息折叠进滚动摘要，保留最近部分原文
    async fn prune(&mut self) {
        if self.buffer_tokens() <= self.max_token_limit {
            return;
        }

        let mut pruned = Vec::new();
        while self.buffer_tokens() > self.max_token_limit
            && self.messages.len() > MIN_RECENT_MESSAGES
        {
            pruned.push(self.messages.remove(0));
        }
        if pruned.is_empty() {
            return;
        }

        let new_lines: String = pruned
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "Usuário",
                    _ => "Edith",
                };
                format!("{}: {}\n", speaker, m.content)
            })
            .collect();

        let summary_so_far = if self.summary.is_empty() {
            "(vazio)".to_string()
        } else {
            self.summary.clone()
        };
        let prompt = self.prompts.render(
            "summarize",
            &[("summary", summary_so_far.as_str()), ("new_lines", new_lines.as_str())],
        );

        match self.llm.complete(&[Message::system(prompt)]).await {
            Ok(s) if !s.trim().is_empty() => self.summary = s.trim().to_string(),
            Ok(_) => {}
            Err(e) => {
                // 摘要失败不阻塞本轮；旧摘要保留，被剪掉的消息不再可见
                tracing::warn!("Context summarization failed: {}", e);
            }
        }
    }
}
