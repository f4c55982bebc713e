//! 轮次编排
//!
//! 一次同步轮的完整路径：解析/创建会话 → 加载上下文窗口 → 持久化用户发言 →
//! 路由分类 → direct（单次 LLM 调用）或 react（反思引擎 + 占位条目回填）→
//! 刷新会话时间戳。本层的异常只记日志后原样上抛，由调用方决定呈现方式。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AppConfig;
use crate::core::ChatError;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::ContextWindow;
use crate::prompts::{PromptLibrary, UserProfile};
use crate::reflection::ReflectionEngine;
use crate::router::{QueryRoute, QueryRouter, RouterRules};
use crate::session::SessionManager;
use crate::store::{
    ChatSession, ChatStore, ConversationEntry, EntryStatus, Metadata,
};

/// 一次同步轮的请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// 为空或缺省时创建新会话
    pub session_id: Option<String>,
    pub metadata: Option<Metadata>,
    pub user_profile: Option<UserProfile>,
}

/// 一次同步轮的应答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub session_id: String,
    /// 用户发言条目的 id（持久化失败时为空串）
    pub conversation_id: String,
    pub metadata: Metadata,
}

/// 对话编排器
pub struct Chatbot {
    store: Arc<dyn ChatStore>,
    llm: Arc<dyn LlmClient>,
    sessions: SessionManager,
    router: QueryRouter,
    reflection: ReflectionEngine,
    prompts: PromptLibrary,
    cfg: AppConfig,
}

impl Chatbot {
    /// 按配置构建：对话与路由各用一个 LLM 客户端（路由低温）
    pub fn new(cfg: AppConfig, store: Arc<dyn ChatStore>) -> Self {
        let llm = create_llm_from_config(&cfg, None);
        let router_llm = create_llm_from_config(&cfg, Some(cfg.llm.router_temperature));
        Self::with_clients(cfg, store, llm, router_llm)
    }

    /// 注入 LLM 客户端构建（测试与自定义后端用）
    pub fn with_clients(
        cfg: AppConfig,
        store: Arc<dyn ChatStore>,
        llm: Arc<dyn LlmClient>,
        router_llm: Arc<dyn LlmClient>,
    ) -> Self {
        let prompts = PromptLibrary::new();
        Self {
            sessions: SessionManager::new(store.clone()),
            router: QueryRouter::new(router_llm, prompts.clone(), RouterRules::default()),
            reflection: ReflectionEngine::new(llm.clone(), store.clone(), prompts.clone()),
            store,
            llm,
            prompts,
            cfg,
        }
    }

    pub fn store(&self) -> Arc<dyn ChatStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }

    /// 同步处理一轮对话
    pub async fn chat(&self, request: ChatRequest, user_id: &str) -> Result<ChatResponse, ChatError> {
        match self.chat_inner(request, user_id).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!("Error in chat: {}", e);
                Err(e)
            }
        }
    }

    async fn chat_inner(
        &self,
        request: ChatRequest,
        user_id: &str,
    ) -> Result<ChatResponse, ChatError> {
        let session = self.resolve_session(request.session_id.as_deref(), user_id).await?;

        let mut window = ContextWindow::load(
            self.store.clone(),
            self.llm.clone(),
            self.prompts.clone(),
            &session.id,
            user_id,
            self.cfg.memory.max_token_limit,
        )
        .await;

        let mut metadata = request.metadata.unwrap_or_default();

        // 用户发言先落盘；它的 id 就是这一轮对外的 conversation_id
        let conversation_id = window.append_user(&request.message, metadata.clone()).await;

        // 路由参考上下文：最近 3 条，每条截 50 字符
        let recent_context = window
            .messages()
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|m| m.content.chars().take(50).collect::<String>())
            .collect::<Vec<_>>()
            .join(" | ");

        let decision = self.router.classify(&request.message, &recent_context).await;
        let routing_info = decision.routing_info(&request.message);
        tracing::info!("Query routed to: {}", decision.route.as_str());

        let system_prompt = self.prompts.system_prompt(request.user_profile.as_ref());

        let message = match decision.route {
            QueryRoute::Direct => {
                metadata.insert("routing_info".to_string(), routing_info);
                self.direct_turn(&mut window, &system_prompt, &mut metadata).await?
            }
            QueryRoute::React => {
                let answer = self
                    .react_turn(&mut window, &request.message, &system_prompt, &mut metadata)
                    .await?;
                metadata.insert("routing_info".to_string(), routing_info);
                answer
            }
        };

        if let Err(e) = self.sessions.touch(&session.id, user_id).await {
            tracing::warn!("Error updating session timestamp: {}", e);
        }

        Ok(ChatResponse {
            message,
            session_id: session.id,
            conversation_id,
            metadata,
        })
    }

    async fn resolve_session(
        &self,
        session_id: Option<&str>,
        user_id: &str,
    ) -> Result<ChatSession, ChatError> {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            if let Some(session) = self.store.get_session(id, user_id).await? {
                return Ok(session);
            }
        }
        self.sessions.create(user_id, None).await
    }

    /// direct 路径：system prompt（带滚动摘要）+ 窗口历史（含本轮用户发言），单次调用
    async fn direct_turn(
        &self,
        window: &mut ContextWindow,
        system_prompt: &str,
        metadata: &mut Metadata,
    ) -> Result<String, ChatError> {
        let system = if window.summary().is_empty() {
            system_prompt.to_string()
        } else {
            format!(
                "{}\n\nResumo da conversa anterior: {}",
                system_prompt,
                window.summary()
            )
        };
        let mut messages = vec![crate::memory::Message::system(system)];
        messages.extend_from_slice(window.messages());

        let answer = self
            .llm
            .complete(&messages)
            .await
            .map_err(ChatError::Generation)?;

        window.append_assistant(&answer, metadata.clone()).await;
        Ok(answer)
    }

    /// react 路径：先写 "Processing..." 占位条目，反思引擎实时回写轨迹，
    /// 最后把定稿与轨迹回填到同一条目上
    async fn react_turn(
        &self,
        window: &mut ContextWindow,
        user_input: &str,
        system_prompt: &str,
        metadata: &mut Metadata,
    ) -> Result<String, ChatError> {
        let history = window.messages().to_vec();

        let placeholder_id = window.append_assistant("Processing...", Metadata::new()).await;
        let entry_id = if placeholder_id.is_empty() {
            None
        } else {
            Some(placeholder_id.as_str())
        };

        let outcome = self
            .reflection
            .run(user_input, system_prompt, &history, entry_id)
            .await?;

        metadata.insert("step_count".to_string(), json!(outcome.step_count));
        metadata.insert("reasoning_used".to_string(), json!(true));

        if let Some(id) = entry_id {
            if let Err(e) = self
                .store
                .finalize_entry(
                    id,
                    &outcome.final_answer,
                    EntryStatus::Complete,
                    Some(metadata),
                    Some(&outcome.steps),
                )
                .await
            {
                // 占位条目回填失败：退回到插入一条新的助手条目
                tracing::error!("Error updating final conversation: {}", e);
                self.append_fallback(window, &outcome.final_answer, metadata, &outcome.steps)
                    .await;
            }
        } else {
            self.append_fallback(window, &outcome.final_answer, metadata, &outcome.steps)
                .await;
        }

        // 轨迹全文只随应答返回；落盘侧已有 reflection_steps 列，元数据里不再重复
        metadata.insert(
            "reasoning_steps".to_string(),
            serde_json::to_value(&outcome.steps).unwrap_or_default(),
        );

        Ok(outcome.final_answer)
    }

    async fn append_fallback(
        &self,
        window: &ContextWindow,
        content: &str,
        metadata: &Metadata,
        steps: &[crate::store::ReasoningStep],
    ) {
        let mut entry = ConversationEntry::new(
            window.session_id(),
            window.user_id(),
            crate::store::EntryRole::Assistant,
            content,
        )
        .with_metadata(metadata.clone());
        entry.reflection_steps = Some(steps.to_vec());

        if let Err(e) = self.store.insert_entry(entry).await {
            tracing::error!("Error persisting fallback assistant message: {}", e);
        }
    }

    /// 会话的完整历史，按创建顺序
    pub async fn conversation_history(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConversationEntry>, ChatError> {
        self.store.list_entries(session_id, user_id, None).await
    }

    pub async fn create_new_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<ChatSession, ChatError> {
        self.sessions.create(user_id, title).await
    }

    /// 用户的活跃会话
    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>, ChatError> {
        self.sessions.list(user_id, true).await
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::store::MemoryChatStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedLlm {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&'static str>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(i) {
                Some(r) => Ok(r.to_string()),
                None => Err("script exhausted".to_string()),
            }
        }
    }

    struct PanickingLlm;

    #[async_trait]
    impl LlmClient for PanickingLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            panic!("router fallback must not be invoked");
        }
    }

    fn chatbot(responses: Vec<&'static str>) -> Chatbot {
        Chatbot::with_clients(
            AppConfig::default(),
            Arc::new(MemoryChatStore::new()),
            Arc::new(ScriptedLlm::new(responses)),
            Arc::new(PanickingLlm),
        )
    }

    #[tokio::test]
    async fn test_direct_turn_records_no_steps() {
        let bot = chatbot(vec!["Olá! Eu sou a Edith, sua consultora."]);
        let response = bot
            .chat(
                ChatRequest {
                    message: "Olá! Você pode se apresentar?".into(),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();

        assert_eq!(response.message, "Olá! Eu sou a Edith, sua consultora.");
        assert_eq!(response.metadata["routing_info"]["route"], "direct");
        assert!(!response.conversation_id.is_empty());

        let history = bot
            .conversation_history(&response.session_id, "user_1")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].reflection_steps.is_none());
    }

    #[tokio::test]
    async fn test_react_turn_fills_placeholder() {
        let bot = chatbot(vec![
            "Rascunho da estratégia.",
            "A resposta está adequada.",
        ]);
        let response = bot
            .chat(
                ChatRequest {
                    message: "Desenvolva uma estratégia de transformação digital completa".into(),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();

        assert_eq!(response.message, "Rascunho da estratégia.");
        assert_eq!(response.metadata["routing_info"]["route"], "react");
        assert_eq!(response.metadata["step_count"], 1);
        assert_eq!(response.metadata["reasoning_used"], true);
        assert_eq!(
            response.metadata["reasoning_steps"].as_array().unwrap().len(),
            6
        );

        // 占位条目被回填为定稿，没有第二条助手消息
        let history = bot
            .conversation_history(&response.session_id, "user_1")
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        let assistant = &history[1];
        assert_eq!(assistant.content, "Rascunho da estratégia.");
        assert_eq!(assistant.status, EntryStatus::Complete);
        assert_eq!(assistant.reflection_steps.as_ref().unwrap().len(), 6);
        // 轨迹以 reflection_steps 列落盘，条目元数据里不重复一份全文
        assert!(!assistant.metadata.contains_key("reasoning_steps"));
        assert_eq!(assistant.metadata["step_count"], 1);
    }

    #[tokio::test]
    async fn test_reuses_existing_session() {
        let bot = chatbot(vec!["Primeira.", "Segunda."]);
        let first = bot
            .chat(
                ChatRequest {
                    message: "Olá!".into(),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();
        let second = bot
            .chat(
                ChatRequest {
                    message: "Obrigado!".into(),
                    session_id: Some(first.session_id.clone()),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap();

        assert_eq!(first.session_id, second.session_id);
        let history = bot
            .conversation_history(&first.session_id, "user_1")
            .await
            .unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_generation_error_propagates() {
        let bot = chatbot(vec![]);
        let err = bot
            .chat(
                ChatRequest {
                    message: "Olá!".into(),
                    ..Default::default()
                },
                "user_1",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Generation(_)));
    }
}
