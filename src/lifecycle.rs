//! 消息生命周期管理
//!
//! fire-and-forget 的后台生成：start 同步校验并把条目置为 processing，随后
//! 派生受信号量约束的后台任务立即返回；调用方通过轮询条目记录观察进度。
//! 后台任务的任何错误都在最外层被兜住并转成 failed 终态（终态写入失败会重试
//! 一次），任务结束时经完成通道发一个事件，条目绝不会永远停在 processing。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::core::ChatError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::prompts::{PromptLibrary, UserProfile};
use crate::reflection::ReflectionEngine;
use crate::store::{ChatStore, EntryRole, EntryStatus};

/// 后台路由启发式：最后一条用户消息含任一关键词则走反思路径
const BACKGROUND_REACT_KEYWORDS: [&str; 8] = [
    "pesquisar", "buscar", "comparar", "analisar", "research", "search", "compare", "analyze",
];

/// start 的即时应答
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStarted {
    pub message_id: String,
    pub status: String,
    pub session_id: String,
}

/// 后台任务的完成事件
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub message_id: String,
    pub status: EntryStatus,
}

/// 后台生成任务的参数
struct BackgroundJob {
    message_id: String,
    user_id: String,
    context_limit: usize,
    profile: Option<UserProfile>,
}

/// 消息生命周期管理器
pub struct MessageLifecycle {
    store: Arc<dyn ChatStore>,
    llm: Arc<dyn LlmClient>,
    prompts: PromptLibrary,
    reflection: Arc<ReflectionEngine>,
    semaphore: Arc<Semaphore>,
    default_context_limit: usize,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl MessageLifecycle {
    /// 构建管理器并返回完成事件接收端
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn ChatStore>,
        llm: Arc<dyn LlmClient>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TaskEvent>) {
        let prompts = PromptLibrary::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Arc::new(Self {
            reflection: Arc::new(ReflectionEngine::new(
                llm.clone(),
                store.clone(),
                prompts.clone(),
            )),
            store,
            llm,
            prompts,
            semaphore: Arc::new(Semaphore::new(cfg.lifecycle.max_concurrent)),
            default_context_limit: cfg.lifecycle.context_limit,
            events: tx,
        });
        (lifecycle, rx)
    }

    /// 校验条目归属，置 processing，派生后台任务后立即返回
    pub async fn start(
        self: &Arc<Self>,
        message_id: &str,
        user_id: &str,
        context_limit: Option<usize>,
        profile: Option<UserProfile>,
    ) -> Result<ProcessingStarted, ChatError> {
        let entry = match self.store.get_entry(message_id, user_id).await? {
            Some(entry) => entry,
            None => {
                return Err(match self.store.find_entry(message_id).await? {
                    Some(_) => ChatError::Authorization(format!(
                        "message {} belongs to another user",
                        message_id
                    )),
                    None => ChatError::NotFound(format!("message {}", message_id)),
                });
            }
        };

        self.store
            .set_entry_status(message_id, EntryStatus::Processing)
            .await?;

        let job = BackgroundJob {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            context_limit: context_limit.unwrap_or(self.default_context_limit),
            profile,
        };
        let lifecycle = self.clone();
        tokio::spawn(async move {
            lifecycle.supervise(job).await;
        });

        Ok(ProcessingStarted {
            message_id: message_id.to_string(),
            status: "processing".to_string(),
            session_id: entry.session_id,
        })
    }

    /// 后台任务监督层：限流、兜底转 failed、发完成事件
    async fn supervise(&self, job: BackgroundJob) {
        // 许可在任务内部获取：start 在满载时也能立即返回
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let message_id = job.message_id.clone();
        tracing::info!("Starting background processing for message {}", message_id);

        let status = match self.run_in_background(job).await {
            Ok(content) => {
                if self
                    .terminal_write(&message_id, &content, EntryStatus::Complete)
                    .await
                {
                    tracing::info!("Background processing completed for message {}", message_id);
                    EntryStatus::Complete
                } else {
                    // 结果写不进去：尽力转 failed，调用方至少不会拿到半截的 complete
                    self.terminal_write(
                        &message_id,
                        "Processing failed: final write failed",
                        EntryStatus::Failed,
                    )
                    .await;
                    EntryStatus::Failed
                }
            }
            Err(e) => {
                tracing::error!(
                    "Background processing failed for message {}: {}",
                    message_id,
                    e
                );
                let content = format!("Processing failed: {}", e);
                self.terminal_write(&message_id, &content, EntryStatus::Failed)
                    .await;
                EntryStatus::Failed
            }
        };

        let _ = self.events.send(TaskEvent { message_id, status });
    }

    /// 实际的后台生成：重取条目、装配上下文、按关键词启发式选路，返回定稿文本
    async fn run_in_background(&self, job: BackgroundJob) -> Result<String, ChatError> {
        let entry = self
            .store
            .get_entry(&job.message_id, &job.user_id)
            .await?
            .ok_or_else(|| {
                ChatError::NotFound("message not found during background processing".to_string())
            })?;

        // 多取一倍再过滤掉占位条目本身，最后保留最近 context_limit 条
        let mut context: Vec<Message> = self
            .store
            .list_entries(&entry.session_id, &job.user_id, Some(job.context_limit * 2))
            .await?
            .into_iter()
            .filter(|e| e.id != job.message_id)
            .filter_map(|e| match e.role {
                EntryRole::User => Some(Message::user(e.content)),
                EntryRole::Assistant => Some(Message::assistant(e.content)),
                EntryRole::System => None,
            })
            .collect();
        if context.len() > job.context_limit {
            context.drain(..context.len() - job.context_limit);
        }

        let last_user = context
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::User)
            .map(|m| m.content.clone());

        let route_react = last_user
            .as_deref()
            .map(|text| {
                let lower = text.to_lowercase();
                BACKGROUND_REACT_KEYWORDS.iter().any(|k| lower.contains(k))
            })
            .unwrap_or(false);
        tracing::info!(
            "Background processing with route: {}",
            if route_react { "react" } else { "direct" }
        );

        let system_prompt = self.prompts.system_prompt(job.profile.as_ref());

        let content = if route_react {
            // 反思路径：历史去掉最后一条用户消息，它作为本轮输入单独传入
            let user_input = last_user.unwrap_or_default();
            let history: Vec<Message> = if context
                .last()
                .map(|m| m.role == crate::memory::Role::User)
                .unwrap_or(false)
            {
                context[..context.len() - 1].to_vec()
            } else {
                context.clone()
            };

            self.reflection
                .run(&user_input, &system_prompt, &history, Some(&job.message_id))
                .await?
                .final_answer
        } else {
            let mut messages = vec![Message::system(&system_prompt)];
            messages.extend(context);
            self.llm
                .complete(&messages)
                .await
                .map_err(ChatError::Generation)?
        };

        Ok(content)
    }

    /// 终态写入（complete 与 failed 都走这里），失败后重试一次；再失败返回 false
    async fn terminal_write(&self, message_id: &str, content: &str, status: EntryStatus) -> bool {
        for attempt in 0..2 {
            match self
                .store
                .finalize_entry(message_id, content, status, None, None)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    tracing::error!(
                        "Terminal status write failed for {} (attempt {}): {}",
                        message_id,
                        attempt + 1,
                        e
                    );
                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ChatSession, ConversationEntry, MemoryChatStore, Metadata, ReasoningStep,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 N 次终写失败，其余操作委托给内层存储
    struct FlakyStore {
        inner: Arc<MemoryChatStore>,
        finalize_failures: AtomicUsize,
    }

    #[async_trait]
    impl ChatStore for FlakyStore {
        async fn insert_session(&self, session: ChatSession) -> Result<ChatSession, ChatError> {
            self.inner.insert_session(session).await
        }

        async fn get_session(
            &self,
            session_id: &str,
            user_id: &str,
        ) -> Result<Option<ChatSession>, ChatError> {
            self.inner.get_session(session_id, user_id).await
        }

        async fn list_sessions(
            &self,
            user_id: &str,
            active_only: bool,
        ) -> Result<Vec<ChatSession>, ChatError> {
            self.inner.list_sessions(user_id, active_only).await
        }

        async fn touch_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
            self.inner.touch_session(session_id, user_id).await
        }

        async fn set_session_active(
            &self,
            session_id: &str,
            user_id: &str,
            active: bool,
        ) -> Result<bool, ChatError> {
            self.inner.set_session_active(session_id, user_id, active).await
        }

        async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<bool, ChatError> {
            self.inner.delete_session(session_id, user_id).await
        }

        async fn insert_entry(&self, entry: ConversationEntry) -> Result<String, ChatError> {
            self.inner.insert_entry(entry).await
        }

        async fn get_entry(
            &self,
            entry_id: &str,
            user_id: &str,
        ) -> Result<Option<ConversationEntry>, ChatError> {
            self.inner.get_entry(entry_id, user_id).await
        }

        async fn find_entry(&self, entry_id: &str) -> Result<Option<ConversationEntry>, ChatError> {
            self.inner.find_entry(entry_id).await
        }

        async fn list_entries(
            &self,
            session_id: &str,
            user_id: &str,
            limit: Option<usize>,
        ) -> Result<Vec<ConversationEntry>, ChatError> {
            self.inner.list_entries(session_id, user_id, limit).await
        }

        async fn set_entry_status(
            &self,
            entry_id: &str,
            status: EntryStatus,
        ) -> Result<(), ChatError> {
            self.inner.set_entry_status(entry_id, status).await
        }

        async fn set_entry_steps(
            &self,
            entry_id: &str,
            steps: &[ReasoningStep],
        ) -> Result<(), ChatError> {
            self.inner.set_entry_steps(entry_id, steps).await
        }

        async fn finalize_entry(
            &self,
            entry_id: &str,
            content: &str,
            status: EntryStatus,
            metadata: Option<&Metadata>,
            steps: Option<&[ReasoningStep]>,
        ) -> Result<(), ChatError> {
            if self.finalize_failures.load(Ordering::SeqCst) > 0 {
                self.finalize_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChatError::Persistence("disk I/O error".to_string()));
            }
            self.inner
                .finalize_entry(entry_id, content, status, metadata, steps)
                .await
        }
    }

    struct SlowLlm {
        response: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.response
                .map(|s| s.to_string())
                .map_err(|e| e.to_string())
        }
    }

    struct ScriptedLlm {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
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

    /// 会话 + 用户发言 + pending 占位条目
    async fn seeded(store: &Arc<MemoryChatStore>, user_text: &str) -> (String, String) {
        let session = store
            .insert_session(ChatSession::new("user_1", None))
            .await
            .unwrap();
        store
            .insert_entry(ConversationEntry::new(
                &session.id,
                "user_1",
                EntryRole::User,
                user_text,
            ))
            .await
            .unwrap();
        let placeholder = ConversationEntry::new(&session.id, "user_1", EntryRole::Assistant, "")
            .with_status(EntryStatus::Pending)
            .with_metadata(Metadata::new());
        let id = store.insert_entry(placeholder).await.unwrap();
        (session.id, id)
    }

    #[tokio::test]
    async fn test_start_returns_before_completion() {
        let store = Arc::new(MemoryChatStore::new());
        let (_, message_id) = seeded(&store, "Qual o próximo passo?").await;

        let (lifecycle, mut events) = MessageLifecycle::new(
            &AppConfig::default(),
            store.clone(),
            Arc::new(SlowLlm {
                response: Ok("Resposta pronta."),
            }),
        );

        let started = lifecycle
            .start(&message_id, "user_1", None, None)
            .await
            .unwrap();
        assert_eq!(started.status, "processing");

        // 后台还在生成：状态必须已经是 processing，不再是 pending
        let entry = store.get_entry(&message_id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Processing);

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, EntryStatus::Complete);

        let entry = store.get_entry(&message_id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Complete);
        assert_eq!(entry.content, "Resposta pronta.");
    }

    #[tokio::test]
    async fn test_failure_writes_terminal_status() {
        let store = Arc::new(MemoryChatStore::new());
        let (_, message_id) = seeded(&store, "Qual o próximo passo?").await;

        let (lifecycle, mut events) = MessageLifecycle::new(
            &AppConfig::default(),
            store.clone(),
            Arc::new(SlowLlm {
                response: Err("rate limited"),
            }),
        );

        lifecycle
            .start(&message_id, "user_1", None, None)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, EntryStatus::Failed);

        let entry = store.get_entry(&message_id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.content.starts_with("Processing failed:"));
    }

    #[tokio::test]
    async fn test_keyword_route_runs_reflection() {
        let store = Arc::new(MemoryChatStore::new());
        let (_, message_id) = seeded(&store, "Pode analisar nossos concorrentes?").await;

        let (lifecycle, mut events) = MessageLifecycle::new(
            &AppConfig::default(),
            store.clone(),
            Arc::new(ScriptedLlm {
                responses: vec!["Análise inicial.", "A resposta está adequada."],
                calls: AtomicUsize::new(0),
            }),
        );

        lifecycle
            .start(&message_id, "user_1", None, None)
            .await
            .unwrap();
        events.recv().await.unwrap();

        let entry = store.get_entry(&message_id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Complete);
        assert_eq!(entry.content, "Análise inicial.");
        assert_eq!(entry.reflection_steps.as_ref().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_complete_write_retried_after_transient_failure() {
        let inner = Arc::new(MemoryChatStore::new());
        let (_, message_id) = seeded(&inner, "Qual o próximo passo?").await;
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            finalize_failures: AtomicUsize::new(1),
        });

        let (lifecycle, mut events) = MessageLifecycle::new(
            &AppConfig::default(),
            store,
            Arc::new(SlowLlm {
                response: Ok("Resposta pronta."),
            }),
        );

        lifecycle
            .start(&message_id, "user_1", None, None)
            .await
            .unwrap();

        // 第一次终写失败，重试后结果不能丢
        let event = events.recv().await.unwrap();
        assert_eq!(event.status, EntryStatus::Complete);

        let entry = inner.get_entry(&message_id, "user_1").await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Complete);
        assert_eq!(entry.content, "Resposta pronta.");
    }

    #[tokio::test]
    async fn test_start_wrong_owner_is_denied() {
        let store = Arc::new(MemoryChatStore::new());
        let (_, message_id) = seeded(&store, "Qual o próximo passo?").await;

        let (lifecycle, _events) = MessageLifecycle::new(
            &AppConfig::default(),
            store,
            Arc::new(SlowLlm {
                response: Ok("irrelevante"),
            }),
        );

        let err = lifecycle
            .start(&message_id, "user_2", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_start_unknown_message_is_error() {
        let store = Arc::new(MemoryChatStore::new());
        let (lifecycle, _events) = MessageLifecycle::new(
            &AppConfig::default(),
            store,
            Arc::new(SlowLlm {
                response: Ok("irrelevante"),
            }),
        );

        let err = lifecycle
            .start("nao-existe", "user_1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
