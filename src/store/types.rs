//! 持久化实体：会话、对话条目、推理步骤
//!
//! 与外部存储的行一一对应；ContextWindow 与前端轮询读到的都是这些结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 条目元数据（不透明 JSON map，路由信息等观测数据写在这里）
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// 会话：一个对话线程
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ChatSession {
    /// 创建新会话；未指定标题时使用 "Chat {时间}"
    pub fn new(user_id: impl Into<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.unwrap_or_else(|| format!("Chat {}", now.format("%Y-%m-%d %H:%M"))),
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }
}

/// 条目角色（与 LLM API 一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    User,
    Assistant,
    System,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryRole::User => "user",
            EntryRole::Assistant => "assistant",
            EntryRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => EntryRole::User,
            "assistant" => EntryRole::Assistant,
            _ => EntryRole::System,
        }
    }
}

/// 条目状态：pending -> processing -> complete / failed
///
/// 除显式重试外状态单调前进；一旦终态，核心不再静默改写。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Complete => "complete",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => EntryStatus::Pending,
            "processing" => EntryStatus::Processing,
            "failed" => EntryStatus::Failed,
            _ => EntryStatus::Complete,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Complete | EntryStatus::Failed)
    }
}

/// 反思轨迹的步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    GenerationStart,
    Generation,
    ReflectionStart,
    Reflection,
    RevisionStart,
    Revision,
    Finalization,
}

/// 单条推理步骤：消息内步骤号严格递增，单次运行内只追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step: u32,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ReasoningStep {
    pub fn new(step: u32, step_type: StepType, content: impl Into<String>) -> Self {
        Self {
            step,
            step_type,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 对话条目：一个轮次单元（用户发言、助手答复或占位行）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub role: EntryRole,
    pub content: String,
    pub status: EntryStatus,
    #[serde(default)]
    pub metadata: Metadata,
    /// 反思推理轨迹（仅 react 路径的助手条目有值）
    pub reflection_steps: Option<Vec<ReasoningStep>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        role: EntryRole,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            role,
            content: content.into(),
            status: EntryStatus::Complete,
            metadata: Metadata::new(),
            reflection_steps: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}
