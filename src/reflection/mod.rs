//! 反思推理引擎
//!
//! 生成 → 反思 → （修订 | 定稿）的显式状态机。每完成一个阶段步骤就把轨迹整体
//! 回写到条目记录上，外部轮询者能看到推理的渐进过程；回写失败只记日志，绝不
//! 中断推理。LLM 调用失败则整个 run 以 Generation 错误收场，由上层标记 failed。

use std::sync::Arc;

use crate::core::ChatError;
use crate::llm::LlmClient;
use crate::memory::{Message, Role};
use crate::prompts::PromptLibrary;
use crate::store::{ChatStore, ReasoningStep, StepType};

/// 修订判定：扫描批评文本决定是否需要改写草稿
pub trait RevisionPredicate: Send + Sync {
    fn needs_revision(&self, critique: &str) -> bool;
}

/// 默认判定：批评文本（小写化后）含任一触发词即修订
pub struct KeywordRevision {
    triggers: Vec<String>,
}

impl Default for KeywordRevision {
    fn default() -> Self {
        Self {
            triggers: ["improve", "better", "missing", "add"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RevisionPredicate for KeywordRevision {
    fn needs_revision(&self, critique: &str) -> bool {
        let lower = critique.to_lowercase();
        self.triggers.iter().any(|w| lower.contains(w.as_str()))
    }
}

/// 一次反思 run 的产出
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    pub final_answer: String,
    pub steps: Vec<ReasoningStep>,
    /// LLM 生成调用次数：定稿路径 1，修订路径 2
    pub step_count: u32,
}

/// 状态机阶段
enum Phase {
    Generate,
    Reflect { draft: String },
    Revise { draft: String, critique: String },
    Finalize { draft: String },
    Done { answer: String },
}

/// 反思推理引擎
pub struct ReflectionEngine {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ChatStore>,
    prompts: PromptLibrary,
    predicate: Box<dyn RevisionPredicate>,
}

impl ReflectionEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ChatStore>,
        prompts: PromptLibrary,
    ) -> Self {
        Self {
            llm,
            store,
            prompts,
            predicate: Box::new(KeywordRevision::default()),
        }
    }

    pub fn with_predicate(mut self, predicate: Box<dyn RevisionPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// 运行完整的反思流程
    ///
    /// entry_id 为目标条目（None 时不做实时回写）；history 是供上下文用的最近消息。
    pub async fn run(
        &self,
        user_input: &str,
        system_prompt: &str,
        history: &[Message],
        entry_id: Option<&str>,
    ) -> Result<ReflectionOutcome, ChatError> {
        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut step_count: u32 = 0;
        let mut phase = Phase::Generate;

        loop {
            phase = match phase {
                Phase::Generate => {
                    tracing::debug!("Reflection phase: GENERATE");
                    self.record(
                        &mut steps,
                        StepType::GenerationStart,
                        "Starting to generate response...",
                        entry_id,
                    )
                    .await;

                    let prompt = self.prompts.render(
                        "generate",
                        &[
                            ("system_prompt", system_prompt),
                            ("context", &format_history(history)),
                            ("user_input", user_input),
                        ],
                    );
                    let draft = self.complete(prompt).await?;
                    step_count += 1;

                    self.record(
                        &mut steps,
                        StepType::Generation,
                        format!("Initial response generated ({} chars)", draft.chars().count()),
                        entry_id,
                    )
                    .await;

                    Phase::Reflect { draft }
                }

                Phase::Reflect { draft } => {
                    tracing::debug!("Reflection phase: REFLECT");
                    self.record(
                        &mut steps,
                        StepType::ReflectionStart,
                        "Analyzing response quality...",
                        entry_id,
                    )
                    .await;

                    let prompt = self.prompts.render(
                        "reflection",
                        &[("user_input", user_input), ("draft_response", &draft)],
                    );
                    let critique = self.complete(prompt).await?;

                    let preview = if critique.chars().count() > 200 {
                        format!("{}...", critique.chars().take(200).collect::<String>())
                    } else {
                        critique.clone()
                    };
                    self.record(&mut steps, StepType::Reflection, preview, entry_id)
                        .await;

                    if self.predicate.needs_revision(&critique) {
                        Phase::Revise { draft, critique }
                    } else {
                        Phase::Finalize { draft }
                    }
                }

                Phase::Revise { draft, critique } => {
                    tracing::debug!("Reflection phase: REVISE");
                    self.record(
                        &mut steps,
                        StepType::RevisionStart,
                        "Improving response based on reflection...",
                        entry_id,
                    )
                    .await;

                    let prompt = self.prompts.render(
                        "revision",
                        &[
                            ("system_prompt", system_prompt),
                            ("user_input", user_input),
                            ("draft_response", &draft),
                            ("reflection", &critique),
                        ],
                    );
                    let revised = self.complete(prompt).await?;
                    step_count += 1;

                    self.record(
                        &mut steps,
                        StepType::Revision,
                        format!("Response revised ({} chars)", revised.chars().count()),
                        entry_id,
                    )
                    .await;

                    Phase::Done { answer: revised }
                }

                Phase::Finalize { draft } => {
                    tracing::debug!("Reflection phase: FINALIZE");
                    self.record(
                        &mut steps,
                        StepType::Finalization,
                        "Finalizing response...",
                        entry_id,
                    )
                    .await;
                    self.record(
                        &mut steps,
                        StepType::Finalization,
                        "Response approved without revision",
                        entry_id,
                    )
                    .await;

                    Phase::Done { answer: draft }
                }

                Phase::Done { answer } => {
                    return Ok(ReflectionOutcome {
                        final_answer: answer,
                        steps,
                        step_count,
                    });
                }
            };
        }
    }

    async fn complete(&self, prompt: String) -> Result<String, ChatError> {
        self.llm
            .complete(&[Message::system(prompt)])
            .await
            .map_err(ChatError::Generation)
    }

    /// 追加一个轨迹步骤并尝试实时回写；回写失败只记日志
    async fn record(
        &self,
        steps: &mut Vec<ReasoningStep>,
        step_type: StepType,
        content: impl Into<String>,
        entry_id: Option<&str>,
    ) {
        let seq = steps.len() as u32 + 1;
        steps.push(ReasoningStep::new(seq, step_type, content));

        if let Some(id) = entry_id {
            if id.is_empty() {
                return;
            }
            if let Err(e) = self.store.set_entry_steps(id, steps).await {
                tracing::warn!("Error updating reflection steps: {}", e);
            }
        }
    }
}

/// 最近历史的紧凑预览：最后 2 条，每条截 80 字符，用 " | " 连接
pub fn format_history(history: &[Message]) -> String {
    if history.is_empty() {
        return "Nenhuma conversa anterior.".to_string();
    }

    history
        .iter()
        .rev()
        .take(2)
        .rev()
        .map(|m| {
            let speaker = match m.role {
                Role::User => "Usuário",
                _ => "Edith",
            };
            format!(
                "{}: {}...",
                speaker,
                m.content.chars().take(80).collect::<String>()
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
