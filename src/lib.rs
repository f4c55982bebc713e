//! Edith - 对话助手后端
//!
//! 模块划分：
//! - **chatbot**: 单轮对话编排（会话解析、记忆、路由、生成、持久化）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类体系
//! - **lifecycle**: 异步消息生命周期（fire-and-forget 后台生成 + 状态轮询）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话级上下文窗口（Token 预算 + 滚动摘要）
//! - **prompts**: 提示词模板提供者（文件覆盖 + 内置默认值）与用户画像
//! - **reflection**: 反思推理状态机（生成 -> 反思 -> 条件修订）与步骤轨迹
//! - **router**: 查询复杂度路由（规则表 + LLM 兜底）
//! - **session**: 会话管理（创建 / 查询 / 软删除 / 硬删除）
//! - **store**: 持久化边界（内存实现 + 可选 SQLite）

pub mod chatbot;
pub mod config;
pub mod core;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod prompts;
pub mod reflection;
pub mod router;
pub mod session;
pub mod store;
