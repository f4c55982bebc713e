//! 对话后端错误类型
//!
//! 传播策略：Classification 在路由器内部吸收（永不外泄）；同步轮次中 Generation /
//! Workflow 上抛给调用方；后台轮次中一律转成消息的 failed 终态；追加轨迹 / 记忆时的
//! Persistence 错误记日志后吞掉，避免中断一次用户可见的生成。

use thiserror::Error;

/// 对话编排各层共用的错误类型
#[derive(Error, Debug)]
pub enum ChatError {
    /// 消息 / 会话不属于当前调用方
    #[error("Access denied: {0}")]
    Authorization(String),

    /// 未知的会话或消息 id
    #[error("Not found: {0}")]
    NotFound(String),

    /// 路由器 LLM 兜底调用失败（内部处理为 direct，不应出现在调用方）
    #[error("Classification failed: {0}")]
    Classification(String),

    /// 直接生成或反思生成中的 LLM 调用失败
    #[error("Generation failed: {0}")]
    Generation(String),

    /// 存储读写失败
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// 状态机内部的意外错误
    #[error("Workflow failed: {0}")]
    Workflow(String),
}
