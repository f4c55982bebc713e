//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete；错误以 String 形式返回，
//! 由调用方映射为 ChatError（路由器吸收为 direct，生成路径上抛 Generation）。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：给定消息列表返回一次完成文本
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
