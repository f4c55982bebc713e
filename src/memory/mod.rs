//! 记忆层：会话级上下文窗口
//!
//! - **conversation**: 对话消息类型（LLM 提示用的 role + content）
//! - **tokenizer**: Token 估算（字符计数近似）
//! - **window**: Token 预算 + 滚动摘要的上下文窗口

pub mod conversation;
pub mod tokenizer;
pub mod window;

pub use conversation::{Message, Role};
pub use tokenizer::TokenEstimator;
pub use window::{ContextWindow, MemoryVariables};
