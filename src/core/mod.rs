//! 核心类型：错误分类体系

pub mod error;

pub use error::ChatError;
