//! 工具模块
//!
//! 提供错误类型和取消上下文。

pub mod context;
pub mod error;

pub use context::Context;
pub use error::{ContextError, SshError};
