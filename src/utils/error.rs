//! 错误类型定义
//!
//! 定义 SSH 传输连接的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 SshError 枚举，涵盖拨号、握手、取消、远程拨号、会话建立等阶段
//! - 阶段包装错误（拨号失败 / 远程拨号失败 / 连接失败）保留原始错误
//! - 关闭多个资源时聚合所有错误
//! - 支持转换为 `std::io::Error` 和 JSON-RPC 错误格式

use std::io;

use thiserror::Error;

use crate::rpc::types::JsonRpcError;

/// 上下文错误
///
/// 由 [`Context`](super::context::Context) 在取消或超过截止时间时产生。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// 调用方主动取消
    #[error("操作已取消")]
    Canceled,

    /// 超过截止时间
    #[error("超过截止时间")]
    DeadlineExceeded,
}

/// SSH 传输错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// IO 错误（传输层连接失败等）
    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),

    /// 上下文取消或超时
    #[error("{0}")]
    Context(#[from] ContextError),

    /// 地址解析失败
    #[error("地址解析失败: {0}")]
    AddressResolution(String),

    /// SSH 握手失败
    #[error("SSH 握手失败: {0}")]
    Handshake(String),

    /// 认证失败
    #[error("认证失败: {0}")]
    Authentication(String),

    /// 私钥加载失败
    #[error("私钥加载失败: {0}")]
    PrivateKeyLoad(String),

    /// SSH 协议错误
    #[error("SSH 错误: {0}")]
    Protocol(String),

    /// 通道错误
    #[error("通道错误: {0}")]
    Channel(String),

    /// 会话错误
    #[error("会话错误: {0}")]
    Session(String),

    /// 无法连接到 SSH 端点
    #[error("SSH 拨号失败: {0}")]
    DialFailed(#[source] Box<SshError>),

    /// 已连接 SSH 端点，但无法打开远程通道
    #[error("SSH 远程拨号失败: {0}")]
    RemoteDialFailed(#[source] Box<SshError>),

    /// 已连接 SSH 端点，但无法建立会话或启动 shell
    #[error("SSH 连接失败: {0}")]
    ConnectFailed(#[source] Box<SshError>),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(&'static str),

    /// 连接已关闭
    #[error("连接已关闭")]
    Closed,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 对端返回的 JSON-RPC 错误
    #[error("RPC 错误 ({code}): {message}")]
    Rpc { code: i32, message: String },

    /// 多个错误（关闭多个资源时聚合）
    #[error("{}", join_errors(.0))]
    Multiple(Vec<SshError>),
}

fn join_errors(errors: &[SshError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        // 将 russh 错误转换为更友好的错误消息
        let message = match &err {
            russh::Error::Disconnect => "服务器断开连接".to_string(),
            russh::Error::NoCommonAlgo { kind, .. } => {
                let name = match kind {
                    russh::AlgorithmKind::Kex => "密钥交换",
                    russh::AlgorithmKind::Key => "密钥",
                    russh::AlgorithmKind::Cipher => "加密",
                    russh::AlgorithmKind::Compression => "压缩",
                    russh::AlgorithmKind::Mac => "MAC",
                };
                format!("无法协商{}算法", name)
            }
            _ => err.to_string(),
        };
        SshError::Protocol(message)
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::PrivateKeyLoad(err.to_string())
    }
}

impl From<SshError> for io::Error {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Io(e) => e,
            SshError::Closed => io::Error::new(io::ErrorKind::NotConnected, SshError::Closed),
            SshError::Unsupported(op) => {
                io::Error::new(io::ErrorKind::Unsupported, SshError::Unsupported(op))
            }
            SshError::Context(ContextError::DeadlineExceeded) => io::Error::new(
                io::ErrorKind::TimedOut,
                SshError::Context(ContextError::DeadlineExceeded),
            ),
            other => io::Error::other(other),
        }
    }
}

impl From<SshError> for JsonRpcError {
    fn from(err: SshError) -> Self {
        let code = match &err {
            SshError::Serialization(_) => -32700,
            SshError::Rpc { code, .. } => *code,
            SshError::Unsupported(_) => -32601,
            _ => -32603,
        };

        JsonRpcError {
            code,
            message: err.to_string(),
            data: Some(serde_json::json!({
                "error_type": err.error_type(),
            })),
        }
    }
}

impl SshError {
    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            SshError::Io(_) => "io_error",
            SshError::Context(ContextError::Canceled) => "canceled",
            SshError::Context(ContextError::DeadlineExceeded) => "deadline_exceeded",
            SshError::AddressResolution(_) => "address_resolution_failed",
            SshError::Handshake(_) => "handshake_failed",
            SshError::Authentication(_) => "authentication_failed",
            SshError::PrivateKeyLoad(_) => "private_key_load_failed",
            SshError::Protocol(_) => "ssh_error",
            SshError::Channel(_) => "channel_error",
            SshError::Session(_) => "session_error",
            SshError::DialFailed(_) => "dial_failed",
            SshError::RemoteDialFailed(_) => "remote_dial_failed",
            SshError::ConnectFailed(_) => "connect_failed",
            SshError::Unsupported(_) => "unsupported",
            SshError::Closed => "closed",
            SshError::Config(_) => "config_error",
            SshError::Serialization(_) => "serialization_error",
            SshError::Rpc { .. } => "rpc_error",
            SshError::Multiple(_) => "multiple",
        }
    }

    /// 检查是否为上下文取消或超时（可能被阶段错误包装）
    pub fn is_context_error(&self) -> bool {
        match self {
            SshError::Context(_) => true,
            SshError::DialFailed(inner) => inner.is_context_error(),
            _ => false,
        }
    }

    /// 检查是否为拨号阶段错误（传输层、握手或取消）
    pub fn is_dial_error(&self) -> bool {
        matches!(self, SshError::DialFailed(_))
    }

    /// 检查是否为连接建立后的阶段错误（远程拨号或会话建立）
    pub fn is_setup_error(&self) -> bool {
        matches!(self, SshError::RemoteDialFailed(_) | SshError::ConnectFailed(_))
    }

    /// 获取被阶段包装的原始错误
    pub fn inner(&self) -> &SshError {
        match self {
            SshError::DialFailed(inner)
            | SshError::RemoteDialFailed(inner)
            | SshError::ConnectFailed(inner) => inner.inner(),
            other => other,
        }
    }

    // ============ 阶段包装辅助方法 ============

    /// 包装为拨号失败错误
    pub fn dial_failed(err: SshError) -> Self {
        SshError::DialFailed(Box::new(err))
    }

    /// 包装为远程拨号失败错误
    pub fn remote_dial_failed(err: SshError) -> Self {
        SshError::RemoteDialFailed(Box::new(err))
    }

    /// 包装为连接失败错误
    pub fn connect_failed(err: SshError) -> Self {
        SshError::ConnectFailed(Box::new(err))
    }

    /// 合并多个错误
    ///
    /// 没有错误时返回 `Ok(())`，只有一个错误时原样返回，
    /// 多个错误时返回 [`SshError::Multiple`]。
    pub fn combine(errors: Vec<SshError>) -> Result<(), SshError> {
        let mut errors = errors;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SshError::Multiple(errors)),
        }
    }
}
