//! 通用连接接口
//!
//! 隧道、shell 连接和单次监听器连接都实现 [`Conn`]，
//! 上层协议只依赖这一接口，无需了解 SSH 或 shell。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::utils::error::SshError;

/// 没有真实地址概念的连接使用的占位地址
pub const PLACEHOLDER_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

/// 双向字节流连接
#[async_trait::async_trait]
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    /// 本地地址
    fn local_addr(&self) -> SocketAddr;

    /// 远程地址
    fn remote_addr(&self) -> SocketAddr;

    /// 设置读写截止时间
    fn set_deadline(&self, _deadline: Instant) -> Result<(), SshError> {
        Err(SshError::Unsupported("deadline"))
    }

    /// 设置读截止时间
    fn set_read_deadline(&self, _deadline: Instant) -> Result<(), SshError> {
        Err(SshError::Unsupported("deadline"))
    }

    /// 设置写截止时间
    fn set_write_deadline(&self, _deadline: Instant) -> Result<(), SshError> {
        Err(SshError::Unsupported("deadline"))
    }

    /// 关闭连接并释放所有关联资源
    async fn close(self) -> Result<(), SshError>
    where
        Self: Sized;
}
