//! 可取消的 SSH 拨号
//!
//! TCP 连接直接响应上下文取消；握手在独立任务中进行，
//! 调用方同时等待握手结果和上下文结束，先到者胜出。
//!
//! ## 取消语义
//! - 握手任务先完成：返回握手结果（成功或失败）
//! - 上下文先结束（或超过 [`ClientConfig::connect_timeout`]）：终止握手任务，
//!   TCP 连接随任务一起被丢弃（关闭且仅关闭一次），返回上下文错误；
//!   之后到达的握手结果随接收端一起被丢弃
//! - 调用方丢弃拨号 future：同样终止握手任务并关闭 TCP 连接

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::task::AbortOnDropHandle;

use crate::utils::context::Context;
use crate::utils::error::SshError;

use super::auth;
use super::client::{ClientHandler, RusshClient, SshClient};
use super::config::ClientConfig;

/// 网络类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    /// IPv4 或 IPv6
    #[default]
    Tcp,
    /// 仅 IPv4
    Tcp4,
    /// 仅 IPv6
    Tcp6,
}

impl Network {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = SshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(SshError::Config(format!("不支持的网络类型: {}", other))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        };
        f.write_str(name)
    }
}

/// 拆分 `host:port`，IPv6 主机需用方括号包围（如 `[::1]:22`）
pub fn split_host_port(addr: &str) -> Result<(String, u16), SshError> {
    let invalid = |reason: &str| SshError::AddressResolution(format!("{}: {}", addr, reason));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| invalid("缺少 ']'"))?;
        let port = rest.strip_prefix(':').ok_or_else(|| invalid("缺少端口"))?;
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("缺少端口"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 地址需要方括号"));
        }
        (host, port)
    };

    let port = port.parse::<u16>().map_err(|_| invalid("无效的端口"))?;
    Ok((host.to_string(), port))
}

/// 组合 `host:port`，IPv6 主机自动加方括号
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 建立 SSH 连接
#[async_trait::async_trait]
pub trait Dial: Send + Sync + 'static {
    type Client: SshClient;

    /// 连接 `addr`（`host:port`）并完成 SSH 握手与认证
    async fn dial(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
        config: &ClientConfig,
    ) -> Result<Self::Client, SshError>;
}

/// 在已建立的 TCP 连接上完成 SSH 握手与认证
#[async_trait::async_trait]
pub trait Handshake: Send + Sync + 'static {
    type Client: SshClient;

    async fn handshake(
        &self,
        stream: TcpStream,
        addr: String,
        config: ClientConfig,
    ) -> Result<Self::Client, SshError>;
}

/// russh 握手
#[derive(Debug, Clone, Copy, Default)]
pub struct RusshHandshake;

#[async_trait::async_trait]
impl Handshake for RusshHandshake {
    type Client = RusshClient;

    async fn handshake(
        &self,
        stream: TcpStream,
        addr: String,
        config: ClientConfig,
    ) -> Result<RusshClient, SshError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        let handler = ClientHandler::new(addr.clone());
        let mut handle = russh::client::connect_stream(config.to_russh_config(), stream, handler)
            .await
            .map_err(|e| SshError::Handshake(format!("{}: {}", addr, e)))?;

        tracing::debug!(addr = %addr, "SSH 握手完成");

        auth::authenticate(&mut handle, &config.user, &config.auth).await?;

        tracing::info!(addr = %addr, user = %config.user, "SSH 连接成功");
        Ok(RusshClient::new(handle, local_addr, remote_addr))
    }
}

/// 可取消的拨号器
pub struct ContextDialer<H = RusshHandshake> {
    handshake: Arc<H>,
    nodelay: bool,
}

impl ContextDialer<RusshHandshake> {
    /// 使用 russh 握手创建拨号器
    pub fn new() -> Self {
        Self::with_handshake(RusshHandshake)
    }
}

impl Default for ContextDialer<RusshHandshake> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Handshake> ContextDialer<H> {
    /// 使用自定义握手创建拨号器
    pub fn with_handshake(handshake: H) -> Self {
        Self {
            handshake: Arc::new(handshake),
            nodelay: true,
        }
    }

    /// 设置 TCP_NODELAY（默认开启）
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 建立 TCP 连接，响应上下文取消
    async fn connect_transport(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
    ) -> Result<TcpStream, SshError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let stream = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            result = resolve_and_connect(network, addr) => result?,
        };

        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

/// 解析地址并按顺序尝试连接，返回第一个成功的连接
async fn resolve_and_connect(network: Network, addr: &str) -> Result<TcpStream, SshError> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| SshError::AddressResolution(format!("{}: {}", addr, e)))?
        .filter(|a| network.accepts(a))
        .collect();
    if candidates.is_empty() {
        return Err(SshError::AddressResolution(format!(
            "{}: 没有 {} 地址",
            addr, network
        )));
    }

    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(addr = %candidate, "TCP 连接失败: {}", e);
                last_err = Some(e);
            }
        }
    }
    Err(SshError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "没有可用地址")
    })))
}

#[async_trait::async_trait]
impl<H: Handshake> Dial for ContextDialer<H> {
    type Client = H::Client;

    async fn dial(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
        config: &ClientConfig,
    ) -> Result<H::Client, SshError> {
        let ctx = if config.connect_timeout.is_zero() {
            ctx.with_cancel()
        } else {
            ctx.with_timeout(config.connect_timeout)
        };
        let stream = self.connect_transport(&ctx, network, addr).await?;

        let handshake = Arc::clone(&self.handshake);
        let (done_tx, done_rx) = oneshot::channel();
        let task_addr = addr.to_string();
        let task_config = config.clone();

        // 握手任务拥有 TCP 连接：握手失败或任务被终止时连接随之关闭。
        // 句柄被丢弃时终止任务，调用方放弃拨号 future 时同样生效
        let _task = AbortOnDropHandle::new(tokio::spawn(async move {
            let result = handshake.handshake(stream, task_addr, task_config).await;
            // 接收端已丢弃时结果（包括已建立的客户端）在此处被丢弃
            let _ = done_tx.send(result);
        }));

        tokio::select! {
            biased;

            result = done_rx => match result {
                Ok(result) => result,
                Err(_) => Err(SshError::Handshake(format!("{}: 握手任务异常退出", addr))),
            },

            err = ctx.done() => {
                tracing::debug!(addr = %addr, "拨号被取消: {}", err);
                Err(err.into())
            }
        }
    }
}
