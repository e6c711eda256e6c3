//! SSH 代理拨号器
//!
//! 连接 `host` 的 SSH 端口，再从远端视角打开到 `host:port` 的通道。
//! 远端服务可能只监听通配地址，因此远程拨号会依次尝试通配地址和目标主机。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::utils::context::Context;
use crate::utils::error::SshError;

use super::client::{BoxedStream, SshClient};
use super::config::Config;
use super::dial::{join_host_port, split_host_port, ContextDialer, Dial, Network};
use super::keepalive::spawn_keepalive;
use super::tunnel::{FreeFn, Tunnel};

/// 远程拨号使用的通配地址
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// 拨号回调：每次拨号尝试结束后调用一次，参数为主机和错误（成功时为 `None`）
pub type OnDialFn = Arc<dyn Fn(&str, Option<&SshError>) + Send + Sync>;

/// 连接关闭回调：连接资源释放后调用一次
pub type OnConnCloseFn = Arc<dyn Fn(&str) + Send + Sync>;

/// 远程拨号的绑定地址顺序
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindOrder {
    /// 先通配地址，再目标主机
    #[default]
    WildcardFirst,
    /// 先目标主机，再通配地址
    TargetFirst,
}

impl BindOrder {
    fn hosts<'a>(&self, target: &'a str) -> Vec<&'a str> {
        let mut hosts = match self {
            BindOrder::WildcardFirst => vec![WILDCARD_HOST, target],
            BindOrder::TargetFirst => vec![target, WILDCARD_HOST],
        };
        hosts.dedup();
        hosts
    }
}

/// 通过 SSH 隧道建立连接的拨号器
pub struct ProxyDialer<D: Dial = ContextDialer> {
    config: Config,
    dialer: D,
    bind_order: BindOrder,
    on_dial: Option<OnDialFn>,
    on_conn_close: Option<OnConnCloseFn>,
}

impl<D: Dial> ProxyDialer<D> {
    pub fn new(config: Config, dialer: D) -> Self {
        Self {
            config,
            dialer,
            bind_order: BindOrder::default(),
            on_dial: None,
            on_conn_close: None,
        }
    }

    /// 设置远程拨号的绑定地址顺序
    pub fn bind_order(mut self, order: BindOrder) -> Self {
        self.bind_order = order;
        self
    }

    /// 设置拨号回调
    pub fn on_dial(mut self, f: impl Fn(&str, Option<&SshError>) + Send + Sync + 'static) -> Self {
        self.on_dial = Some(Arc::new(f));
        self
    }

    /// 设置连接关闭回调
    pub fn on_conn_close(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_conn_close = Some(Arc::new(f));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 连接 `addr`（`host:port`）
    ///
    /// SSH 连接失败返回 [`SshError::DialFailed`]，远程通道打开失败时关闭
    /// SSH 连接并返回 [`SshError::RemoteDialFailed`]。
    pub async fn dial_context(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
    ) -> Result<Tunnel<D::Client>, SshError> {
        let (host, port) = match split_host_port(addr) {
            Ok(parts) => parts,
            Err(e) => {
                self.notify_dial("", Some(&e));
                return Err(e);
            }
        };

        let result = self.open(ctx, network, &host, port).await;
        self.notify_dial(&host, result.as_ref().err());
        result
    }

    async fn open(
        &self,
        ctx: &Context,
        network: Network,
        host: &str,
        port: u16,
    ) -> Result<Tunnel<D::Client>, SshError> {
        let ssh_addr = join_host_port(host, self.config.port);
        tracing::debug!(host = %host, "建立 SSH 隧道: {}", ssh_addr);

        let client = self
            .dialer
            .dial(ctx, network, &ssh_addr, &self.config.client)
            .await
            .map_err(SshError::dial_failed)?;
        let client = Arc::new(client);

        let stream = match self.remote_dial(client.as_ref(), host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    tracing::debug!(host = %host, "关闭 SSH 连接失败: {}", close_err);
                }
                return Err(SshError::remote_dial_failed(e));
            }
        };

        let free: FreeFn = {
            let host = host.to_string();
            let on_conn_close = self.on_conn_close.clone();
            Box::new(move || {
                if let Some(f) = on_conn_close {
                    f(&host);
                }
                tracing::debug!(host = %host, "隧道已关闭");
            })
        };

        let done = if self.config.keepalive_enabled() {
            let done = CancellationToken::new();
            spawn_keepalive(
                Arc::clone(&client),
                self.config.server_alive_interval,
                self.config.server_alive_count_max,
                done.clone(),
            );
            Some(done)
        } else {
            None
        };

        tracing::info!(host = %host, port = port, "SSH 隧道已建立");
        Ok(Tunnel::new(stream, client, done, Some(free)))
    }

    /// 按绑定顺序打开远程通道，第一个成功者胜出
    async fn remote_dial(
        &self,
        client: &D::Client,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, SshError> {
        let mut errors = Vec::new();
        for bind in self.bind_order.hosts(host) {
            match client.dial(bind, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(host = %host, bind = %bind, "远程拨号失败: {}", e);
                    errors.push(e);
                }
            }
        }
        // 最后一次尝试的错误最能说明问题
        Err(errors
            .pop()
            .unwrap_or_else(|| SshError::Channel(format!("{}:{} 没有可用的绑定地址", host, port))))
    }

    fn notify_dial(&self, host: &str, err: Option<&SshError>) {
        if let Some(f) = &self.on_dial {
            f(host, err);
        }
    }
}
