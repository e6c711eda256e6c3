//! Shell 拨号器
//!
//! 连接远程主机的 SSH 端口并启动 shell，把 shell 的 stdin/stdout 作为连接使用。
//! 远端 shell 通常运行 `serve` 子命令，通过 [`Listener`](super::Listener)
//! 在 stdin/stdout 上提供服务。

use std::io;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::ssh::client::SshClient;
use crate::ssh::config::Config;
use crate::ssh::dial::{join_host_port, split_host_port, ContextDialer, Dial, Network};
use crate::ssh::keepalive::spawn_keepalive;
use crate::ssh::proxy::{OnConnCloseFn, OnDialFn};
use crate::ssh::tunnel::FreeFn;
use crate::utils::context::Context;
use crate::utils::error::SshError;

use super::conn::ProxyConn;

/// 通过远程 shell 建立连接的拨号器
pub struct Dialer<D: Dial = ContextDialer> {
    config: Config,
    dialer: D,
    on_dial: Option<OnDialFn>,
    on_conn_close: Option<OnConnCloseFn>,
}

impl<D: Dial> Dialer<D> {
    pub fn new(config: Config, dialer: D) -> Self {
        Self {
            config,
            dialer,
            on_dial: None,
            on_conn_close: None,
        }
    }

    /// 设置拨号回调，成功和失败的拨号都会触发
    pub fn on_dial(mut self, f: impl Fn(&str, Option<&SshError>) + Send + Sync + 'static) -> Self {
        self.on_dial = Some(Arc::new(f));
        self
    }

    /// 设置连接关闭回调
    pub fn on_conn_close(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_conn_close = Some(Arc::new(f));
        self
    }

    /// 连接 `addr` 所指主机的 SSH 端口并启动 shell
    ///
    /// `addr` 中的端口不使用，可以省略。
    pub async fn dial_context(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
    ) -> Result<ProxyConn<D::Client>, SshError> {
        let host = host_of(addr);
        let result = self.connect(ctx, network, &host).await;
        if let Some(f) = &self.on_dial {
            f(&host, result.as_ref().err());
        }
        result
    }

    async fn connect(
        &self,
        ctx: &Context,
        network: Network,
        host: &str,
    ) -> Result<ProxyConn<D::Client>, SshError> {
        tracing::info!(host = %host, "连接远程主机...");

        let ssh_addr = join_host_port(host, self.config.port);
        let client = self
            .dialer
            .dial(ctx, network, &ssh_addr, &self.config.client)
            .await
            .map_err(SshError::dial_failed)?;
        let client = Arc::new(client);

        tracing::info!(host = %host, "启动会话");

        let free: FreeFn = {
            let host = host.to_string();
            let on_conn_close = self.on_conn_close.clone();
            Box::new(move || {
                if let Some(f) = on_conn_close {
                    f(&host);
                }
                tracing::info!(host = %host, "连接已关闭");
            })
        };

        let stderr = Box::new(LogStderr::new(host));
        let mut conn = match ProxyConn::open(Arc::clone(&client), stderr, Some(free)).await {
            Ok(conn) => conn,
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    tracing::debug!(host = %host, "关闭 SSH 连接失败: {}", close_err);
                }
                return Err(SshError::connect_failed(e));
            }
        };

        tracing::info!(host = %host, "已连接");

        if self.config.keepalive_enabled() {
            tracing::info!(host = %host, "启动 SSH keepalive");
            let done = CancellationToken::new();
            spawn_keepalive(
                client,
                self.config.server_alive_interval,
                self.config.server_alive_count_max,
                done.clone(),
            );
            conn.attach_keepalive(done);
        }

        Ok(conn)
    }
}

/// 取出地址中的主机部分，没有端口时整体作为主机
fn host_of(addr: &str) -> String {
    match split_host_port(addr) {
        Ok((host, _)) => host,
        Err(_) => addr.trim_start_matches('[').trim_end_matches(']').to_string(),
    }
}

/// 把远程 shell 的 stderr 输出写入日志
pub struct LogStderr {
    host: String,
}

impl LogStderr {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl io::Write for LogStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        tracing::info!(host = %self.host, stderr = %text.trim_end(), "远程 stderr");
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
