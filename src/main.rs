//! SSH Tunnel CLI 入口点
//!
//! 主要功能：
//! - `serve`：在 stdin/stdout 上提供 JSON-RPC 服务，作为远程登录 shell 运行
//! - `call`：通过远程 shell 连接调用一次 JSON-RPC 方法
//! - `forward`：把本地 TCP 连接经 SSH 隧道转发到远程服务

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ssh_tunnel::conn::Conn;
use ssh_tunnel::rpc::{RpcClient, RpcServer};
use ssh_tunnel::shell::{Dialer, Listener};
use ssh_tunnel::ssh::auth::AuthMethod;
use ssh_tunnel::ssh::{BindOrder, Config, ContextDialer, Network, ProxyDialer};
use ssh_tunnel::utils::Context;

#[derive(Parser, Debug)]
#[command(name = "ssh-tunnel-cli", version, about = "SSH tunnel and shell-backed JSON-RPC")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在 stdin/stdout 上提供 JSON-RPC 服务
    Serve,

    /// 通过远程 shell 调用 JSON-RPC 方法
    Call {
        #[command(flatten)]
        ssh: SshArgs,

        /// 远程主机
        #[arg(long)]
        host: String,

        /// 方法名
        #[arg(long, default_value = "agent.ping")]
        method: String,

        /// JSON 格式的参数
        #[arg(long)]
        params: Option<String>,

        /// 调用超时（秒）
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// 经 SSH 隧道转发本地 TCP 连接
    Forward {
        #[command(flatten)]
        ssh: SshArgs,

        /// 远程目标（host:port）
        #[arg(long)]
        target: String,

        /// 本地监听地址
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: String,

        /// 远程拨号先尝试目标主机，再尝试通配地址
        #[arg(long)]
        target_first: bool,
    },
}

#[derive(Args, Debug)]
struct SshArgs {
    /// JSON 配置文件
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SSH 端口
    #[arg(long)]
    port: Option<u16>,

    /// SSH 用户名
    #[arg(long)]
    user: Option<String>,

    /// 私钥文件
    #[arg(long, value_name = "FILE")]
    identity_file: Option<String>,

    /// 网络类型（tcp、tcp4、tcp6）
    #[arg(long, default_value = "tcp")]
    network: Network,
}

impl SshArgs {
    /// 依次应用配置文件、环境变量和命令行参数
    fn load_config(&self) -> anyhow::Result<Config> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("无法加载配置文件: {}", path.display()))?,
            None => Config::default(),
        };
        let mut config = config.with_env_overrides()?;

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.client.user = user.clone();
        }
        if let Some(path) = &self.identity_file {
            config.client.auth = AuthMethod::PrivateKey {
                path: path.clone(),
                passphrase: None,
            };
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，输出到 stderr 避免干扰 stdout 上的协议数据
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve => serve().await,
        Command::Call {
            ssh,
            host,
            method,
            params,
            timeout,
        } => call(ssh, &host, &method, params.as_deref(), Duration::from_secs(timeout)).await,
        Command::Forward {
            ssh,
            target,
            listen,
            target_first,
        } => forward(ssh, &target, &listen, target_first).await,
    }
}

async fn serve() -> anyhow::Result<()> {
    tracing::info!("SSH Tunnel agent 启动");

    let listener = Listener::stdio();
    RpcServer::new().serve_listener(&listener).await;

    Ok(())
}

async fn call(
    ssh: SshArgs,
    host: &str,
    method: &str,
    params: Option<&str>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let config = ssh.load_config()?;
    let params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("无效的 JSON 参数")?;

    let ctx = Context::background().with_timeout(config.client.connect_timeout);
    let dialer = Dialer::new(config, ContextDialer::new()).on_dial(|host, err| match err {
        Some(e) => tracing::warn!(host = %host, "拨号失败: {}", e),
        None => tracing::debug!(host = %host, "拨号成功"),
    });

    let conn = dialer.dial_context(&ctx, ssh.network, host).await?;
    let mut client = RpcClient::new(conn);

    let result = tokio::time::timeout(timeout, client.call(method, params))
        .await
        .context("调用超时");
    let close_result = client.close().await;

    let value = result??;
    println!("{}", serde_json::to_string_pretty(&value)?);
    close_result?;
    Ok(())
}

async fn forward(ssh: SshArgs, target: &str, listen: &str, target_first: bool) -> anyhow::Result<()> {
    let config = ssh.load_config()?;
    let bind_order = if target_first {
        BindOrder::TargetFirst
    } else {
        BindOrder::WildcardFirst
    };
    let dialer = Arc::new(
        ProxyDialer::new(config, ContextDialer::new())
            .bind_order(bind_order)
            .on_dial(|host, err| {
                if let Some(e) = err {
                    tracing::warn!(host = %host, "隧道建立失败: {}", e);
                }
            })
            .on_conn_close(|host| tracing::debug!(host = %host, "隧道已释放")),
    );

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("无法监听 {}", listen))?;
    tracing::info!("转发 {} -> {}", listener.local_addr()?, target);

    loop {
        let (socket, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到中断信号，退出");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let dialer = Arc::clone(&dialer);
        let target = target.to_string();
        let network = ssh.network;
        tokio::spawn(async move {
            if let Err(e) = forward_one(&dialer, network, &target, socket).await {
                tracing::warn!(peer = %peer, "转发失败: {:#}", e);
            }
        });
    }
}

async fn forward_one(
    dialer: &ProxyDialer,
    network: Network,
    target: &str,
    mut socket: TcpStream,
) -> anyhow::Result<()> {
    let ctx = Context::background().with_timeout(dialer.config().client.connect_timeout);
    let mut tunnel = dialer.dial_context(&ctx, network, target).await?;

    let copied = tokio::io::copy_bidirectional(&mut socket, &mut tunnel).await;
    tunnel.close().await?;

    let (sent, received) = copied?;
    tracing::debug!(remote = %target, sent, received, "转发结束");
    Ok(())
}
