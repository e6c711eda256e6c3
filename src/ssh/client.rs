//! SSH 客户端
//!
//! [`SshClient`] 和 [`ShellSession`] 描述本 crate 对 SSH 库的全部依赖：
//! 打开远程通道、建立会话、发送 keepalive 请求和关闭连接。
//! 生产实现 [`RusshClient`] 基于 russh。

use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use russh::client::{Handle, Handler, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::utils::error::SshError;

/// 双向字节流
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// 远程通道字节流
pub type BoxedStream = Box<dyn ByteStream>;
/// 会话 stdout
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// 会话 stdin
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// 会话 stderr 接收端
pub type StderrSink = Box<dyn Write + Send>;

/// 已建立的 SSH 连接
#[async_trait::async_trait]
pub trait SshClient: Send + Sync + 'static {
    /// 交互式会话类型
    type Session: ShellSession;

    /// 以远端视角连接 `host:port`（direct-tcpip 通道）
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SshError>;

    /// 打开新会话
    async fn new_session(&self) -> Result<Self::Session, SshError>;

    /// 发送 `keepalive@openssh.com` 请求并等待回复
    ///
    /// 对端一直不回复时不会返回，由调用方限定等待时间。
    async fn send_keepalive(&self) -> Result<(), SshError>;

    /// 关闭连接
    async fn close(&self) -> Result<(), SshError>;

    /// 连接是否已关闭
    fn is_closed(&self) -> bool;

    /// 本地地址
    fn local_addr(&self) -> SocketAddr;

    /// 远程地址
    fn remote_addr(&self) -> SocketAddr;
}

/// 交互式会话
///
/// 必须在 [`shell`](ShellSession::shell) 之前获取 stdin/stdout 管道并设置 stderr。
#[async_trait::async_trait]
pub trait ShellSession: Send + Unpin + 'static {
    /// 获取 stdin 管道
    fn stdin_pipe(&mut self) -> Result<BoxedWriter, SshError>;

    /// 获取 stdout 管道
    fn stdout_pipe(&mut self) -> Result<BoxedReader, SshError>;

    /// 设置 stderr 接收端
    fn set_stderr(&mut self, sink: StderrSink);

    /// 启动远程 shell
    async fn shell(&mut self) -> Result<(), SshError>;

    /// 关闭会话
    async fn close(&mut self) -> Result<(), SshError>;
}

/// SSH 客户端事件处理器
pub struct ClientHandler {
    /// 目标地址（用于日志）
    addr: String,
}

impl ClientHandler {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Handler for ClientHandler {
    type Error = SshError;

    /// 检查服务器公钥
    ///
    /// 主机密钥校验策略由调用方负责，这里接受所有服务器密钥。
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::warn!(addr = %self.addr, "接受服务器密钥（未验证 known_hosts）");
        Ok(true)
    }
}

/// 基于 russh 的 SSH 客户端
pub struct RusshClient {
    handle: Handle<ClientHandler>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl RusshClient {
    pub fn new(handle: Handle<ClientHandler>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            handle,
            local_addr,
            remote_addr,
        }
    }
}

#[async_trait::async_trait]
impl SshClient for RusshClient {
    type Session = RusshShellSession;

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| SshError::Channel(format!("打开 {}:{} 失败: {}", host, port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn new_session(&self) -> Result<RusshShellSession, SshError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Session(format!("打开会话通道失败: {}", e)))?;
        Ok(RusshShellSession::new(channel))
    }

    async fn send_keepalive(&self) -> Result<(), SshError> {
        self.handle.send_ping().await?;
        // 会话任务退出时回复通道被丢弃，send_ping 同样会返回
        if self.handle.is_closed() {
            return Err(SshError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SshError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// stdout 管道缓冲区大小
const STDOUT_BUFFER_SIZE: usize = 64 * 1024;

/// 关闭会话时等待输出任务结束的时间
const PUMP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// 基于 russh 通道的交互式会话
///
/// shell 启动后由输出任务读取通道消息：普通数据写入 stdout 管道，
/// 扩展数据（stderr）写入 stderr 接收端。
pub struct RusshShellSession {
    /// 会话通道（shell 启动后移交给输出任务）
    channel: Option<Channel<Msg>>,
    /// stdout 管道读端（交给调用方）
    stdout_reader: Option<DuplexStream>,
    /// stdout 管道写端（交给输出任务）
    stdout_writer: Option<DuplexStream>,
    stdin_taken: bool,
    stderr: Option<StderrSink>,
    /// 停止信号
    stop: CancellationToken,
    /// 输出任务句柄
    output_task: Option<JoinHandle<()>>,
}

impl RusshShellSession {
    fn new(channel: Channel<Msg>) -> Self {
        let (stdout_reader, stdout_writer) = tokio::io::duplex(STDOUT_BUFFER_SIZE);
        Self {
            channel: Some(channel),
            stdout_reader: Some(stdout_reader),
            stdout_writer: Some(stdout_writer),
            stdin_taken: false,
            stderr: None,
            stop: CancellationToken::new(),
            output_task: None,
        }
    }

    fn channel(&self) -> Result<&Channel<Msg>, SshError> {
        self.channel
            .as_ref()
            .ok_or_else(|| SshError::Session("shell 已启动".to_string()))
    }
}

#[async_trait::async_trait]
impl ShellSession for RusshShellSession {
    fn stdin_pipe(&mut self) -> Result<BoxedWriter, SshError> {
        if self.stdin_taken {
            return Err(SshError::Session("stdin 管道已被获取".to_string()));
        }
        let writer = self.channel()?.make_writer();
        self.stdin_taken = true;
        Ok(Box::new(Box::pin(writer)))
    }

    fn stdout_pipe(&mut self) -> Result<BoxedReader, SshError> {
        self.channel()?;
        let reader = self
            .stdout_reader
            .take()
            .ok_or_else(|| SshError::Session("stdout 管道已被获取".to_string()))?;
        Ok(Box::new(reader))
    }

    fn set_stderr(&mut self, sink: StderrSink) {
        self.stderr = Some(sink);
    }

    async fn shell(&mut self) -> Result<(), SshError> {
        let Some(mut channel) = self.channel.take() else {
            return Err(SshError::Session("shell 已启动".to_string()));
        };
        if let Err(e) = channel.request_shell(true).await {
            self.channel = Some(channel);
            return Err(SshError::Session(format!("请求 shell 失败: {}", e)));
        }

        let mut stdout = self.stdout_writer.take();
        let mut stderr = self.stderr.take();
        let stop = self.stop.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = stop.cancelled() => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }

                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                if let Some(writer) = stdout.as_mut() {
                                    // 读端已被丢弃时继续消费通道，避免阻塞
                                    if writer.write_all(&data).await.is_err() {
                                        stdout = None;
                                    }
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                                if let Some(sink) = stderr.as_mut() {
                                    let _ = sink.write_all(&data);
                                }
                            }
                            Some(ChannelMsg::Eof) => {
                                stdout = None;
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                tracing::debug!("远程 shell 退出 (code={})", exit_status);
                            }
                            Some(ChannelMsg::Close) | None => break,
                            Some(other) => {
                                tracing::trace!("会话通道消息: {:?}", other);
                            }
                        }
                    }
                }
            }
        });

        self.output_task = Some(task);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.stop.cancel();

        if let Some(channel) = self.channel.take() {
            channel
                .close()
                .await
                .map_err(|e| SshError::Session(format!("关闭会话通道失败: {}", e)))?;
        }

        if let Some(mut task) = self.output_task.take() {
            if tokio::time::timeout(PUMP_SHUTDOWN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("会话输出任务未在超时内结束，强制终止");
                task.abort();
            }
        }

        Ok(())
    }
}

impl Drop for RusshShellSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
