//! 测试用 SSH 客户端
//!
//! [`MockClient`] 可以脚本化 keepalive 结果、远程拨号结果和会话失败阶段，
//! 克隆共享同一状态，测试在连接对象持有客户端后仍能检查它。

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use crate::conn::PLACEHOLDER_ADDR;
use crate::utils::context::Context;
use crate::utils::error::SshError;

use super::client::{BoxedReader, BoxedStream, BoxedWriter, ShellSession, SshClient, StderrSink};
use super::config::ClientConfig;
use super::dial::{Dial, Network};

const PIPE_SIZE: usize = 4096;

/// 会话失败阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailure {
    NewSession,
    StdinPipe,
    StdoutPipe,
    Shell,
}

#[derive(Default)]
struct MockState {
    closed: CancellationToken,
    close_count: AtomicUsize,
    fail_close: AtomicBool,
    probes: AtomicUsize,
    probe_script: Mutex<VecDeque<bool>>,
    probe_default_ok: AtomicBool,
    /// 对端不再回复 keepalive
    silent: AtomicBool,
    reachable: Mutex<HashSet<String>>,
    dial_attempts: Mutex<Vec<String>>,
    /// 远程通道的对端，保持打开直到客户端被丢弃
    peers: Mutex<Vec<DuplexStream>>,
    session_failure: Mutex<Option<SessionFailure>>,
    fail_session_close: AtomicBool,
    session_closes: AtomicUsize,
    stderr_banner: Mutex<Option<Vec<u8>>>,
}

/// 测试用 SSH 客户端
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    /// keepalive 默认成功、没有可达的远程主机
    pub fn new() -> Self {
        let client = Self::default();
        client.state.probe_default_ok.store(true, Ordering::SeqCst);
        client
    }

    /// 远程拨号 `host` 时成功
    pub fn with_reachable(self, host: &str) -> Self {
        self.state.reachable.lock().unwrap().insert(host.to_string());
        self
    }

    /// 依次返回脚本中的 keepalive 结果，用完后按 `then_ok` 返回
    pub fn with_probe_script(self, script: &[bool], then_ok: bool) -> Self {
        self.state
            .probe_script
            .lock()
            .unwrap()
            .extend(script.iter().copied());
        self.state.probe_default_ok.store(then_ok, Ordering::SeqCst);
        self
    }

    /// keepalive 请求发出后一直等不到回复，直到客户端被关闭
    pub fn with_silent_peer(self) -> Self {
        self.state.silent.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_session_failure(self, stage: SessionFailure) -> Self {
        *self.state.session_failure.lock().unwrap() = Some(stage);
        self
    }

    pub fn with_failing_close(self) -> Self {
        self.state.fail_close.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_failing_session_close(self) -> Self {
        self.state.fail_session_close.store(true, Ordering::SeqCst);
        self
    }

    /// shell 启动时写入 stderr 的内容
    pub fn with_stderr_banner(self, banner: &[u8]) -> Self {
        *self.state.stderr_banner.lock().unwrap() = Some(banner.to_vec());
        self
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn session_close_count(&self) -> usize {
        self.state.session_closes.load(Ordering::SeqCst)
    }

    /// 远程拨号尝试记录（`host:port`）
    pub fn dial_attempts(&self) -> Vec<String> {
        self.state.dial_attempts.lock().unwrap().clone()
    }

    fn fails_at(&self, stage: SessionFailure) -> bool {
        *self.state.session_failure.lock().unwrap() == Some(stage)
    }
}

#[async_trait::async_trait]
impl SshClient for MockClient {
    type Session = MockSession;

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SshError> {
        self.state
            .dial_attempts
            .lock()
            .unwrap()
            .push(format!("{}:{}", host, port));

        if self.is_closed() {
            return Err(SshError::Closed);
        }
        if !self.state.reachable.lock().unwrap().contains(host) {
            return Err(SshError::Channel(format!("{}:{} refused", host, port)));
        }

        let (local, remote) = tokio::io::duplex(PIPE_SIZE);
        self.state.peers.lock().unwrap().push(remote);
        Ok(Box::new(local))
    }

    async fn new_session(&self) -> Result<MockSession, SshError> {
        if self.fails_at(SessionFailure::NewSession) {
            return Err(SshError::Session("new session refused".to_string()));
        }
        Ok(MockSession::new(self.clone()))
    }

    async fn send_keepalive(&self) -> Result<(), SshError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(SshError::Closed);
        }
        if self.state.silent.load(Ordering::SeqCst) {
            self.state.closed.cancelled().await;
            return Err(SshError::Closed);
        }
        let ok = self
            .state
            .probe_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.state.probe_default_ok.load(Ordering::SeqCst));
        if ok {
            Ok(())
        } else {
            Err(SshError::Protocol("no reply".to_string()))
        }
    }

    async fn close(&self) -> Result<(), SshError> {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        self.state.closed.cancel();
        // 连接关闭时所有远程通道随之结束
        self.state.peers.lock().unwrap().clear();
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(SshError::Protocol("client close failed".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    fn local_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    fn remote_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }
}

/// 回显 shell：stdin 写入的内容原样出现在 stdout，客户端关闭后 stdout 结束
pub struct MockSession {
    client: MockClient,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    /// 回显任务持有的两端
    shell_ends: Option<(DuplexStream, DuplexStream)>,
    stderr: Option<StderrSink>,
    stop: CancellationToken,
}

impl MockSession {
    fn new(client: MockClient) -> Self {
        let (stdin, shell_in) = tokio::io::duplex(PIPE_SIZE);
        let (shell_out, stdout) = tokio::io::duplex(PIPE_SIZE);
        Self {
            client,
            stdin: Some(stdin),
            stdout: Some(stdout),
            shell_ends: Some((shell_in, shell_out)),
            stderr: None,
            stop: CancellationToken::new(),
        }
    }
}

#[async_trait::async_trait]
impl ShellSession for MockSession {
    fn stdin_pipe(&mut self) -> Result<BoxedWriter, SshError> {
        if self.client.fails_at(SessionFailure::StdinPipe) {
            return Err(SshError::Session("stdin refused".to_string()));
        }
        let stdin = self
            .stdin
            .take()
            .ok_or_else(|| SshError::Session("stdin taken".to_string()))?;
        Ok(Box::new(stdin))
    }

    fn stdout_pipe(&mut self) -> Result<BoxedReader, SshError> {
        if self.client.fails_at(SessionFailure::StdoutPipe) {
            return Err(SshError::Session("stdout refused".to_string()));
        }
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| SshError::Session("stdout taken".to_string()))?;
        Ok(Box::new(stdout))
    }

    fn set_stderr(&mut self, sink: StderrSink) {
        self.stderr = Some(sink);
    }

    async fn shell(&mut self) -> Result<(), SshError> {
        if self.client.fails_at(SessionFailure::Shell) {
            return Err(SshError::Session("shell refused".to_string()));
        }
        let (mut shell_in, mut shell_out) = self
            .shell_ends
            .take()
            .ok_or_else(|| SshError::Session("shell started".to_string()))?;

        let banner = self.client.state.stderr_banner.lock().unwrap().clone();
        if let (Some(sink), Some(banner)) = (self.stderr.as_mut(), banner) {
            sink.write_all(&banner)?;
        }

        let closed = self.client.state.closed.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = stop.cancelled() => {}
                _ = tokio::io::copy(&mut shell_in, &mut shell_out) => {}
            }
            let _ = shell_out.shutdown().await;
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.client.state.session_closes.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        if self.client.state.fail_session_close.load(Ordering::SeqCst) {
            return Err(SshError::Session("session close failed".to_string()));
        }
        Ok(())
    }
}

/// 返回预设客户端的拨号器，克隆共享拨号计数
#[derive(Clone)]
pub struct MockDial {
    client: Option<MockClient>,
    attempts: Arc<AtomicUsize>,
}

impl MockDial {
    pub fn ok(client: MockClient) -> Self {
        Self {
            client: Some(client),
            attempts: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            client: None,
            attempts: Arc::default(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Dial for MockDial {
    type Client = MockClient;

    async fn dial(
        &self,
        ctx: &Context,
        _network: Network,
        addr: &str,
        _config: &ClientConfig,
    ) -> Result<MockClient, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        self.client
            .clone()
            .ok_or_else(|| SshError::Handshake(format!("{}: refused", addr)))
    }
}
