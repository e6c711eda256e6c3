//! Shell 代理连接
//!
//! 写入数据发送到远程 shell 的 stdin，读取数据来自远程 shell 的 stdout。

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::ssh::client::{BoxedReader, BoxedWriter, ShellSession, SshClient, StderrSink};
use crate::ssh::tunnel::{poll_read_live, spawn_client_close, FreeFn};
use crate::utils::error::SshError;

/// 基于远程 shell 会话的连接
pub struct ProxyConn<C: SshClient> {
    client: Arc<C>,
    session: C::Session,
    stdin: BoxedWriter,
    stdout: BoxedReader,
    /// keepalive 停止信号
    done: Option<CancellationToken>,
    free: Option<FreeFn>,
    closed: bool,
}

impl<C: SshClient> ProxyConn<C> {
    /// 打开新会话并启动 shell
    ///
    /// 失败时不会关闭客户端，由调用方负责。
    pub async fn open(client: Arc<C>, stderr: StderrSink, free: Option<FreeFn>) -> Result<Self, SshError> {
        let mut session = client.new_session().await?;

        match Self::start(&mut session, stderr).await {
            Ok((stdin, stdout)) => Ok(Self {
                client,
                session,
                stdin,
                stdout,
                done: None,
                free,
                closed: false,
            }),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    async fn start(
        session: &mut C::Session,
        stderr: StderrSink,
    ) -> Result<(BoxedWriter, BoxedReader), SshError> {
        let stdin = session.stdin_pipe()?;
        let stdout = session.stdout_pipe()?;
        session.set_stderr(stderr);
        session.shell().await?;
        Ok((stdin, stdout))
    }

    /// 绑定 keepalive 停止信号，连接关闭时触发
    pub(crate) fn attach_keepalive(&mut self, done: CancellationToken) {
        self.done = Some(done);
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    fn stop_keepalive(&mut self) {
        if let Some(done) = self.done.take() {
            done.cancel();
        }
    }

    fn run_free(&mut self) {
        if let Some(free) = self.free.take() {
            free();
        }
    }
}

impl<C: SshClient> AsyncRead for ProxyConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_read_live(Pin::new(&mut this.stdout), this.client.as_ref(), cx, buf)
    }
}

impl<C: SshClient> AsyncWrite for ProxyConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl<C: SshClient> Conn for ProxyConn<C> {
    fn local_addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.client.remote_addr()
    }

    /// 关闭会话和客户端，两者的错误都会返回
    async fn close(mut self) -> Result<(), SshError> {
        self.closed = true;
        self.stop_keepalive();

        let mut errors = Vec::new();
        if let Err(e) = self.session.close().await {
            errors.push(e);
        }
        if let Err(e) = self.client.close().await {
            errors.push(e);
        }

        self.run_free();
        SshError::combine(errors)
    }
}

impl<C: SshClient> Drop for ProxyConn<C> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.stop_keepalive();
        spawn_client_close(Arc::clone(&self.client));
        self.run_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::ssh::testing::{MockClient, SessionFailure};

    fn sink() -> StderrSink {
        Box::new(io::sink())
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let client = Arc::new(MockClient::new());
        let mut conn = ProxyConn::open(client, sink(), None).await.unwrap();

        conn.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_setup_failure_stages() {
        for stage in [
            SessionFailure::NewSession,
            SessionFailure::StdinPipe,
            SessionFailure::StdoutPipe,
            SessionFailure::Shell,
        ] {
            let client = Arc::new(MockClient::new().with_session_failure(stage));
            let result = ProxyConn::open(client.clone(), sink(), None).await;
            assert!(matches!(result, Err(SshError::Session(_))), "{:?}", stage);
            assert_eq!(client.close_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_close_aggregates_errors_and_frees() {
        let client = Arc::new(
            MockClient::new()
                .with_failing_session_close()
                .with_failing_close(),
        );
        let count = Arc::new(AtomicUsize::new(0));
        let hook = count.clone();
        let free: FreeFn = Box::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        let conn = ProxyConn::open(client.clone(), sink(), Some(free)).await.unwrap();
        let err = conn.close().await.unwrap_err();

        match err {
            SshError::Multiple(errors) => {
                assert!(matches!(errors[0], SshError::Session(_)));
                assert!(matches!(errors[1], SshError::Protocol(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(client.session_close_count(), 1);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_keepalive() {
        let client = Arc::new(MockClient::new());
        let done = CancellationToken::new();
        let mut conn = ProxyConn::open(client, sink(), None).await.unwrap();
        conn.attach_keepalive(done.clone());

        conn.close().await.unwrap();
        assert!(done.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_after_client_closed_is_error() {
        let client = Arc::new(MockClient::new());
        let mut conn = ProxyConn::open(client.clone(), sink(), None).await.unwrap();

        client.close().await.unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_deadlines_unsupported() {
        let conn = ProxyConn::open(Arc::new(MockClient::new()), sink(), None)
            .await
            .unwrap();
        let now = std::time::Instant::now();
        assert!(matches!(conn.set_deadline(now), Err(SshError::Unsupported(_))));
        assert!(matches!(conn.set_read_deadline(now), Err(SshError::Unsupported(_))));
        assert!(matches!(conn.set_write_deadline(now), Err(SshError::Unsupported(_))));
    }
}
