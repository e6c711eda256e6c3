//! SSH 隧道连接
//!
//! 通过 SSH 连接打开的远程通道。隧道独占它的客户端：关闭隧道会停止
//! keepalive、关闭客户端，最后调用释放回调。

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::conn::Conn;
use crate::utils::error::SshError;

use super::client::{BoxedStream, SshClient};

/// 释放回调
pub type FreeFn = Box<dyn FnOnce() + Send>;

/// 读取数据，客户端关闭后读到的 EOF 转换为连接已关闭错误
pub(crate) fn poll_read_live<R, C>(
    reader: Pin<&mut R>,
    client: &C,
    cx: &mut TaskContext<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>>
where
    R: AsyncRead + ?Sized,
    C: SshClient,
{
    let before = buf.filled().len();
    ready!(reader.poll_read(cx, buf))?;
    if buf.filled().len() == before && buf.remaining() > 0 && client.is_closed() {
        return Poll::Ready(Err(SshError::Closed.into()));
    }
    Poll::Ready(Ok(()))
}

/// 在后台尽力关闭客户端（没有运行时时跳过）
pub(crate) fn spawn_client_close<C: SshClient>(client: Arc<C>) {
    if client.is_closed() {
        return;
    }
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = client.close().await {
                tracing::debug!("后台关闭 SSH 连接失败: {}", e);
            }
        });
    }
}

/// SSH 隧道连接
pub struct Tunnel<C: SshClient> {
    stream: BoxedStream,
    client: Arc<C>,
    /// keepalive 停止信号
    done: Option<CancellationToken>,
    free: Option<FreeFn>,
    closed: bool,
}

impl<C: SshClient> Tunnel<C> {
    pub(crate) fn new(
        stream: BoxedStream,
        client: Arc<C>,
        done: Option<CancellationToken>,
        free: Option<FreeFn>,
    ) -> Self {
        Self {
            stream,
            client,
            done,
            free,
            closed: false,
        }
    }

    /// 隧道使用的 SSH 客户端
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

impl<C: SshClient> AsyncRead for Tunnel<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_read_live(Pin::new(&mut this.stream), this.client.as_ref(), cx, buf)
    }
}

impl<C: SshClient> AsyncWrite for Tunnel<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl<C: SshClient> Conn for Tunnel<C> {
    /// SSH 连接的本地地址
    ///
    /// direct-tcpip 通道没有独立的套接字地址，这里返回承载通道的 SSH 连接地址。
    fn local_addr(&self) -> SocketAddr {
        self.client.local_addr()
    }

    /// SSH 服务器地址，而不是远程目标地址
    fn remote_addr(&self) -> SocketAddr {
        self.client.remote_addr()
    }

    /// 停止 keepalive 并关闭客户端，释放回调最后执行
    async fn close(mut self) -> Result<(), SshError> {
        self.closed = true;
        self.stop_keepalive();
        let result = self.client.close().await;
        self.run_free();
        result
    }
}

impl<C: SshClient> Drop for Tunnel<C> {
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
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::ssh::testing::MockClient;

    fn counting_free() -> (Arc<AtomicUsize>, FreeFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&count);
        (count, Box::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[tokio::test]
    async fn test_close_releases_in_order() {
        let client = Arc::new(MockClient::new());
        let done = CancellationToken::new();
        let (stream, _peer) = tokio::io::duplex(64);

        // 回调执行时客户端和 keepalive 都已停止
        let observed = client.clone();
        let observed_done = done.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        let free: FreeFn = Box::new(move || {
            assert!(observed.is_closed());
            assert!(observed_done.is_cancelled());
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

        let tunnel = Tunnel::new(Box::new(stream), client.clone(), Some(done.clone()), Some(free));
        tunnel.close().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_error_still_frees() {
        let client = Arc::new(MockClient::new().with_failing_close());
        let (stream, _peer) = tokio::io::duplex(64);
        let (count, free) = counting_free();

        let tunnel = Tunnel::new(Box::new(stream), client, None, Some(free));
        assert!(tunnel.close().await.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_passthrough() {
        let client = Arc::new(MockClient::new());
        let (stream, mut peer) = tokio::io::duplex(64);
        let mut tunnel = Tunnel::new(Box::new(stream), client, None, None);

        tunnel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_read_after_client_closed_is_error() {
        let client = Arc::new(MockClient::new());
        let (stream, peer) = tokio::io::duplex(64);
        let mut tunnel = Tunnel::new(Box::new(stream), client.clone(), None, None);

        client.close().await.unwrap();
        drop(peer);

        let mut buf = [0u8; 8];
        let err = tunnel.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_eof_on_live_client_is_clean() {
        let client = Arc::new(MockClient::new());
        let (stream, peer) = tokio::io::duplex(64);
        let mut tunnel = Tunnel::new(Box::new(stream), client, None, None);
        drop(peer);

        let mut buf = [0u8; 8];
        assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_everything() {
        let client = Arc::new(MockClient::new());
        let done = CancellationToken::new();
        let (stream, _peer) = tokio::io::duplex(64);
        let (count, free) = counting_free();

        drop(Tunnel::new(Box::new(stream), client.clone(), Some(done.clone()), Some(free)));

        assert!(done.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("client was not closed");
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn test_addresses_and_deadlines() {
        let client = Arc::new(MockClient::new());
        let (stream, _peer) = tokio::io::duplex(64);
        let tunnel = Tunnel::new(Box::new(stream), client, None, None);

        assert_eq!(tunnel.local_addr(), crate::conn::PLACEHOLDER_ADDR);
        assert_eq!(tunnel.remote_addr(), tunnel.client().remote_addr());
        assert!(matches!(
            tunnel.set_deadline(std::time::Instant::now()),
            Err(SshError::Unsupported(_))
        ));
    }
}
