//! 单连接监听器
//!
//! 把一对 reader/writer（通常是进程的 stdin/stdout）包装为只产生一个连接的监听器，
//! 让通用的连接服务循环可以在管道上运行。
//!
//! 第一次 `accept` 返回连接；之后的 `accept` 阻塞到该连接关闭，再返回 `None`，
//! 服务循环随之结束。

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, Stdin, Stdout};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::conn::{Conn, PLACEHOLDER_ADDR};
use crate::utils::error::SshError;

enum State<W, R> {
    /// 尚未产生连接
    Idle { writer: W, reader: R },
    /// 连接使用中，信号在连接关闭时触发
    Serving(CancellationToken),
    /// 连接已关闭
    Drained,
}

/// 只产生一个连接的监听器
pub struct Listener<W, R> {
    state: Mutex<State<W, R>>,
}

impl Listener<Stdout, Stdin> {
    /// 基于进程 stdin/stdout 的监听器
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdout(), tokio::io::stdin())
    }
}

impl<W, R> Listener<W, R>
where
    W: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            state: Mutex::new(State::Idle { writer, reader }),
        }
    }

    /// 接受连接
    ///
    /// 返回 `None` 表示不会再有新连接。
    pub async fn accept(&self) -> Option<ListenerConn<W, R>> {
        let mut state = self.state.lock().await;
        let done = match std::mem::replace(&mut *state, State::Drained) {
            State::Idle { writer, reader } => {
                let done = CancellationToken::new();
                *state = State::Serving(done.clone());
                return Some(ListenerConn {
                    writer,
                    reader: Some(reader),
                    done,
                });
            }
            State::Serving(done) => {
                *state = State::Serving(done.clone());
                done
            }
            State::Drained => return None,
        };
        drop(state);

        // 阻塞服务循环，直到唯一的连接结束
        done.cancelled().await;
        *self.state.lock().await = State::Drained;
        None
    }

    /// 不支持关闭监听器
    pub fn close(&self) -> Result<(), SshError> {
        Err(SshError::Unsupported("关闭监听器"))
    }

    pub fn addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }
}

/// 监听器产生的连接
pub struct ListenerConn<W, R> {
    writer: W,
    reader: Option<R>,
    done: CancellationToken,
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> AsyncRead for ListenerConn<W, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().reader.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> AsyncWrite for ListenerConn<W, R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[async_trait::async_trait]
impl<W, R> Conn for ListenerConn<W, R>
where
    W: AsyncWrite + Send + Unpin,
    R: AsyncRead + Send + Unpin,
{
    fn local_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    fn remote_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    /// 刷新输出、释放输入，然后唤醒等待中的 `accept`
    async fn close(mut self) -> Result<(), SshError> {
        let result = self.writer.flush().await;
        self.reader.take();
        self.done.cancel();
        result.map_err(SshError::from)
    }
}

impl<W, R> Drop for ListenerConn<W, R> {
    fn drop(&mut self) {
        self.reader.take();
        self.done.cancel();
    }
}
