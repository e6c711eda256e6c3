//! RPC 服务器实现
//!
//! 在任意连接上按行收发 JSON-RPC 2.0 消息。配合单连接监听器，
//! 可以直接在进程的 stdin/stdout 上提供服务。

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::conn::Conn;
use crate::shell::listener::Listener;
use crate::utils::error::SshError;

use super::methods::RpcMethods;
use super::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// RPC 服务器
#[derive(Clone, Default)]
pub struct RpcServer {
    methods: Arc<RpcMethods>,
}

impl RpcServer {
    /// 创建新的 RPC 服务器
    pub fn new() -> Self {
        Self {
            methods: Arc::new(RpcMethods::new()),
        }
    }

    /// 为监听器产生的每个连接启动服务任务，监听器结束后返回
    pub async fn serve_listener<W, R>(&self, listener: &Listener<W, R>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        while let Some(conn) = listener.accept().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(conn).await {
                    tracing::error!("RPC 连接出错: {}", e);
                }
            });
        }
        tracing::info!("监听器已结束");
    }

    /// 服务单个连接，对端关闭输入后关闭连接
    pub async fn serve<C: Conn>(&self, conn: C) -> Result<(), SshError> {
        let mut reader = BufReader::new(conn);
        let result = self.serve_stream(&mut reader).await;
        let close_result = reader.into_inner().close().await;
        result.and(close_result)
    }

    /// 读取请求并写回响应，直到读到 EOF
    pub async fn serve_stream<S>(&self, stream: &mut BufReader<S>) -> Result<(), SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = stream.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF，退出
                tracing::info!("输入关闭，退出");
                return Ok(());
            }

            let line_trimmed = line.trim();
            if line_trimmed.is_empty() {
                continue;
            }

            let response = self.handle_request(line_trimmed).await;

            // 发送响应
            let response_json = serde_json::to_string(&response)?;
            let writer = stream.get_mut();
            writer.write_all(response_json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
    }

    /// 处理单个请求
    async fn handle_request(&self, line: &str) -> JsonRpcResponse {
        // 解析 JSON
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                return JsonRpcResponse::error(
                    serde_json::Value::Null,
                    JsonRpcError::parse_error(format!("JSON 解析错误: {}", e)),
                );
            }
        };

        // 验证 JSON-RPC 版本
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_request("无效的 JSON-RPC 版本"),
            );
        }

        tracing::debug!(method = %request.method, "RPC 请求");
        self.methods
            .call(&request.method, request.params, request.id)
            .await
    }
}
