//! RPC 客户端
//!
//! 在连接上逐个发送 JSON-RPC 请求并等待对应响应。

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::conn::Conn;
use crate::utils::error::SshError;

use super::types::{JsonRpcRequest, JsonRpcResponse};

/// RPC 客户端
pub struct RpcClient<C> {
    stream: BufReader<C>,
    next_id: u64,
}

impl<C: AsyncRead + AsyncWrite + Unpin> RpcClient<C> {
    pub fn new(conn: C) -> Self {
        Self {
            stream: BufReader::new(conn),
            next_id: 1,
        }
    }

    /// 调用方法并返回结果
    ///
    /// 对端返回错误时得到 [`SshError::Rpc`]，连接在响应前结束时得到
    /// [`SshError::Closed`]。
    pub async fn call(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, SshError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;
        let writer = self.stream.get_mut();
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let response = self.read_response(id).await?;
        match (response.result, response.error) {
            (_, Some(error)) => Err(SshError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }

    /// 读取与 `id` 对应的响应，跳过空行和其他 id 的响应
    async fn read_response(&mut self, id: u64) -> Result<JsonRpcResponse, SshError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(SshError::Closed);
            }

            let line_trimmed = line.trim();
            if line_trimmed.is_empty() {
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_str(line_trimmed)?;
            if response.id == serde_json::Value::from(id) {
                return Ok(response);
            }
            tracing::warn!("忽略未匹配的响应 (id={})", response.id);
        }
    }
}

impl<C: Conn> RpcClient<C> {
    /// 关闭底层连接
    pub async fn close(self) -> Result<(), SshError> {
        self.stream.into_inner().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::io::Builder;

    use crate::rpc::server::RpcServer;
    use crate::shell::listener::Listener;

    #[tokio::test]
    async fn test_call_returns_result() {
        let mock = Builder::new()
            .write(br#"{"jsonrpc":"2.0","method":"agent.ping","id":1}"#)
            .write(b"\n")
            .read(b"{\"jsonrpc\":\"2.0\",\"result\":\"pong\",\"id\":1}\n")
            .build();

        let mut client = RpcClient::new(mock);
        assert_eq!(client.call("agent.ping", None).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_call_maps_error_response() {
        let mock = Builder::new()
            .write(br#"{"jsonrpc":"2.0","method":"agent.nope","id":1}"#)
            .write(b"\n")
            .read(b"\n")
            .read(b"{\"jsonrpc\":\"2.0\",\"error\":{\"code\":-32601,\"message\":\"Method not found: agent.nope\"},\"id\":1}\n")
            .build();

        let mut client = RpcClient::new(mock);
        match client.call("agent.nope", None).await {
            Err(SshError::Rpc { code, message }) => {
                assert_eq!(code, -32601);
                assert!(message.contains("agent.nope"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_before_response_is_closed() {
        let mock = Builder::new()
            .write(br#"{"jsonrpc":"2.0","method":"agent.ping","id":1}"#)
            .write(b"\n")
            .build();

        let mut client = RpcClient::new(mock);
        assert!(matches!(
            client.call("agent.ping", None).await,
            Err(SshError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_against_server_over_listener() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_in, server_out) = tokio::io::split(server_end);
        let listener = Listener::new(server_out, server_in);
        let serving = tokio::spawn(async move { RpcServer::new().serve_listener(&listener).await });

        let mut client = RpcClient::new(client_end);
        assert_eq!(client.call("agent.ping", None).await.unwrap(), json!("pong"));
        assert_eq!(
            client.call("agent.echo", Some(json!([1, "two"]))).await.unwrap(),
            json!([1, "two"])
        );
        assert_eq!(client.next_id, 3);

        drop(client);
        serving.await.unwrap();
    }
}
