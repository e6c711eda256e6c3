//! RPC 方法注册和调用
//!
//! 实现 JSON-RPC 方法的分发。

use super::types::{JsonRpcError, JsonRpcResponse};

/// RPC 方法处理器
#[derive(Debug, Clone, Default)]
pub struct RpcMethods;

impl RpcMethods {
    /// 创建新的方法处理器
    pub fn new() -> Self {
        Self
    }

    /// 调用指定方法
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> JsonRpcResponse {
        match method {
            "agent.ping" => JsonRpcResponse::success(id, serde_json::json!("pong")),
            "agent.version" => self.agent_version(id),
            "agent.echo" => self.agent_echo(params, id),
            _ => JsonRpcResponse::error(id, JsonRpcError::method_not_found(method)),
        }
    }

    /// 版本信息
    fn agent_version(&self, id: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    /// 原样返回参数
    fn agent_echo(&self, params: Option<serde_json::Value>, id: serde_json::Value) -> JsonRpcResponse {
        match params {
            Some(p) => JsonRpcResponse::success(id, p),
            None => JsonRpcResponse::error(id, JsonRpcError::invalid_params("缺少参数")),
        }
    }
}
