//! RPC 通信模块
//!
//! 实现按行传输的 JSON-RPC 2.0 协议，可运行在任意连接之上。

pub mod client;
pub mod methods;
pub mod server;
pub mod types;

pub use client::RpcClient;
pub use server::RpcServer;
pub use types::*;
