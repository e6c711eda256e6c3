//! SSH 传输连接库
//!
//! 提供可取消的 SSH 拨号、keepalive 看门狗、SSH 隧道连接和基于远程 shell 的连接，
//! 以及运行在这些连接之上的 JSON-RPC 协议。

pub mod conn;
pub mod rpc;
pub mod shell;
pub mod ssh;
pub mod utils;

pub use conn::Conn;
pub use utils::{Context, SshError};
