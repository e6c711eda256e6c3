//! SSH 连接模块
//!
//! 负责 SSH 连接的拨号、保活和隧道。

pub mod auth;
pub mod client;
pub mod config;
pub mod dial;
pub mod keepalive;
pub mod proxy;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{RusshClient, ShellSession, SshClient};
pub use config::{ClientConfig, Config};
pub use dial::{ContextDialer, Dial, Network};
pub use keepalive::{keep_alive, spawn_keepalive, KeepaliveExit};
pub use proxy::{BindOrder, ProxyDialer};
pub use tunnel::Tunnel;
