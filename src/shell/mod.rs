//! Shell 传输模块
//!
//! 客户端通过 SSH 启动远程 shell，把 shell 的 stdin/stdout 当作连接；
//! 远端在 stdin/stdout 上用单连接监听器提供服务。

pub mod conn;
pub mod dialer;
pub mod listener;

pub use conn::ProxyConn;
pub use dialer::{Dialer, LogStderr};
pub use listener::{Listener, ListenerConn};
