//! Keepalive 看门狗
//!
//! 按固定间隔发送 `keepalive@openssh.com` 请求。连续失败达到上限时关闭
//! 客户端，让阻塞在该连接上的读写尽快返回错误。

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::utils::error::SshError;

use super::client::SshClient;

/// 看门狗退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveExit {
    /// 停止信号触发，客户端保持原样
    Cancelled,
    /// 连续失败达到上限，客户端已被关闭
    Exhausted,
}

/// 连续失败计数
#[derive(Debug, Clone, Copy)]
pub struct FailureCounter {
    failures: u32,
    max_errors: u32,
}

impl FailureCounter {
    pub fn new(max_errors: u32) -> Self {
        Self {
            failures: 0,
            max_errors,
        }
    }

    /// 探测成功，计数归零
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// 探测失败，返回是否达到上限
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures >= self.max_errors
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// 运行看门狗直到停止信号触发或连续失败达到上限
///
/// 第一次探测在启动一个间隔之后发出；一个间隔内没有收到回复的探测计为失败。
pub async fn keep_alive<C: SshClient>(
    client: &C,
    interval: Duration,
    max_errors: u32,
    done: CancellationToken,
) -> KeepaliveExit {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter = FailureCounter::new(max_errors);

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => return KeepaliveExit::Cancelled,
            _ = ticker.tick() => {}
        }

        // 一个间隔内没有回复的探测算作失败
        let result = tokio::select! {
            biased;
            _ = done.cancelled() => return KeepaliveExit::Cancelled,
            result = tokio::time::timeout(interval, client.send_keepalive()) => {
                result.unwrap_or_else(|_| Err(SshError::Protocol("keepalive 回复超时".to_string())))
            }
        };

        match result {
            Ok(()) => {
                if counter.failures() > 0 {
                    tracing::debug!("keepalive 恢复");
                }
                counter.record_success();
            }
            Err(e) => {
                let exhausted = counter.record_failure();
                tracing::warn!(
                    failures = counter.failures(),
                    max = max_errors,
                    "keepalive 失败: {}",
                    e
                );
                if exhausted {
                    tracing::error!("keepalive 连续失败 {} 次，关闭连接", counter.failures());
                    if let Err(e) = client.close().await {
                        tracing::debug!("关闭连接失败: {}", e);
                    }
                    return KeepaliveExit::Exhausted;
                }
            }
        }
    }
}

/// 在后台任务中运行看门狗
pub fn spawn_keepalive<C: SshClient>(
    client: Arc<C>,
    interval: Duration,
    max_errors: u32,
    done: CancellationToken,
) -> JoinHandle<KeepaliveExit> {
    tokio::spawn(async move {
        tracing::debug!(
            "keepalive 启动 (interval={:?}, max={})",
            interval,
            max_errors
        );
        let exit = keep_alive(client.as_ref(), interval, max_errors, done).await;
        tracing::debug!("keepalive 停止: {:?}", exit);
        exit
    })
}
