//! SSH 拨号配置
//!
//! 描述目标端口、握手参数和 keepalive 参数。拨号开始后配置不再改变，
//! 拨号器持有自己的副本。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::error::SshError;

use super::auth::AuthMethod;

/// 握手与认证参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 用户名
    pub user: String,
    /// 认证方式
    pub auth: AuthMethod,
    /// 拨号超时（包括 TCP 连接和握手），为 0 时只受上下文限制
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// 连接空闲超时，`None` 表示不限制
    #[serde(with = "option_duration_secs")]
    pub inactivity_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: whoami::username(),
            auth: AuthMethod::None,
            connect_timeout: Duration::from_secs(30),
            inactivity_timeout: None,
        }
    }
}

impl ClientConfig {
    /// 转换为 russh 客户端配置
    ///
    /// 活性检测由 keepalive 看门狗负责，这里不启用 russh 内置的 keepalive。
    pub fn to_russh_config(&self) -> Arc<russh::client::Config> {
        Arc::new(russh::client::Config {
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        })
    }
}

/// SSH 拨号配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SSH 端口（默认 22）
    pub port: u16,
    /// 握手与认证参数
    pub client: ClientConfig,
    /// keepalive 探测间隔
    #[serde(with = "duration_secs")]
    pub server_alive_interval: Duration,
    /// 连续失败多少次后强制关闭连接
    pub server_alive_count_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 22,
            client: ClientConfig::default(),
            server_alive_interval: Duration::from_secs(15),
            server_alive_count_max: 3,
        }
    }
}

impl Config {
    /// 使用密码认证
    pub fn with_password_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.client.user = user.into();
        self.client.auth = AuthMethod::Password {
            password: password.into(),
        };
        self
    }

    /// 使用私钥文件认证
    pub fn with_identity_file_auth(mut self, user: impl Into<String>, path: impl Into<String>) -> Self {
        self.client.user = user.into();
        self.client.auth = AuthMethod::PrivateKey {
            path: path.into(),
            passphrase: None,
        };
        self
    }

    /// keepalive 是否启用
    pub fn keepalive_enabled(&self) -> bool {
        !self.server_alive_interval.is_zero() && self.server_alive_count_max > 0
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), SshError> {
        if self.port == 0 {
            return Err(SshError::Config("端口不能为 0".to_string()));
        }
        if self.client.user.is_empty() {
            return Err(SshError::Config("用户名不能为空".to_string()));
        }
        if let AuthMethod::PrivateKey { path, .. } = &self.client.auth {
            if path.is_empty() {
                return Err(SshError::Config("私钥路径不能为空".to_string()));
            }
        }
        Ok(())
    }

    /// 从 JSON 文件加载配置，缺省字段使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SshError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            SshError::Config(format!("无法读取配置文件 {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&data)?;
        tracing::debug!("加载配置文件: {}", path.display());
        Ok(config)
    }

    /// 应用环境变量覆盖
    ///
    /// 支持 `SSH_TUNNEL_PORT`、`SSH_TUNNEL_USER`、`SSH_TUNNEL_PASSWORD`、
    /// `SSH_TUNNEL_IDENTITY_FILE`。
    pub fn with_env_overrides(mut self) -> Result<Self, SshError> {
        if let Ok(port) = std::env::var("SSH_TUNNEL_PORT") {
            self.port = port
                .parse()
                .map_err(|_| SshError::Config(format!("无效的端口: {}", port)))?;
        }
        if let Ok(user) = std::env::var("SSH_TUNNEL_USER") {
            self.client.user = user;
        }
        if let Ok(path) = std::env::var("SSH_TUNNEL_IDENTITY_FILE") {
            self.client.auth = AuthMethod::PrivateKey {
                path,
                passphrase: None,
            };
        } else if let Ok(password) = std::env::var("SSH_TUNNEL_PASSWORD") {
            self.client.auth = AuthMethod::Password { password };
        }
        Ok(self)
    }
}

/// 以秒（可带小数）表示的时长
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod option_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
