//! SSH 认证
//!
//! 支持密码和私钥认证方式。

use std::path::Path;
use std::sync::Arc;

use russh::client::Handle;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};

use crate::utils::error::SshError;

use super::client::ClientHandler;

/// 认证方式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// 无显式认证：先尝试默认私钥，再尝试 none 认证
    #[default]
    None,
    /// 密码认证
    Password { password: String },
    /// 私钥认证
    PrivateKey {
        /// 私钥文件路径
        path: String,
        /// 私钥密码（可选）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// 加载私钥文件
///
/// 支持 OpenSSH 格式和 PEM 格式的私钥。
///
/// # 参数
/// - `path`: 私钥文件路径
/// - `passphrase`: 私钥密码（如果私钥已加密）
pub fn load_private_key(path: &str, passphrase: Option<&str>) -> Result<PrivateKey, SshError> {
    let path = expand_tilde(path);
    let key_path = Path::new(&path);

    if !key_path.exists() {
        return Err(SshError::PrivateKeyLoad(format!("{}: 文件不存在", path)));
    }

    // 检查文件权限（仅 Unix）
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(key_path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    "私钥文件 {} 权限过于宽松 (mode: {:o})，建议设置为 600",
                    path,
                    mode & 0o777
                );
            }
        }
    }

    let key_data = std::fs::read_to_string(key_path)
        .map_err(|e| SshError::PrivateKeyLoad(format!("{}: 无法读取文件: {}", path, e)))?;

    let key = russh::keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
        let err_str = e.to_string().to_lowercase();
        if passphrase.is_none() && (err_str.contains("passphrase") || err_str.contains("encrypted"))
        {
            SshError::PrivateKeyLoad(format!("{}: 私钥已加密，需要提供密码", path))
        } else {
            SshError::PrivateKeyLoad(format!("{}: 解析失败: {}", path, e))
        }
    })?;

    tracing::debug!("成功加载私钥: {}", path);
    Ok(key)
}

/// 展开路径中的 ~ 为用户主目录
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// 获取默认 SSH 私钥路径列表
///
/// 返回常见的 SSH 私钥文件路径，按优先级排序。
pub fn default_identity_files() -> Vec<String> {
    let mut paths = Vec::new();

    if let Some(home) = dirs::home_dir() {
        let ssh_dir = home.join(".ssh");

        for name in ["id_ed25519", "id_ecdsa", "id_rsa", "identity"] {
            let key_path = ssh_dir.join(name);
            if key_path.exists() {
                paths.push(key_path.to_string_lossy().to_string());
            }
        }
    }

    paths
}

/// 尝试加载第一个可用的默认私钥
pub fn try_load_default_key() -> Option<(String, PrivateKey)> {
    for path in default_identity_files() {
        match load_private_key(&path, None) {
            Ok(key) => {
                tracing::info!("使用默认私钥: {}", path);
                return Some((path, key));
            }
            Err(e) => {
                tracing::debug!("无法加载私钥 {}: {}", path, e);
            }
        }
    }
    None
}

/// 在已完成握手的连接上执行认证
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    method: &AuthMethod,
) -> Result<(), SshError> {
    match method {
        AuthMethod::Password { password } => {
            tracing::debug!("使用密码认证");
            let result = handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| SshError::Authentication(format!("密码认证请求失败: {}", e)))?;
            if !result.success() {
                return Err(SshError::Authentication("密码被服务器拒绝".to_string()));
            }
        }
        AuthMethod::PrivateKey { path, passphrase } => {
            tracing::debug!("使用私钥认证: {}", path);
            let key = load_private_key(path, passphrase.as_deref())?;
            authenticate_key(handle, user, path, key).await?;
        }
        AuthMethod::None => {
            if let Some((path, key)) = try_load_default_key() {
                if authenticate_key(handle, user, &path, key).await.is_ok() {
                    return Ok(());
                }
            }

            tracing::debug!("尝试无认证连接");
            let result = handle
                .authenticate_none(user)
                .await
                .map_err(|e| SshError::Authentication(format!("none 认证请求失败: {}", e)))?;
            if !result.success() {
                return Err(SshError::Authentication(
                    "服务器要求认证，请提供密码或私钥".to_string(),
                ));
            }
        }
    }

    tracing::debug!("SSH 认证成功: {}", user);
    Ok(())
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    path: &str,
    key: PrivateKey,
) -> Result<(), SshError> {
    let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let result = handle
        .authenticate_publickey(user, key)
        .await
        .map_err(|e| SshError::Authentication(format!("私钥认证请求失败 ({}): {}", path, e)))?;
    if !result.success() {
        return Err(SshError::Authentication(format!(
            "私钥被服务器拒绝 ({})",
            path
        )));
    }
    Ok(())
}
