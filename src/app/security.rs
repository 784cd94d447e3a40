//! 访问密钥与失败限流
//!
//! 密钥文件只保存 SHA-256 哈希；首次启动生成的明文密钥额外保存一份并打印一次。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::config::SecurityConfig;

pub const MIN_KEY_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    key_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
    /// 仅首次生成时保存
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_key: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum KeyUpdateError {
    #[error("旧密钥错误")]
    WrongOldKey,
    #[error("新密钥长度至少8字符")]
    TooShort,
    #[error("更新失败: {0}")]
    Save(String),
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub struct SecurityManager {
    key_file: PathBuf,
    key_hash: RwLock<String>,
    failed_attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
}

impl SecurityManager {
    /// 加载密钥文件；不存在或无法解析时生成新密钥
    pub fn init(config: &SecurityConfig) -> Result<Self> {
        let key_file = PathBuf::from(&config.secret_key_file);
        let key_hash = match Self::load_hash(&key_file) {
            Ok(Some(hash)) => {
                info!("已加载现有访问密钥");
                hash
            }
            Ok(None) => Self::generate_key(&key_file)?,
            Err(e) => {
                error!("加载密钥失败: {:#}，将生成新密钥", e);
                Self::generate_key(&key_file)?
            }
        };

        Ok(Self {
            key_file,
            key_hash: RwLock::new(key_hash),
            failed_attempts: Mutex::new(HashMap::new()),
            max_attempts: config.rate_limit_attempts.max(1),
            window: Duration::from_secs(config.rate_limit_window_secs),
        })
    }

    fn load_hash(path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("读取密钥文件失败: {:?}", path))?;
        let file: KeyFile = serde_json::from_str(&content).context("密钥文件格式错误")?;
        Ok(Some(file.key_hash))
    }

    /// 生成 64 位十六进制随机密钥
    fn generate_key(path: &Path) -> Result<String> {
        let bytes: [u8; 32] = rand::random();
        let raw_key = hex::encode(bytes);
        let key_hash = hash_key(&raw_key);

        let file = KeyFile {
            key_hash: key_hash.clone(),
            created_at: Some(now_iso()),
            updated_at: None,
            raw_key: Some(raw_key.clone()),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("保存密钥文件失败: {:?}", path))?;

        info!("首次启动：已生成访问密钥");
        info!("   访问密钥: {}", raw_key);
        info!("   密钥已保存到: {:?}，请妥善保管", path);
        Ok(key_hash)
    }

    pub fn verify_key(&self, provided: &str) -> bool {
        if provided.is_empty() {
            return false;
        }
        let expected = self.key_hash.read().unwrap_or_else(|p| p.into_inner());
        hash_key(provided) == *expected
    }

    pub fn update_key(&self, old_key: &str, new_key: &str) -> Result<(), KeyUpdateError> {
        if !self.verify_key(old_key) {
            return Err(KeyUpdateError::WrongOldKey);
        }
        if new_key.chars().count() < MIN_KEY_LEN {
            return Err(KeyUpdateError::TooShort);
        }

        let new_hash = hash_key(new_key);
        let file = KeyFile {
            key_hash: new_hash.clone(),
            created_at: None,
            updated_at: Some(now_iso()),
            raw_key: None,
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| KeyUpdateError::Save(e.to_string()))?;
        std::fs::write(&self.key_file, json).map_err(|e| {
            error!("更新密钥失败: {}", e);
            KeyUpdateError::Save(e.to_string())
        })?;

        *self.key_hash.write().unwrap_or_else(|p| p.into_inner()) = new_hash;
        info!("访问密钥已更新");
        Ok(())
    }

    /// 被限流时返回剩余等待秒数
    pub fn check_rate_limit(&self, ip: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut attempts = self.failed_attempts.lock().unwrap_or_else(|p| p.into_inner());
        let Some(list) = attempts.get_mut(ip) else {
            return Ok(());
        };
        list.retain(|ts| now.duration_since(*ts) < self.window);

        if list.len() >= self.max_attempts {
            let elapsed = now.duration_since(list[0]);
            return Err(self.window.saturating_sub(elapsed).as_secs());
        }
        if list.is_empty() {
            attempts.remove(ip);
        }
        Ok(())
    }

    /// 记录一次失败，顺带清掉所有已过窗口的 IP
    pub fn record_failure(&self, ip: &str) {
        let now = Instant::now();
        let mut attempts = self.failed_attempts.lock().unwrap_or_else(|p| p.into_inner());
        attempts.retain(|_, list| {
            list.retain(|ts| now.duration_since(*ts) < self.window);
            !list.is_empty()
        });
        attempts.entry(ip.to_string()).or_default().push(now);
    }

    pub fn clear_failures(&self, ip: &str) {
        self.failed_attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(ip);
    }
}
