use std::path::{Path, PathBuf};

use anyhow::Context;
use config::{Config, FileFormat};
use serde::{Deserialize, Serialize};

/// 默认配置文件名（不含扩展名），位于工作目录
const DEFAULT_CONFIG_FILE: &str = "application";

/// deepseek-chat 的 max_tokens 上限
pub const MAX_TOKENS_LIMIT: u32 = 8192;
/// deepseek-reasoner 的 max_tokens 上限
pub const REASONING_MAX_TOKENS_LIMIT: u32 = 65536;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub deepseek: VendorConfig,
    pub doubao: VendorConfig,
    pub reasoning: ReasoningConfig,
    pub generation: GenerationConfig,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            model: ModelConfig::default(),
            deepseek: VendorConfig {
                api_key: String::new(),
                base_url: "https://api.deepseek.com".to_string(),
                model: "deepseek-chat".to_string(),
            },
            doubao: VendorConfig {
                api_key: String::new(),
                base_url: "https://ark.cn-beijing.volces.com/api/v3".to_string(),
                model: "doubao-seed-1-6-251015".to_string(),
            },
            reasoning: ReasoningConfig::default(),
            generation: GenerationConfig::default(),
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 管理界面构建产物目录，不存在时不挂载
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: "web/dist".to_string(),
        }
    }
}

/// 默认模型提供商的选择策略
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Auto,
    Deepseek,
    Doubao,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Auto => "auto",
            ProviderMode::Deepseek => "deepseek",
            ProviderMode::Doubao => "doubao",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ProviderMode,
    /// auto 模式下纯文本题目的首选提供商
    pub prefer_model: String,
    /// auto 模式下图片题目使用的提供商
    pub image_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ProviderMode::Auto,
            prefer_model: "deepseek".to_string(),
            image_model: "doubao".to_string(),
        }
    }
}

/// 单个厂商的接入配置
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct VendorConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl VendorConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReasoningConfig {
    pub enabled: bool,
    pub effort: String,
    pub auto_for_multiple: bool,
    pub auto_for_images: bool,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            effort: "medium".to_string(),
            auto_for_multiple: true,
            auto_for_images: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub reasoning_max_tokens: u32,
    pub top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 500,
            reasoning_max_tokens: 4096,
            top_p: 0.95,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            http_proxy: String::new(),
            https_proxy: String::new(),
            timeout_secs: 1200,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            retry_max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key_file: String,
    pub rate_limit_attempts: usize,
    pub rate_limit_window_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key_file: ".secret_key".to_string(),
            rate_limit_attempts: 5,
            rate_limit_window_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub csv_log_file: String,
    pub models_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            csv_log_file: "ocs_answers_log.csv".to_string(),
            models_file: "custom_models.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file_prefix: "ocs_answerer".to_string(),
        }
    }
}

impl AppConfig {
    /// 从工作目录的 application.yaml 与 APP_ 环境变量加载
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// 从指定文件加载，文件不存在时只使用默认值和环境变量
    ///
    /// 环境变量格式：`APP_<SECTION>__<KEY>`，例如 `APP_DEEPSEEK__API_KEY`
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut config: AppConfig = Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| anyhow::anyhow!("Failed to load config"))?
            .try_deserialize()
            .with_context(|| anyhow::anyhow!("Failed to deserialize config"))?;

        config.normalize();
        Ok(config)
    }

    /// 补齐空字段并把 token 上限收敛到厂商允许的区间
    fn normalize(&mut self) {
        if self.deepseek.base_url.trim().is_empty() {
            self.deepseek.base_url = "https://api.deepseek.com".to_string();
        }
        if self.deepseek.model.trim().is_empty() {
            self.deepseek.model = "deepseek-chat".to_string();
        }
        if self.doubao.base_url.trim().is_empty() {
            self.doubao.base_url = "https://ark.cn-beijing.volces.com/api/v3".to_string();
        }
        if self.doubao.model.trim().is_empty() {
            self.doubao.model = "doubao-seed-1-6-251015".to_string();
        }

        self.generation.max_tokens = self.generation.max_tokens.clamp(1, MAX_TOKENS_LIMIT);
        self.generation.reasoning_max_tokens = self
            .generation
            .reasoning_max_tokens
            .clamp(1, REASONING_MAX_TOKENS_LIMIT);
        self.network.max_retries = self.network.max_retries.max(1);
        self.model.prefer_model = self.model.prefer_model.trim().to_lowercase();
        self.model.image_model = self.model.image_model.trim().to_lowercase();
    }

    /// 启动时的配置问题（不阻止启动，只在健康检查和答题失败时提示）
    pub fn init_error(&self) -> Option<String> {
        match self.model.provider {
            ProviderMode::Auto if !self.deepseek.is_configured() && !self.doubao.is_configured() => {
                Some("智能模式需要至少配置一个模型的API密钥（deepseek.api_key 或 doubao.api_key）".to_string())
            }
            ProviderMode::Deepseek if !self.deepseek.is_configured() => {
                Some("DeepSeek API密钥未配置，请设置 deepseek.api_key".to_string())
            }
            ProviderMode::Doubao if !self.doubao.is_configured() => {
                Some("豆包 API密钥未配置，请设置 doubao.api_key".to_string())
            }
            _ => None,
        }
    }

    pub fn csv_log_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.csv_log_file)
    }

    /// 用于配置面板展示的副本，密钥打码
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.deepseek.api_key = mask_secret(&copy.deepseek.api_key);
        copy.doubao.api_key = mask_secret(&copy.doubao.api_key);
        copy
    }
}

/// 只保留前 4 位和后 4 位
pub fn mask_secret(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return key.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}
