//! 模型注册表：系统模型 + 用户自定义模型，以及题型到模型列表的路由
//!
//! 持久化为 JSON 文件，写失败时回滚内存中的修改。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::app::question::QuestionType;
use crate::config::{AppConfig, ProviderMode, mask_secret};

pub const SYSTEM_DEEPSEEK_CHAT: &str = "system_deepseek_chat";
pub const SYSTEM_DEEPSEEK_REASONER: &str = "system_deepseek_reasoner";
pub const SYSTEM_DOUBAO: &str = "system_doubao";

/// 图片题的路由键
pub const IMAGE_ROUTE: &str = "image";

/// 路由键：四种题型 + 图片题
pub const ROUTE_KEYS: [&str; 5] = ["single", "multiple", "judgement", "completion", IMAGE_ROUTE];

/// 模型所属厂商，决定计费方式和界面标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Deepseek,
    Doubao,
    /// 兼容 OpenAI 接口的任意服务
    #[default]
    #[serde(alias = "custom")]
    Openai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Doubao => "doubao",
            ProviderKind::Openai => "openai",
        }
    }

    /// 每百万 token 的价格（元）：(输入, 输出)
    pub fn price_per_million(&self) -> (f64, f64) {
        match self {
            ProviderKind::Doubao => (0.8, 2.0),
            // 未知厂商参考 DeepSeek（缓存未命中）价格
            ProviderKind::Deepseek | ProviderKind::Openai => (2.0, 3.0),
        }
    }

    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let (input, output) = self.price_per_million();
        prompt_tokens as f64 / 1_000_000.0 * input + completion_tokens as f64 / 1_000_000.0 * output
    }
}

fn default_true() -> bool {
    true
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_reasoning_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.1
}
fn default_top_p() -> f32 {
    0.95
}
fn default_reasoning_param_name() -> String {
    "reasoning_effort".to_string()
}
fn default_reasoning_param_value() -> String {
    "medium".to_string()
}

/// 一个可调用的模型接入点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    #[serde(default)]
    pub is_multimodal: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_reasoning_max_tokens")]
    pub reasoning_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub supports_reasoning: bool,
    #[serde(default = "default_reasoning_param_name")]
    pub reasoning_param_name: String,
    #[serde(default = "default_reasoning_param_value")]
    pub reasoning_param_value: String,
    /// 思考模式下替换使用的模型名（如 deepseek-reasoner）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl ModelEntry {
    /// 接口返回用的副本，api_key 打码
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.api_key = mask_secret(&copy.api_key);
        copy
    }
}

/// 某个题型的模型列表（按优先级）与思考模式开关
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TypeRoute {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub enable_reasoning: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    models: BTreeMap<String, ModelEntry>,
    #[serde(default)]
    question_type_models: BTreeMap<String, TypeRoute>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    updated_at: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("缺少必需字段: {0}")]
    MissingField(&'static str),
    #[error("模型ID已存在: {0}")]
    Duplicate(String),
    #[error("模型不存在: {0}")]
    NotFound(String),
    #[error("系统模型不可编辑，请在配置文件中修改")]
    SystemReadOnly,
    #[error("系统模型不可删除，如需禁用请在配置文件中删除对应的API密钥")]
    SystemUndeletable,
    #[error("无效的题型: {0}")]
    InvalidRoute(String),
    #[error("无效的模型配置: {0}")]
    Invalid(String),
    #[error("保存配置失败: {0}")]
    Save(String),
}

/// 模型注册表
#[derive(Debug)]
pub struct ModelRegistry {
    path: PathBuf,
    models: BTreeMap<String, ModelEntry>,
    routes: BTreeMap<String, TypeRoute>,
}

fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn default_routes() -> BTreeMap<String, TypeRoute> {
    ROUTE_KEYS
        .iter()
        .map(|k| {
            (
                k.to_string(),
                TypeRoute {
                    models: Vec::new(),
                    enable_reasoning: *k == "multiple",
                },
            )
        })
        .collect()
}

impl ModelRegistry {
    /// 从文件加载；文件不存在时返回空注册表，解析失败时报错
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut registry = Self {
            path,
            models: BTreeMap::new(),
            routes: default_routes(),
        };

        if registry.path.exists() {
            let content = std::fs::read_to_string(&registry.path)
                .with_context(|| format!("读取模型配置失败: {:?}", registry.path))?;
            let file: RegistryFile = serde_json::from_str(&content)
                .with_context(|| format!("解析模型配置失败: {:?}", registry.path))?;
            registry.models = file.models;
            for (key, route) in file.question_type_models {
                registry.routes.insert(key, route);
            }
            info!("已加载 {} 个模型配置", registry.models.len());
        } else {
            info!("未找到模型配置文件 {:?}，使用空配置", registry.path);
        }
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), RegistryError> {
        let file = RegistryFile {
            models: self.models.clone(),
            question_type_models: self.routes.clone(),
            version: "1.0".to_string(),
            updated_at: now_iso(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| RegistryError::Save(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| {
            warn!("保存模型配置失败: {}", e);
            RegistryError::Save(e.to_string())
        })
    }

    /// 从 JSON 请求体新增模型，缺省字段补默认值
    pub fn add_model(&mut self, model_id: &str, config: Value) -> Result<(), RegistryError> {
        for field in ["name", "provider", "api_key", "base_url", "model_name"] {
            if config.get(field).is_none() {
                return Err(RegistryError::MissingField(field));
            }
        }
        if self.models.contains_key(model_id) {
            return Err(RegistryError::Duplicate(model_id.to_string()));
        }

        let mut entry: ModelEntry =
            serde_json::from_value(config).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        entry.is_system = false;
        let now = now_iso();
        entry.created_at = now.clone();
        entry.updated_at = now;

        self.insert_entry(model_id, entry)
    }

    fn insert_entry(&mut self, model_id: &str, entry: ModelEntry) -> Result<(), RegistryError> {
        let name = entry.name.clone();
        let previous = self.models.insert(model_id.to_string(), entry);
        if let Err(e) = self.save() {
            match previous {
                Some(p) => self.models.insert(model_id.to_string(), p),
                None => self.models.remove(model_id),
            };
            return Err(e);
        }
        info!("已保存模型: {} - {}", model_id, name);
        Ok(())
    }

    /// 部分更新；保留创建时间与系统标记
    pub fn update_model(&mut self, model_id: &str, patch: Value) -> Result<(), RegistryError> {
        let existing = self
            .models
            .get(model_id)
            .ok_or_else(|| RegistryError::NotFound(model_id.to_string()))?;
        if existing.is_system {
            return Err(RegistryError::SystemReadOnly);
        }

        let mut merged = serde_json::to_value(existing).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        if let (Some(target), Value::Object(fields)) = (merged.as_object_mut(), patch) {
            for (k, v) in fields {
                if k == "created_at" || k == "is_system" || k == "model_id" {
                    continue;
                }
                target.insert(k, v);
            }
        }
        let mut entry: ModelEntry =
            serde_json::from_value(merged).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        entry.updated_at = now_iso();

        self.insert_entry(model_id, entry)
    }

    /// 删除模型，同时从所有题型路由中移除
    pub fn delete_model(&mut self, model_id: &str) -> Result<(), RegistryError> {
        let existing = self
            .models
            .get(model_id)
            .ok_or_else(|| RegistryError::NotFound(model_id.to_string()))?;
        if existing.is_system {
            return Err(RegistryError::SystemUndeletable);
        }

        let routes_before = self.routes.clone();
        let removed = self.models.remove(model_id);
        for route in self.routes.values_mut() {
            route.models.retain(|id| id != model_id);
        }

        if let Err(e) = self.save() {
            if let Some(entry) = removed {
                self.models.insert(model_id.to_string(), entry);
            }
            self.routes = routes_before;
            return Err(e);
        }
        info!("已删除模型: {}", model_id);
        Ok(())
    }

    pub fn get_model(&self, model_id: &str) -> Option<&ModelEntry> {
        self.models.get(model_id)
    }

    pub fn all_models(&self, enabled_only: bool) -> BTreeMap<String, ModelEntry> {
        self.models
            .iter()
            .filter(|(_, m)| !enabled_only || m.enabled)
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect()
    }

    pub fn routes(&self) -> &BTreeMap<String, TypeRoute> {
        &self.routes
    }

    /// 设置题型的模型列表；enable_reasoning 为 None 时保持原值
    pub fn set_route(
        &mut self,
        route_key: &str,
        model_ids: Vec<String>,
        enable_reasoning: Option<bool>,
    ) -> Result<(), RegistryError> {
        if !ROUTE_KEYS.contains(&route_key) {
            return Err(RegistryError::InvalidRoute(route_key.to_string()));
        }
        if let Some(missing) = model_ids.iter().find(|id| !self.models.contains_key(*id)) {
            return Err(RegistryError::NotFound(missing.clone()));
        }

        let previous = self.routes.get(route_key).cloned().unwrap_or_default();
        let route = TypeRoute {
            models: model_ids,
            enable_reasoning: enable_reasoning.unwrap_or(previous.enable_reasoning),
        };
        self.routes.insert(route_key.to_string(), route);

        if let Err(e) = self.save() {
            self.routes.insert(route_key.to_string(), previous);
            return Err(e);
        }
        info!("已设置 {} 题型的模型列表", route_key);
        Ok(())
    }

    pub fn route_models(&self, route_key: &str) -> &[String] {
        self.routes
            .get(route_key)
            .map(|r| r.models.as_slice())
            .unwrap_or(&[])
    }

    pub fn route_reasoning(&self, q_type: QuestionType) -> bool {
        self.routes
            .get(q_type.as_str())
            .map(|r| r.enable_reasoning)
            .unwrap_or(false)
    }

    /// 把配置文件里的 DeepSeek / 豆包导入为系统模型，并在路由为空时填默认路由
    pub fn import_system_models(&mut self, config: &AppConfig) -> Result<(), RegistryError> {
        let now = now_iso();
        let generation = &config.generation;
        let system = |name: &str, provider: ProviderKind, vendor: &crate::config::VendorConfig, model: &str| ModelEntry {
            name: name.to_string(),
            provider,
            api_key: vendor.api_key.clone(),
            base_url: vendor.base_url.clone(),
            model_name: model.to_string(),
            is_multimodal: false,
            max_tokens: generation.max_tokens,
            reasoning_max_tokens: generation.reasoning_max_tokens,
            temperature: generation.temperature,
            top_p: generation.top_p,
            supports_reasoning: false,
            reasoning_param_name: default_reasoning_param_name(),
            reasoning_param_value: config.reasoning.effort.clone(),
            reasoning_model: None,
            enabled: true,
            is_system: true,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let mut imported = Vec::new();
        if config.deepseek.is_configured() {
            let mut chat = system(
                "DeepSeek Chat (系统配置)",
                ProviderKind::Deepseek,
                &config.deepseek,
                &config.deepseek.model,
            );
            if config.deepseek.model != "deepseek-reasoner" {
                chat.reasoning_model = Some("deepseek-reasoner".to_string());
            }
            imported.push((SYSTEM_DEEPSEEK_CHAT, chat));

            let mut reasoner = system(
                "DeepSeek Reasoner (系统配置)",
                ProviderKind::Deepseek,
                &config.deepseek,
                "deepseek-reasoner",
            );
            reasoner.max_tokens = generation.reasoning_max_tokens;
            imported.push((SYSTEM_DEEPSEEK_REASONER, reasoner));
        }
        if config.doubao.is_configured() {
            let mut doubao = system(
                "豆包 Doubao (系统配置)",
                ProviderKind::Doubao,
                &config.doubao,
                &config.doubao.model,
            );
            doubao.is_multimodal = true;
            doubao.supports_reasoning = true;
            imported.push((SYSTEM_DOUBAO, doubao));
        }

        // 配置里已去掉的系统模型不再保留
        let stale: Vec<String> = self
            .models
            .iter()
            .filter(|(id, m)| m.is_system && !imported.iter().any(|(i, _)| *i == id.as_str()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.models.remove(id);
            for route in self.routes.values_mut() {
                route.models.retain(|m| m != id);
            }
            info!("移除已失效的系统模型: {}", id);
        }

        if imported.is_empty() && stale.is_empty() {
            return Ok(());
        }

        for (id, mut entry) in imported {
            if let Some(existing) = self.models.get(id) {
                entry.created_at = existing.created_at.clone();
                entry.enabled = existing.enabled;
            }
            self.models.insert(id.to_string(), entry);
        }

        let defaults: [(&str, &[&str]); 5] = [
            ("single", &[SYSTEM_DEEPSEEK_CHAT]),
            ("multiple", &[SYSTEM_DEEPSEEK_REASONER, SYSTEM_DEEPSEEK_CHAT]),
            ("judgement", &[SYSTEM_DEEPSEEK_CHAT]),
            ("completion", &[SYSTEM_DEEPSEEK_CHAT]),
            (IMAGE_ROUTE, &[SYSTEM_DOUBAO]),
        ];
        for (key, ids) in defaults {
            let route = self.routes.entry(key.to_string()).or_default();
            if route.models.is_empty() {
                route.models = ids
                    .iter()
                    .filter(|id| self.models.contains_key(**id))
                    .map(|id| id.to_string())
                    .collect();
            }
        }

        self.save()?;
        info!("已同步系统模型与题型映射");
        Ok(())
    }

    /// 配置的默认提供商对应的系统模型
    pub fn default_model_id(&self, config: &AppConfig, has_images: bool) -> Option<String> {
        let id_for = |provider: &str| match provider {
            "deepseek" => Some(SYSTEM_DEEPSEEK_CHAT),
            "doubao" => Some(SYSTEM_DOUBAO),
            _ => None,
        };
        let available = |id: &&str| self.models.get(*id).is_some_and(|m| m.enabled);

        let id = match config.model.provider {
            ProviderMode::Deepseek => Some(SYSTEM_DEEPSEEK_CHAT).filter(available),
            ProviderMode::Doubao => Some(SYSTEM_DOUBAO).filter(available),
            ProviderMode::Auto => {
                let wanted = if has_images {
                    &config.model.image_model
                } else {
                    &config.model.prefer_model
                };
                id_for(wanted.as_str())
                    .filter(available)
                    .or_else(|| {
                        if has_images {
                            warn!("{} 未配置，但题目包含图片，降级使用其他模型", wanted);
                        }
                        [SYSTEM_DEEPSEEK_CHAT, SYSTEM_DOUBAO].into_iter().find(available)
                    })
            }
        };
        id.map(str::to_string)
    }

    /// 题目的候选模型链：图片路由 → 题型路由 → 默认提供商
    pub fn candidates(&self, config: &AppConfig, q_type: QuestionType, has_images: bool) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let usable = |id: &String| {
            self.models
                .get(id)
                .is_some_and(|m| m.enabled && (!has_images || m.is_multimodal))
        };

        if has_images {
            chain.extend(self.route_models(IMAGE_ROUTE).iter().filter(|id| usable(*id)).cloned());
        }
        for id in self.route_models(q_type.as_str()) {
            if usable(id) && !chain.contains(id) {
                chain.push(id.clone());
            }
        }
        if let Some(default_id) = self.default_model_id(config, has_images) {
            if !chain.contains(&default_id) {
                chain.push(default_id);
            }
        }
        chain
    }
}
