use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::api::llm::LlmService;
use crate::app::answer_log::AnswerLog;
use crate::app::models::ModelRegistry;
use crate::app::security::SecurityManager;
use crate::app::workflow::AnswerDeps;
use crate::config::AppConfig;

/// 所有请求共享的服务
pub struct AppState {
    pub config: AppConfig,
    pub registry: RwLock<ModelRegistry>,
    pub llm: LlmService,
    pub answer_log: Arc<AnswerLog>,
    pub security: SecurityManager,
    answer_seq: AtomicU64,
}

impl AppState {
    pub fn new(config: AppConfig) -> anyhow::Result<Arc<Self>> {
        if let Some(msg) = config.init_error() {
            warn!("模型配置不完整: {}", msg);
        }

        let security = SecurityManager::init(&config.security)?;

        let mut registry = ModelRegistry::load(&config.storage.models_file)?;
        registry
            .import_system_models(&config)
            .context("导入系统模型失败")?;
        info!("已加载 {} 个模型: {:?}", registry.all_models(false).len(), registry.path());

        let llm = LlmService::new(&config.network)?;
        let answer_log = Arc::new(AnswerLog::new(config.csv_log_path()));

        Ok(Arc::new(Self {
            config,
            registry: RwLock::new(registry),
            llm,
            answer_log,
            security,
            answer_seq: AtomicU64::new(0),
        }))
    }

    pub fn next_answer_seq(&self) -> u64 {
        self.answer_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn answer_deps(&self) -> AnswerDeps<'_> {
        AnswerDeps {
            config: &self.config,
            registry: &self.registry,
            llm: &self.llm,
            log: &self.answer_log,
        }
    }
}
