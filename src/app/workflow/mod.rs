pub mod answer_flow;
pub mod result;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::api::llm::LlmService;
use crate::app::answer_log::AnswerLog;
use crate::app::models::ModelRegistry;
use crate::app::question::QuestionType;
use crate::config::AppConfig;

/// 单次答题的上下文，只用于日志
pub struct AnswerCtx {
    /// 进程内递增的请求序号
    pub seq: u64,
    pub question_type: QuestionType,
    pub image_count: usize,
}

impl AnswerCtx {
    /// 生成日志前缀
    pub fn log_prefix(&self) -> String {
        if self.image_count > 0 {
            format!("[答题#{} {} {}图]", self.seq, self.question_type.name(), self.image_count)
        } else {
            format!("[答题#{} {}]", self.seq, self.question_type.name())
        }
    }
}

/// 答题流程依赖的共享服务
pub struct AnswerDeps<'a> {
    pub config: &'a AppConfig,
    pub registry: &'a RwLock<ModelRegistry>,
    pub llm: &'a LlmService,
    pub log: &'a Arc<AnswerLog>,
}
