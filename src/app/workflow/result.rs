use serde::Serialize;
use serde_json::{Value, json};

use crate::api::llm::Usage;
use crate::app::question::QuestionType;

/// OCS 脚本识别的标签颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TagColor {
    Blue,
    Green,
    Purple,
    Orange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub text: String,
    pub title: String,
    pub color: TagColor,
}

impl Tag {
    pub fn new(text: impl Into<String>, title: impl Into<String>, color: TagColor) -> Self {
        Self {
            text: text.into(),
            title: title.into(),
            color,
        }
    }
}

/// 一次成功答题的完整结果
#[derive(Debug, Clone)]
pub struct AnswerOutcome {
    pub question: String,
    pub answer: String,
    pub matched: bool,
    pub question_type: QuestionType,
    pub raw_answer: String,
    pub reasoning_content: Option<String>,
    pub model: String,
    pub model_id: String,
    /// 接口返回的 provider 字段，如 `auto(deepseek)`、`custom(my_model)`
    pub provider: String,
    pub reasoning_used: bool,
    pub ai_time: f64,
    pub total_time: f64,
    pub usage: Usage,
    pub tags: Vec<Tag>,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl AnswerOutcome {
    /// /api/answer 的响应体，ocs_format 为 OCS 脚本直接使用的 [题目, 答案, 附加信息]
    pub fn to_response(&self) -> Value {
        let extra = json!({
            "ai": true,
            "tags": self.tags,
            "model": self.model,
            "provider": self.provider,
            "reasoning_used": self.reasoning_used,
            "ai_time": round2(self.ai_time),
            "total_time": round2(self.total_time),
            "usage": self.usage,
        });

        json!({
            "success": true,
            "question": self.question,
            "answer": self.answer,
            "matched": self.matched,
            "type": self.question_type.as_str(),
            "raw_answer": self.raw_answer,
            "reasoning_content": self.reasoning_content,
            "model": self.model,
            "model_id": self.model_id,
            "provider": self.provider,
            "reasoning_used": self.reasoning_used,
            "ai_time": round2(self.ai_time),
            "total_time": round2(self.total_time),
            "usage": self.usage,
            "ocs_format": [self.question, self.answer, extra],
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("AI答题失败: {0}")]
    NoModel(String),
    #[error("AI答题失败: {0}")]
    AllFailed(String),
}
