//! 题目模型：题型枚举、OCS 请求体解析与图片地址提取

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 题型枚举，数值为 OCS 脚本传入的 type 代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// 单选题
    Single = 0,
    /// 多选题
    Multiple = 1,
    /// 填空题
    Completion = 3,
    /// 判断题
    Judgement = 4,
}

impl QuestionType {
    pub const ALL: [QuestionType; 4] = [
        QuestionType::Single,
        QuestionType::Multiple,
        QuestionType::Completion,
        QuestionType::Judgement,
    ];

    /// OCS 题型代码
    pub fn code(self) -> i64 {
        self as i64
    }

    /// 英文标识，用于路由配置和接口返回
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::Single => "single",
            QuestionType::Multiple => "multiple",
            QuestionType::Completion => "completion",
            QuestionType::Judgement => "judgement",
        }
    }

    /// 中文名称，写入 CSV 日志
    pub fn name(self) -> &'static str {
        match self {
            QuestionType::Single => "单选题",
            QuestionType::Multiple => "多选题",
            QuestionType::Completion => "填空题",
            QuestionType::Judgement => "判断题",
        }
    }

    /// 从 OCS 代码解析
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// 从英文标识或中文名称解析（精确匹配）
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "single" | "单选题" | "单选" => Some(QuestionType::Single),
            "multiple" | "多选题" | "多选" => Some(QuestionType::Multiple),
            "completion" | "填空题" | "填空" => Some(QuestionType::Completion),
            "judgement" | "判断题" | "判断" => Some(QuestionType::Judgement),
            _ => None,
        }
    }

    /// 解析 OCS 请求里的 type 字段，数字或字符串均可，无法识别时按单选题处理
    pub fn from_wire(value: Option<&Value>) -> Self {
        let parsed = match value {
            Some(Value::Number(n)) => n.as_i64().and_then(Self::from_code),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(Self::from_code)
                .or_else(|| Self::parse(s)),
            _ => None,
        };
        parsed.unwrap_or(QuestionType::Single)
    }
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// OCS 选项字段：数组，或按换行分隔的字符串
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OptionsField {
    List(Vec<Value>),
    Text(String),
}

impl Default for OptionsField {
    fn default() -> Self {
        OptionsField::List(Vec::new())
    }
}

impl OptionsField {
    pub fn into_options(self) -> Vec<String> {
        match self {
            OptionsField::Text(text) => text
                .split('\n')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            OptionsField::List(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Null => None,
                    Value::String(s) => Some(s),
                    other => Some(other.to_string()),
                })
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// /api/answer 的原始请求体
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnswerPayload {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Option<OptionsField>,
    #[serde(default, rename = "type")]
    pub question_type: Option<Value>,
    #[serde(default)]
    pub images: Option<Vec<Value>>,
}

/// 归一化后的答题请求
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRequest {
    pub question: String,
    pub options: Vec<String>,
    pub question_type: QuestionType,
    pub image_urls: Vec<String>,
}

impl AnswerRequest {
    /// 解析请求体；题目为空时返回 None
    pub fn from_payload(payload: AnswerPayload) -> Option<Self> {
        let question = payload.question.trim().to_string();
        if question.is_empty() {
            return None;
        }

        let question_type = QuestionType::from_wire(payload.question_type.as_ref());
        let options = payload.options.unwrap_or_default().into_options();

        let explicit: Vec<String> = payload
            .images
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s),
                _ => None,
            })
            .collect();
        let image_urls = collect_image_urls(&question, &options, &explicit);

        Some(Self {
            question,
            options,
            question_type,
            image_urls,
        })
    }

    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }
}

static IMG_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(https?://[a-zA-Z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+?\.(?:jpg|jpeg|png|gif|bmp|webp))"#)
        .expect("image url regex")
});

static IMG_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(jpg|jpeg|png|gif|bmp|webp)").expect("image ext regex"));

/// 题目里常见的图标，不属于题目内容
const ICON_KEYWORDS: [&str; 8] = [
    "/icon/",
    "/icons/",
    "/icon.",
    "icon/",
    "video.png",
    "audio.png",
    "play.png",
    "pause.png",
];

/// 去掉图片扩展名之后附带的多余字符
pub fn clean_url(url: &str) -> String {
    let url = url.trim();
    match IMG_EXT_RE.find(url) {
        Some(m) => url[..m.end()].to_string(),
        None => url.to_string(),
    }
}

pub fn extract_image_urls(text: &str) -> Vec<String> {
    IMG_URL_RE
        .find_iter(text)
        .map(|m| clean_url(m.as_str()))
        .collect()
}

fn is_icon(url: &str) -> bool {
    let lower = url.to_lowercase();
    ICON_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// 合并接口传入、题干、选项中的图片地址：去重、保序、过滤图标
pub fn collect_image_urls(question: &str, options: &[String], explicit: &[String]) -> Vec<String> {
    let mut all: Vec<String> = explicit.iter().map(|u| clean_url(u)).collect();
    all.extend(extract_image_urls(question));
    if !options.is_empty() {
        all.extend(extract_image_urls(&options.join(" ")));
    }

    let mut seen = std::collections::HashSet::new();
    all.into_iter()
        .filter(|u| seen.insert(u.clone()))
        .filter(|u| {
            let icon = is_icon(u);
            if icon {
                tracing::debug!("跳过图标URL: {}", u);
            }
            !icon
        })
        .collect()
}
