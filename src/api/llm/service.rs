//! LLM 服务核心实现
//!
//! 兼容 OpenAI 的 chat/completions 接口，单次调用内负责：
//! 图片下载、请求体构建、有限次重试、图片问题降级为纯文本。

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::api::llm::image;
use crate::app::models::ModelEntry;
use crate::app::prompt::{SYSTEM_PROMPT_IMAGE, SYSTEM_PROMPT_TEXT};
use crate::config::NetworkConfig;

/// 错误信息里保留的响应体长度
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("模型 {0} 未配置API密钥")]
    NotConfigured(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("网络错误: {0}")]
    Network(String),
    #[error("响应解析失败: {0}")]
    InvalidResponse(String),
    #[error("请求被 AI 内容风控拦截")]
    ContentFiltered,
    #[error("模型返回了空答案")]
    EmptyAnswer,
    #[error("{source}（已尝试 {attempts} 次）")]
    RetriesExhausted {
        attempts: usize,
        source: Box<LlmError>,
    },
}

impl LlmError {
    /// 4xx（408/429 除外）和风控拦截重试也没用
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            LlmError::NotConfigured(_) | LlmError::ContentFiltered => false,
            _ => true,
        }
    }

    /// 连接、超时，或错误信息提到图片
    fn is_image_related(&self) -> bool {
        if matches!(self, LlmError::Network(_)) {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        ["image", "base64", "timeout", "connection"]
            .iter()
            .any(|k| msg.contains(k))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 单次答题调用的输入
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub prompt: &'a str,
    pub image_urls: &'a [String],
    pub reasoning: bool,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub answer: String,
    pub reasoning_content: Option<String>,
    pub usage: Usage,
    /// 实际请求的模型名（思考模式可能替换）
    pub model: String,
    /// 实际随请求发送的图片数量
    pub images_sent: usize,
    pub degraded: bool,
    /// 请求里是否真的带上了思考模型或思考参数
    pub reasoning_applied: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

struct Reply {
    answer: String,
    reasoning_content: Option<String>,
    usage: Usage,
}

/// LLM 服务
///
/// 职责：
/// - 按模型配置构建请求并调用 API
/// - 只处理单次调用，不关心候选模型的切换
/// - 不写日志文件、不做答案清洗
pub struct LlmService {
    client: reqwest::Client,
    image_client: reqwest::Client,
    max_retries: usize,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl LlmService {
    pub fn new(network: &NetworkConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(network.timeout_secs));
        if !network.http_proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::http(network.http_proxy.trim()).context("无效的 http_proxy")?);
        }
        if !network.https_proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::https(network.https_proxy.trim()).context("无效的 https_proxy")?);
        }

        Ok(Self {
            client: builder.build().context("创建 HTTP 客户端失败")?,
            image_client: image::build_client()?,
            max_retries: network.max_retries.max(1),
            retry_base_delay: Duration::from_millis(network.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(network.retry_max_delay_ms),
        })
    }

    /// 第 attempt 次失败后的等待：min(base * 2^(attempt-1), max)
    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.retry_max_delay)
    }

    pub async fn chat(&self, entry: &ModelEntry, request: ChatRequest<'_>) -> Result<ChatOutcome, LlmError> {
        if entry.api_key.trim().is_empty() {
            return Err(LlmError::NotConfigured(entry.name.clone()));
        }

        let mut degraded = false;
        let mut images = Vec::new();
        if !request.image_urls.is_empty() {
            if entry.is_multimodal {
                images = image::download_all(&self.image_client, request.image_urls).await;
                if images.is_empty() {
                    warn!("所有图片下载失败，将使用纯文本模式");
                    degraded = true;
                }
            } else {
                warn!("{} 不支持图片输入，已忽略图片", entry.name);
            }
        }

        let (model, _) = effective_model(entry, request.reasoning);
        let url = format!("{}/chat/completions", entry.base_url.trim_end_matches('/'));
        info!(
            "调用模型 {} - {}{}{}",
            entry.name,
            model,
            if request.reasoning { "（思考模式）" } else { "" },
            if images.is_empty() { String::new() } else { format!("，{}张图片(base64)", images.len()) }
        );

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            let body = build_request_body(entry, request.prompt, &images, request.reasoning);

            match self.send(&url, &entry.api_key, &body).await {
                Ok(reply) => {
                    info!("模型返回答案: {}", reply.answer);
                    return Ok(ChatOutcome {
                        answer: reply.answer,
                        reasoning_content: reply.reasoning_content,
                        usage: reply.usage,
                        model: model.to_string(),
                        images_sent: images.len(),
                        degraded,
                        reasoning_applied: reasoning_applied(entry, request.reasoning),
                    });
                }
                Err(e) => {
                    warn!("API调用失败 (尝试 {}/{}): {}", attempt, self.max_retries, e);

                    if attempt == 1 && !images.is_empty() && e.is_image_related() {
                        warn!("检测到可能的图片处理问题（已发送 {} 张图片），改用纯文本重试", images.len());
                        images.clear();
                        degraded = true;
                        last_error = Some(e);
                        continue;
                    }

                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        let wait = self.retry_delay(attempt);
                        debug!("{:?} 后重试", wait);
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => LlmError::RetriesExhausted {
                attempts: self.max_retries,
                source: Box::new(e),
            },
            None => LlmError::EmptyAnswer,
        })
    }

    async fn send(&self, url: &str, api_key: &str, body: &Value) -> Result<Reply, LlmError> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("choices 为空".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::ContentFiltered);
        }

        let answer = choice.message.content.unwrap_or_default().trim().to_string();
        if answer.is_empty() {
            return Err(LlmError::EmptyAnswer);
        }

        let reasoning_content = choice.message.reasoning_content.filter(|r| !r.trim().is_empty());
        if let Some(r) = &reasoning_content {
            debug!("推理过程: {}...", r.chars().take(100).collect::<String>());
        }

        let usage = parsed.usage.unwrap_or_else(|| {
            warn!("响应中没有usage信息，token用量将记录为0");
            Usage::default()
        });

        Ok(Reply {
            answer,
            reasoning_content,
            usage,
        })
    }
}

/// 思考模式下的模型名和 max_tokens
fn effective_model(entry: &ModelEntry, reasoning: bool) -> (&str, u32) {
    if !reasoning {
        return (&entry.model_name, entry.max_tokens);
    }
    let model = reasoning_model(entry).unwrap_or(&entry.model_name);
    (model, entry.reasoning_max_tokens)
}

fn reasoning_model(entry: &ModelEntry) -> Option<&str> {
    entry.reasoning_model.as_deref().filter(|m| !m.trim().is_empty())
}

fn sends_reasoning_param(entry: &ModelEntry) -> bool {
    entry.supports_reasoning && !entry.reasoning_param_name.trim().is_empty()
}

/// 思考模式下请求体是否有变化：换了思考模型或带上思考参数
pub(crate) fn reasoning_applied(entry: &ModelEntry, reasoning: bool) -> bool {
    reasoning && (sends_reasoning_param(entry) || reasoning_model(entry).is_some())
}

/// 思考参数值能解析成 JSON 就按 JSON 发送，否则按字符串
fn reasoning_param_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub(crate) fn build_request_body(entry: &ModelEntry, prompt: &str, images: &[String], reasoning: bool) -> Value {
    let (model, max_tokens) = effective_model(entry, reasoning);

    let messages = if images.is_empty() {
        json!([
            {"role": "system", "content": SYSTEM_PROMPT_TEXT},
            {"role": "user", "content": prompt},
        ])
    } else {
        let mut parts: Vec<Value> = images
            .iter()
            .map(|uri| json!({"type": "image_url", "image_url": {"url": uri}}))
            .collect();
        parts.push(json!({"type": "text", "text": prompt}));
        json!([
            {"role": "system", "content": SYSTEM_PROMPT_IMAGE},
            {"role": "user", "content": parts},
        ])
    };

    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": entry.temperature,
        "max_tokens": max_tokens,
        "top_p": entry.top_p,
        "stream": false,
    });

    if reasoning && sends_reasoning_param(entry) {
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                entry.reasoning_param_name.trim().to_string(),
                reasoning_param_value(&entry.reasoning_param_value),
            );
        }
    }
    body
}
