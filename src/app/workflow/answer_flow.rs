//! 单题答题流程
//!
//! 完整流程：思考模式判定 → 候选模型依次调用 → 答案清洗 → 写 CSV → 组装 OCS 响应

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::api::llm::{ChatOutcome, ChatRequest};
use crate::app::answer::process_answer;
use crate::app::answer_log::AnswerRecord;
use crate::app::logger::FAILED_ANSWERS_TARGET;
use crate::app::models::ModelEntry;
use crate::app::prompt::build_prompt;
use crate::app::question::{AnswerRequest, QuestionType};
use crate::app::workflow::result::{AnswerError, AnswerOutcome, Tag, TagColor};
use crate::app::workflow::{AnswerCtx, AnswerDeps};
use crate::config::{AppConfig, ProviderMode};

/// 是否启用思考模式，以及自动启用的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningDecision {
    pub enabled: bool,
    pub reasons: Vec<&'static str>,
}

impl ReasoningDecision {
    pub fn decide(config: &AppConfig, q_type: QuestionType, has_images: bool, route_reasoning: bool) -> Self {
        let mut reasons = Vec::new();
        if route_reasoning {
            reasons.push("题型设置");
        }
        if q_type == QuestionType::Multiple && config.reasoning.auto_for_multiple {
            reasons.push("多选题");
        }
        if has_images && config.reasoning.auto_for_images {
            reasons.push("图片题");
        }
        Self {
            enabled: config.reasoning.enabled || !reasons.is_empty(),
            reasons,
        }
    }

    pub fn automatic(&self) -> bool {
        !self.reasons.is_empty()
    }
}

/// `reasoning_applied` 为请求实际是否带上思考模式，模型不支持时即使判定开启也不打标签
fn build_tags(
    reasoning: &ReasoningDecision,
    reasoning_applied: bool,
    entry: &ModelEntry,
    model: &str,
    auto_mode: bool,
) -> Vec<Tag> {
    let mut tags = Vec::new();
    if reasoning_applied {
        tags.push(Tag::new("深度思考", "使用深度思考模式生成，答案更准确", TagColor::Purple));
        if reasoning.automatic() {
            tags.push(Tag::new(
                "自动思考",
                format!("{}自动启用深度思考", reasoning.reasons.join(" + ")),
                TagColor::Orange,
            ));
        }
    }

    let provider = entry.provider.as_str().to_uppercase();
    if !entry.is_system {
        tags.push(Tag::new("自定义模型", format!("使用自定义模型: {}", entry.name), TagColor::Green));
    } else if auto_mode {
        tags.push(Tag::new("智能选择", "根据题目内容自动选择最合适的模型", TagColor::Blue));
        tags.push(Tag::new(provider, format!("实际使用: {}", model), TagColor::Green));
    } else {
        tags.push(Tag::new(provider, format!("模型: {}", model), TagColor::Green));
    }
    tags
}

fn provider_label(model_id: &str, entry: &ModelEntry, auto_mode: bool) -> String {
    if !entry.is_system {
        format!("custom({})", model_id)
    } else if auto_mode {
        format!("auto({})", entry.provider.as_str())
    } else {
        entry.provider.as_str().to_string()
    }
}

/// 单题处理主流程：候选模型依次尝试，全部失败时写入失败清单
pub async fn answer_question(
    request: AnswerRequest,
    ctx: &AnswerCtx,
    deps: &AnswerDeps<'_>,
) -> Result<AnswerOutcome, AnswerError> {
    let prefix = ctx.log_prefix();
    let start = Instant::now();
    let q_type = request.question_type;
    info!("{} ========== 收到答题请求 ==========", prefix);
    info!("{} 题目: {}", prefix, request.question);
    if request.has_images() {
        info!("{} 检测到 {} 张图片", prefix, request.image_urls.len());
    }

    // === 1. 候选模型与思考模式 ===
    let (candidates, route_reasoning) = {
        let registry = deps.registry.read().await;
        let entries: Vec<(String, ModelEntry)> = registry
            .candidates(deps.config, q_type, request.has_images())
            .into_iter()
            .filter_map(|id| registry.get_model(&id).cloned().map(|entry| (id, entry)))
            .collect();
        (entries, registry.route_reasoning(q_type))
    };

    let reasoning = ReasoningDecision::decide(deps.config, q_type, request.has_images(), route_reasoning);
    if reasoning.automatic() {
        info!("{} {}自动启用深度思考模式", prefix, reasoning.reasons.join(" + "));
    }

    if candidates.is_empty() {
        let msg = deps
            .config
            .init_error()
            .unwrap_or_else(|| "没有可用的模型，请检查模型配置".to_string());
        log_failed_answer(&prefix, &request, &msg);
        return Err(AnswerError::NoModel(msg));
    }

    // === 2. 依次调用候选模型 ===
    let prompt = build_prompt(&request.question, &request.options, q_type);
    let ai_start = Instant::now();
    let mut last_error = None;
    let mut answered: Option<(String, ModelEntry, ChatOutcome)> = None;

    for (model_id, entry) in candidates {
        info!("{} 使用模型: {} ({})", prefix, model_id, entry.name);
        let chat_request = ChatRequest {
            prompt: &prompt,
            image_urls: &request.image_urls,
            reasoning: reasoning.enabled,
        };
        match deps.llm.chat(&entry, chat_request).await {
            Ok(outcome) => {
                answered = Some((model_id, entry, outcome));
                break;
            }
            Err(e) => {
                warn!("{} 模型 {} 调用失败，尝试下一个模型: {}", prefix, model_id, e);
                last_error = Some(e);
            }
        }
    }
    let ai_time = ai_start.elapsed().as_secs_f64();

    let Some((model_id, entry, chat)) = answered else {
        let msg = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "AI未返回答案".to_string());
        log_failed_answer(&prefix, &request, &msg);
        return Err(AnswerError::AllFailed(msg));
    };

    // === 3. 清洗答案 ===
    let processed = process_answer(&chat.answer, q_type, &request.options);
    let total_time = start.elapsed().as_secs_f64();
    if reasoning.enabled && !chat.reasoning_applied {
        info!("{} 模型 {} 不支持思考模式，按普通模式作答", prefix, model_id);
    }
    if chat.degraded {
        warn!("{} 图片处理失败，已降级为纯文本答题", prefix);
    } else if chat.images_sent > 0 {
        info!("{} 已随请求发送 {} 张图片", prefix, chat.images_sent);
    }
    info!("{} AI原始回答: {}", prefix, chat.answer);
    info!("{} 处理后答案: {}", prefix, processed.text);
    info!("{} 模型答题用时: {:.2}秒，总用时: {:.2}秒", prefix, ai_time, total_time);
    if !processed.matched {
        warn!("{} 答案未能匹配到任何选项", prefix);
    }

    // === 4. 写入 CSV（失败不影响答题结果） ===
    let record = AnswerRecord {
        timestamp: AnswerRecord::now_timestamp(),
        question_type: q_type.name().to_string(),
        question: request.question.clone(),
        options: AnswerRecord::join_options(&request.options),
        raw_answer: chat.answer.clone(),
        reasoning_content: chat.reasoning_content.clone().unwrap_or_default(),
        answer: processed.text.clone(),
        ai_time,
        total_time,
        model: chat.model.clone(),
        reasoning_used: chat.reasoning_applied,
        prompt_tokens: chat.usage.prompt_tokens,
        completion_tokens: chat.usage.completion_tokens,
        total_tokens: chat.usage.prompt_tokens + chat.usage.completion_tokens,
        cost: entry.provider.cost(chat.usage.prompt_tokens, chat.usage.completion_tokens),
        provider: entry.provider.as_str().to_uppercase(),
        model_id: model_id.clone(),
    };
    let log = Arc::clone(deps.log);
    match tokio::task::spawn_blocking(move || log.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} 保存CSV失败: {:#}", prefix, e),
        Err(e) => warn!("{} 保存CSV任务异常: {}", prefix, e),
    }

    // === 5. 组装响应 ===
    let auto_mode = deps.config.model.provider == ProviderMode::Auto;
    let mut usage = chat.usage;
    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;

    Ok(AnswerOutcome {
        tags: build_tags(&reasoning, chat.reasoning_applied, &entry, &chat.model, auto_mode),
        provider: provider_label(&model_id, &entry, auto_mode),
        question: request.question,
        answer: processed.text,
        matched: processed.matched,
        question_type: q_type,
        raw_answer: chat.answer,
        reasoning_content: chat.reasoning_content,
        model: chat.model,
        model_id,
        reasoning_used: chat.reasoning_applied,
        ai_time,
        total_time,
        usage,
    })
}

fn log_failed_answer(prefix: &str, request: &AnswerRequest, reason: &str) {
    error!(
        target: FAILED_ANSWERS_TARGET,
        "{} 所有模型均未给出答案 | type={} | question={} | options={} | images={} | reason={}",
        prefix,
        request.question_type.name(),
        request.question,
        request.options.join(" | "),
        request.image_urls.join(","),
        reason
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::llm::LlmService;
    use crate::app::answer_log::AnswerLog;
    use crate::app::logger;
    use crate::app::models::ModelRegistry;
    use crate::config::NetworkConfig;
    use serde_json::json;
    use tokio::sync::RwLock;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn custom_model(base_url: &str) -> serde_json::Value {
        json!({
            "name": "备用模型",
            "provider": "openai",
            "api_key": "sk-test-123456",
            "base_url": base_url,
            "model_name": "gpt-test",
        })
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"content": content}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 10, "total_tokens": 1010}
        })
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AppConfig,
        registry: RwLock<ModelRegistry>,
        llm: LlmService,
        log: Arc<AnswerLog>,
    }

    impl Fixture {
        fn new(routes: &[(&str, serde_json::Value)], single_route: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = AppConfig::default();
            config.network = NetworkConfig {
                max_retries: 1,
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 1,
                timeout_secs: 10,
                ..Default::default()
            };

            let mut registry = ModelRegistry::load(dir.path().join("models.json")).unwrap();
            for (id, model) in routes {
                registry.add_model(id, model.clone()).unwrap();
            }
            registry
                .set_route("single", single_route.iter().map(|s| s.to_string()).collect(), None)
                .unwrap();

            Self {
                llm: LlmService::new(&config.network).unwrap(),
                log: Arc::new(AnswerLog::new(dir.path().join("log.csv"))),
                registry: RwLock::new(registry),
                config,
                _dir: dir,
            }
        }

        fn deps(&self) -> AnswerDeps<'_> {
            AnswerDeps {
                config: &self.config,
                registry: &self.registry,
                llm: &self.llm,
                log: &self.log,
            }
        }
    }

    fn single_choice() -> AnswerRequest {
        AnswerRequest {
            question: "中国的首都是？".to_string(),
            options: vec!["北京".to_string(), "上海".to_string()],
            question_type: QuestionType::Single,
            image_urls: vec![],
        }
    }

    fn ctx() -> AnswerCtx {
        AnswerCtx {
            seq: 1,
            question_type: QuestionType::Single,
            image_count: 0,
        }
    }

    #[test]
    fn test_reasoning_decision() {
        let config = AppConfig::default();
        let d = ReasoningDecision::decide(&config, QuestionType::Single, false, false);
        assert!(!d.enabled);

        let d = ReasoningDecision::decide(&config, QuestionType::Multiple, true, false);
        assert!(d.enabled);
        assert_eq!(d.reasons, vec!["多选题", "图片题"]);

        let d = ReasoningDecision::decide(&config, QuestionType::Judgement, false, true);
        assert_eq!(d.reasons, vec!["题型设置"]);

        let mut config = AppConfig::default();
        config.reasoning.enabled = true;
        config.reasoning.auto_for_multiple = false;
        let d = ReasoningDecision::decide(&config, QuestionType::Multiple, false, false);
        assert!(d.enabled);
        assert!(!d.automatic());
    }

    #[tokio::test]
    async fn test_answer_with_failover_and_csv() {
        logger::init_test();
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .expect(1)
            .mount(&bad)
            .await;
        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("答案：B. 上海")))
            .expect(1)
            .mount(&good)
            .await;

        let fixture = Fixture::new(
            &[("first", custom_model(&bad.uri())), ("second", custom_model(&good.uri()))],
            &["first", "second"],
        );

        let outcome = answer_question(single_choice(), &ctx(), &fixture.deps())
            .await
            .unwrap();
        assert_eq!(outcome.answer, "上海");
        assert!(outcome.matched);
        assert_eq!(outcome.model_id, "second");
        assert_eq!(outcome.provider, "custom(second)");
        assert_eq!(outcome.usage.total_tokens, 1010);
        assert!(!outcome.reasoning_used);
        assert_eq!(outcome.tags[0].text, "自定义模型");

        let response = outcome.to_response();
        assert_eq!(response["ocs_format"][0], json!("中国的首都是？"));
        assert_eq!(response["ocs_format"][1], json!("上海"));
        assert_eq!(response["ocs_format"][2]["ai"], json!(true));
        assert_eq!(response["type"], json!("single"));

        let rows = fixture.log.read_all().unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].question_type, "单选题");
        assert_eq!(rows[0].options, "北京 | 上海");
        assert_eq!(rows[0].answer, "上海");
        assert_eq!(rows[0].provider, "OPENAI");
        assert_eq!(rows[0].model_id, "second");
        assert!((rows[0].cost - 0.00203).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reasoning_used_follows_model_support() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "北京", "reasoning_content": "先看选项"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 1}
            })))
            .mount(&server)
            .await;

        let mut thinker = custom_model(&server.uri());
        thinker["supports_reasoning"] = json!(true);
        let mut fixture = Fixture::new(
            &[("plain", custom_model(&server.uri())), ("thinker", thinker)],
            &["plain"],
        );
        fixture.config.reasoning.enabled = true;

        let outcome = answer_question(single_choice(), &ctx(), &fixture.deps())
            .await
            .unwrap();
        assert!(!outcome.reasoning_used);
        assert!(outcome.tags.iter().all(|t| t.text != "深度思考"));
        assert_eq!(outcome.to_response()["reasoning_content"], json!("先看选项"));

        fixture
            .registry
            .write()
            .await
            .set_route("single", vec!["thinker".to_string()], None)
            .unwrap();
        let outcome = answer_question(single_choice(), &ctx(), &fixture.deps())
            .await
            .unwrap();
        assert!(outcome.reasoning_used);
        assert_eq!(outcome.tags[0].text, "深度思考");

        let rows = fixture.log.read_all().unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].reasoning_used);
        assert!(rows[1].reasoning_used);

        let bodies: Vec<serde_json::Value> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.body_json().unwrap())
            .collect();
        assert!(bodies[0].get("reasoning_effort").is_none());
        assert!(bodies[1].get("reasoning_effort").is_some());
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let fixture = Fixture::new(&[("only", custom_model(&server.uri()))], &["only"]);
        let err = answer_question(single_choice(), &ctx(), &fixture.deps())
            .await
            .unwrap_err();

        assert!(matches!(err, AnswerError::AllFailed(_)));
        let msg = err.to_string();
        assert!(msg.starts_with("AI答题失败: "));
        assert!(msg.contains("upstream down"));
        assert!(fixture.log.read_all().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_model_configured() {
        let fixture = Fixture::new(&[], &[]);
        let err = answer_question(single_choice(), &ctx(), &fixture.deps())
            .await
            .unwrap_err();
        assert!(matches!(err, AnswerError::NoModel(_)));
        assert!(err.to_string().contains("API密钥"));
    }

    #[test]
    fn test_tags_for_system_model_in_auto_mode() {
        let mut entry: ModelEntry = serde_json::from_value(custom_model("http://x")).unwrap();
        entry.is_system = true;
        entry.provider = crate::app::models::ProviderKind::Deepseek;

        let reasoning = ReasoningDecision {
            enabled: true,
            reasons: vec!["多选题"],
        };
        let tags = build_tags(&reasoning, true, &entry, "deepseek-reasoner", true);
        let texts: Vec<&str> = tags.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["深度思考", "自动思考", "智能选择", "DEEPSEEK"]);
        assert_eq!(tags[1].color, TagColor::Orange);

        let tags = build_tags(&reasoning, false, &entry, "deepseek-chat", true);
        let texts: Vec<&str> = tags.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["智能选择", "DEEPSEEK"]);
        assert_eq!(provider_label("system_deepseek_chat", &entry, true), "auto(deepseek)");
        assert_eq!(provider_label("system_deepseek_chat", &entry, false), "deepseek");
    }
}
