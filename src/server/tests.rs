use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::auth::API_KEY_HEADER;
use super::router;
use super::state::AppState;
use crate::config::AppConfig;

struct TestApp {
    dir: tempfile::TempDir,
    app: Router,
    key: String,
}

impl TestApp {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let file = |name: &str| dir.path().join(name).to_string_lossy().into_owned();

        let mut config = AppConfig::default();
        config.security.secret_key_file = file("key.json");
        config.storage.models_file = file("models.json");
        config.storage.csv_log_file = file("log.csv");
        config.server.static_dir = file("no-ui");
        config.network.max_retries = 1;
        config.network.retry_base_delay_ms = 1;
        config.network.retry_max_delay_ms = 1;
        adjust(&mut config);

        let state = AppState::new(config).unwrap();
        let key_file: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("key.json")).unwrap()).unwrap();
        let key = key_file["raw_key"].as_str().unwrap().to_string();

        Self {
            app: router(state),
            key,
            dir,
        }
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::get(uri);
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        self.call(builder.body(Body::empty()).unwrap()).await
    }

    async fn send_json(&self, method: &str, uri: &str, key: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        self.call(builder.body(Body::from(body.to_string())).unwrap()).await
    }
}

#[tokio::test]
async fn test_health_reports_missing_keys() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert_eq!(body["provider"], "auto");
    assert_eq!(body["api_configured"], false);
    assert!(body["init_error"].as_str().unwrap().contains("API密钥"));
}

#[tokio::test]
async fn test_protected_routes_require_key() {
    let app = TestApp::with_config(|c| c.deepseek.api_key = "sk-deepseek-abcdef123456".to_string());

    let (status, body) = app.get("/api/config", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "MISSING_KEY");

    let (status, body) = app.get("/api/config", Some("wrong-key")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "INVALID_KEY");

    let (status, body) = app.get("/api/config", Some(&app.key)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["config"]["deepseek"]["api_key"], "sk-d****************3456");

    // 查询参数也可以携带密钥
    let (status, _) = app.get(&format!("/api/models?api_key={}", app.key), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_after_failures() {
    let app = TestApp::with_config(|c| c.security.rate_limit_attempts = 2);

    for _ in 0..2 {
        let (status, _) = app.get("/api/models", Some("wrong-key")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
    let (status, body) = app.get("/api/models", Some(&app.key)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_csv_missing_file_is_404() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/csv", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = app.get("/api/csv/stats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_answer_rejects_empty_question() {
    let app = TestApp::new();
    let (status, body) = app
        .send_json("POST", "/api/answer", None, json!({ "question": "  ", "type": 0 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "题目不能为空");
}

#[tokio::test]
async fn test_answer_without_model_fails_with_reason() {
    let app = TestApp::new();
    let (status, body) = app
        .send_json("POST", "/api/answer", None, json!({ "question": "1+1=?", "type": 3 }))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().starts_with("AI答题失败: "));
}

#[tokio::test]
async fn test_custom_model_answer_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "A#C"}}],
            "usage": {"prompt_tokens": 50, "completion_tokens": 3, "total_tokens": 53}
        })))
        .mount(&server)
        .await;

    let app = TestApp::new();
    let key = app.key.clone();

    let (status, body) = app
        .send_json(
            "POST",
            "/api/models",
            Some(&key),
            json!({
                "model_id": "my_model",
                "name": "我的模型",
                "provider": "openai",
                "api_key": "sk-abcdefghijklmn",
                "base_url": server.uri(),
                "model_name": "gpt-test",
                "supports_reasoning": true,
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, _) = app
        .send_json(
            "PUT",
            "/api/models/question-types/multiple",
            Some(&key),
            json!({ "model_ids": ["my_model"], "enable_reasoning": false }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app.get("/api/models/question-types/multiple", Some(&key)).await;
    assert_eq!(body["model_ids"], json!(["my_model"]));

    let (_, body) = app.get("/api/models/my_model", Some(&key)).await;
    assert_eq!(body["model"]["api_key"], "sk-a*********klmn");

    let (status, body) = app
        .send_json(
            "POST",
            "/api/answer",
            None,
            json!({
                "question": "下列哪些是水果？",
                "options": "苹果\n白菜\n香蕉",
                "type": "multiple",
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["answer"], "苹果#香蕉");
    assert_eq!(body["provider"], "custom(my_model)");
    assert_eq!(body["ocs_format"][1], "苹果#香蕉");
    assert_eq!(body["usage"]["total_tokens"], 53);
    // 多选题默认自动开启思考
    assert_eq!(body["reasoning_used"], true);

    let (status, body) = app.get("/api/csv?page=1&page_size=10&type=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["total_pages"], 1);
    assert_eq!(body["data"][0]["处理后答案"], "苹果#香蕉");
    assert_eq!(body["data"][0]["模型ID"], "my_model");

    let (_, body) = app.get("/api/csv/stats", None).await;
    assert_eq!(body["stats"]["total"], 1);
    assert_eq!(body["stats"]["reasoningCount"], 1);

    let (status, _) = app.send_json("POST", "/api/csv/clear", Some(&key), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = app.get("/api/csv", None).await;
    assert_eq!(body["total"], 0);

    let (status, _) = app.send_json("DELETE", "/api/models/my_model", Some(&key), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.get("/api/models/my_model", Some(&key)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(app.dir.path().join("models.json").exists());
}

#[tokio::test]
async fn test_auth_verify_and_update_key() {
    let app = TestApp::new();

    let (status, body) = app
        .send_json("POST", "/api/auth/verify", None, json!({ "api_key": app.key }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, _) = app
        .send_json("POST", "/api/auth/verify", None, json!({ "api_key": "nope" }))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app
        .send_json(
            "POST",
            "/api/auth/update-key",
            Some(&app.key),
            json!({ "old_key": app.key, "new_key": "short" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "新密钥长度至少8字符");

    let (status, _) = app
        .send_json(
            "POST",
            "/api/auth/update-key",
            Some(&app.key),
            json!({ "old_key": app.key, "new_key": "brand-new-key" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.get("/api/config", Some("brand-new-key")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_query_key_is_percent_decoded() {
    let app = TestApp::new();
    let (status, _) = app
        .send_json(
            "POST",
            "/api/auth/update-key",
            Some(&app.key),
            json!({ "old_key": app.key, "new_key": "my pass+1" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.get("/api/models", Some("my pass+1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get("/api/models?api_key=my%20pass%2B1", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    // 未编码的 + 按空格解码，和新密钥不一致
    let (status, _) = app.get("/api/models?api_key=my%20pass+1", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
