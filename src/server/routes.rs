use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use super::error::AppError;
use super::state::AppState;
use crate::api::llm::ChatRequest;
use crate::app::answer_log::AnswerRecord;
use crate::app::answer_log::query::{self, LogFilter, PageParams};
use crate::app::question::{AnswerPayload, AnswerRequest};
use crate::app::security::KeyUpdateError;
use crate::app::workflow::AnswerCtx;
use crate::app::workflow::answer_flow::answer_question;

const MODEL_TEST_PROMPT: &str = "请用一句话介绍你自己";

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|_| AppError::BadRequest("无效的请求数据".to_string()))
}

// ==================== 答题 ====================

pub async fn answer_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AnswerPayload>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let payload = json_body(payload)?;
    let Some(request) = AnswerRequest::from_payload(payload) else {
        return Err(AppError::BadRequest("题目不能为空".to_string()));
    };

    let ctx = AnswerCtx {
        seq: state.next_answer_seq(),
        question_type: request.question_type,
        image_count: request.image_urls.len(),
    };
    let outcome = answer_question(request, &ctx, &state.answer_deps())
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(outcome.to_response()))
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let registry = state.registry.read().await;
    let init_error = config.init_error();
    let default_model = registry
        .default_model_id(config, false)
        .and_then(|id| registry.get_model(&id).map(|m| m.model_name.clone()));

    Json(json!({
        "status": if init_error.is_none() { "ok" } else { "error" },
        "service": "OCS AI Answerer",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": config.model.provider.as_str(),
        "model": default_model.unwrap_or_else(|| "未配置".to_string()),
        "reasoning_enabled": config.reasoning.enabled,
        "api_configured": init_error.is_none(),
        "models": registry.all_models(true).len(),
        "init_error": init_error,
    }))
}

pub async fn config_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "config": state.config.masked(),
    }))
}

// ==================== CSV 日志 ====================

async fn load_records(state: &AppState) -> Result<Vec<AnswerRecord>, AppError> {
    let log = Arc::clone(&state.answer_log);
    let records = tokio::task::spawn_blocking(move || log.read_all())
        .await
        .map_err(|e| AppError::Internal(format!("读取CSV任务异常: {}", e)))??;
    records.ok_or_else(|| AppError::NotFound("CSV文件不存在".to_string()))
}

pub async fn csv_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<LogFilter>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>, AppError> {
    let records = load_records(&state).await?;
    let rows = query::select(records, &filter, Local::now().date_naive());
    let page = query::paginate(rows, &params);

    let mut body = serde_json::to_value(page).map_err(|e| AppError::Internal(e.to_string()))?;
    body["success"] = json!(true);
    Ok(Json(body))
}

pub async fn csv_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<LogFilter>,
) -> Result<Json<Value>, AppError> {
    let records = load_records(&state).await?;
    let rows = query::select(records, &filter, Local::now().date_naive());
    Ok(Json(json!({
        "success": true,
        "stats": query::stats(&rows),
    })))
}

pub async fn csv_clear_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let log = Arc::clone(&state.answer_log);
    tokio::task::spawn_blocking(move || log.clear())
        .await
        .map_err(|e| AppError::Internal(format!("清空CSV任务异常: {}", e)))??;

    Ok(Json(json!({
        "success": true,
        "message": "CSV文件已清空（保留表头）",
        "file": state.answer_log.path().display().to_string(),
    })))
}

// ==================== 模型管理 ====================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ListModelsParams {
    enabled_only: bool,
}

pub async fn list_models_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListModelsParams>,
) -> Json<Value> {
    let registry = state.registry.read().await;
    let models: serde_json::Map<String, Value> = registry
        .all_models(params.enabled_only)
        .into_iter()
        .map(|(id, m)| (id, json!(m.masked())))
        .collect();

    Json(json!({
        "success": true,
        "models": models,
        "question_type_models": registry.routes(),
    }))
}

pub async fn get_model_handler(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let registry = state.registry.read().await;
    let model = registry
        .get_model(&model_id)
        .ok_or_else(|| AppError::NotFound("模型不存在".to_string()))?;
    Ok(Json(json!({ "success": true, "model": model.masked() })))
}

pub async fn add_model_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let mut body = json_body(payload)?;
    let Some(fields) = body.as_object_mut() else {
        return Err(AppError::BadRequest("无效的请求数据".to_string()));
    };
    let model_id = match fields.remove("model_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        _ => return Err(AppError::BadRequest("缺少model_id".to_string())),
    };

    state.registry.write().await.add_model(&model_id, body)?;
    Ok(Json(json!({ "success": true, "message": format!("模型 {} 添加成功", model_id) })))
}

pub async fn update_model_handler(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let patch = json_body(payload)?;
    if !patch.is_object() {
        return Err(AppError::BadRequest("无效的请求数据".to_string()));
    }

    state.registry.write().await.update_model(&model_id, patch)?;
    Ok(Json(json!({ "success": true, "message": format!("模型 {} 更新成功", model_id) })))
}

pub async fn delete_model_handler(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.registry.write().await.delete_model(&model_id)?;
    Ok(Json(json!({ "success": true, "message": format!("模型 {} 已删除", model_id) })))
}

pub async fn get_route_handler(
    State(state): State<Arc<AppState>>,
    Path(route_key): Path<String>,
) -> Json<Value> {
    let registry = state.registry.read().await;
    let route = registry.routes().get(&route_key).cloned().unwrap_or_default();
    Json(json!({
        "success": true,
        "question_type": route_key,
        "model_ids": route.models,
        "enable_reasoning": route.enable_reasoning,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RouteBody {
    #[serde(default, alias = "models")]
    model_ids: Vec<String>,
    #[serde(default)]
    enable_reasoning: Option<bool>,
}

pub async fn set_route_handler(
    State(state): State<Arc<AppState>>,
    Path(route_key): Path<String>,
    payload: Result<Json<RouteBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let body = json_body(payload)?;
    state
        .registry
        .write()
        .await
        .set_route(&route_key, body.model_ids, body.enable_reasoning)?;
    Ok(Json(json!({ "success": true, "message": format!("{} 题型的模型列表已更新", route_key) })))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ModelTestBody {
    test_prompt: Option<String>,
}

pub async fn test_model_handler(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
    payload: Result<Json<ModelTestBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let entry = state
        .registry
        .read()
        .await
        .get_model(&model_id)
        .cloned()
        .ok_or_else(|| AppError::NotFound("模型不存在".to_string()))?;

    // 请求体可以为空
    let prompt = payload
        .ok()
        .and_then(|Json(body)| body.test_prompt)
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| MODEL_TEST_PROMPT.to_string());

    let start = Instant::now();
    let request = ChatRequest {
        prompt: &prompt,
        image_urls: &[],
        reasoning: false,
    };
    match state.llm.chat(&entry, request).await {
        Ok(outcome) => {
            let latency = start.elapsed().as_secs_f64();
            info!("模型测试成功: {}, 延迟: {:.2}秒", model_id, latency);
            Ok((
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "response": outcome.answer.trim(),
                    "latency": (latency * 100.0).round() / 100.0,
                    "tokens": {
                        "prompt": outcome.usage.prompt_tokens,
                        "completion": outcome.usage.completion_tokens,
                        "total": outcome.usage.total_tokens,
                    },
                })),
            ))
        }
        Err(e) => {
            error!("模型测试失败: {}, 错误: {}", model_id, e);
            Err(AppError::BadRequest(format!("连接测试失败: {}", e)))
        }
    }
}

// ==================== 访问密钥 ====================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct VerifyBody {
    api_key: String,
}

pub async fn auth_verify_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VerifyBody>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let key = payload.map(|Json(b)| b.api_key).unwrap_or_default();
    if key.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "valid": false, "error": "缺少API密钥" })));
    }
    if state.security.verify_key(&key) {
        (StatusCode::OK, Json(json!({ "valid": true })))
    } else {
        (StatusCode::FORBIDDEN, Json(json!({ "valid": false, "error": "密钥无效" })))
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct UpdateKeyBody {
    old_key: String,
    new_key: String,
}

pub async fn auth_update_key_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UpdateKeyBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let body = json_body(payload)?;
    if body.old_key.is_empty() || body.new_key.is_empty() {
        return Err(AppError::BadRequest("缺少必要参数".to_string()));
    }

    state
        .security
        .update_key(&body.old_key, &body.new_key)
        .map_err(|e| match e {
            KeyUpdateError::Save(_) => AppError::Internal(e.to_string()),
            _ => AppError::BadRequest(e.to_string()),
        })?;
    Ok(Json(json!({ "success": true, "message": "密钥更新成功" })))
}

pub async fn auth_status_handler() -> Json<Value> {
    Json(json!({
        "auth_enabled": true,
        "message": "此服务需要API密钥才能访问敏感接口",
    }))
}
