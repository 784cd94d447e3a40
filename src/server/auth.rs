//! 管理接口的访问密钥校验

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use tracing::warn;

use super::error::AppError;
use super::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Deserialize)]
struct KeyQuery {
    #[serde(default)]
    api_key: Option<String>,
}

/// 客户端 IP：优先取 X-Forwarded-For 的第一个地址
pub fn client_ip(request: &Request) -> String {
    if let Some(first) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return first.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// 密钥来自 X-API-Key 请求头或 api_key 查询参数
fn extract_key(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if from_header.is_some() {
        return from_header;
    }

    Query::<KeyQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.api_key)
        .filter(|k| !k.is_empty())
}

pub async fn require_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&request);

    if let Err(wait) = state.security.check_rate_limit(&ip) {
        warn!("IP {} 认证失败次数过多，已限流", ip);
        return Err(AppError::RateLimited(wait));
    }

    let Some(key) = extract_key(&request) else {
        state.security.record_failure(&ip);
        return Err(AppError::MissingKey);
    };
    if !state.security.verify_key(&key) {
        warn!("IP {} 使用了无效的访问密钥", ip);
        state.security.record_failure(&ip);
        return Err(AppError::InvalidKey);
    }

    state.security.clear_failures(&ip);
    Ok(next.run(request).await)
}
