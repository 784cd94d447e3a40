//! HTTP 服务：答题接口、日志查询、模型管理与管理界面静态文件

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::info;

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod tests;

use routes::*;
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/api/answer", post(answer_handler))
        .route("/api/health", get(health_handler))
        .route("/api/csv", get(csv_handler))
        .route("/api/csv/stats", get(csv_stats_handler))
        .route("/api/auth/verify", post(auth_verify_handler))
        .route("/api/auth/status", get(auth_status_handler));

    let protected = Router::new()
        .route("/api/config", get(config_handler))
        .route("/api/csv/clear", post(csv_clear_handler))
        .route("/api/models", get(list_models_handler).post(add_model_handler))
        .route(
            "/api/models/{id}",
            get(get_model_handler)
                .put(update_model_handler)
                .delete(delete_model_handler),
        )
        .route(
            "/api/models/question-types/{question_type}",
            get(get_route_handler).put(set_route_handler),
        )
        .route("/api/models/test/{id}", post(test_model_handler))
        .route("/api/auth/update-key", post(auth_update_key_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_key));

    let mut app = Router::new().merge(public).merge(protected);

    // 管理界面（前端构建产物），未知路径回落到 index.html
    let static_dir = Path::new(&state.config.server.static_dir);
    if static_dir.is_dir() {
        info!("挂载管理界面: {:?}", static_dir);
        let spa = ServeDir::new(static_dir).fallback(ServeFile::new(static_dir.join("index.html")));
        app = app.fallback_service(spa);
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("绑定地址失败: {}", address))?;
    info!("服务已启动: http://{}", address);
    info!("答题接口: POST http://{}/api/answer", address);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("服务异常退出")?;

    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("监听 Ctrl+C 失败: {}", e);
            std::future::pending::<()>().await;
        }
        info!("收到 Ctrl+C，正在关闭");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("收到终止信号，正在关闭");
            }
            Err(e) => {
                tracing::error!("监听终止信号失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
