mod api;
mod app;
mod config;
mod server;

use tracing::info;

use crate::config::AppConfig;
use crate::server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let _guards = app::logger::init(&config.log.dir, &config.log.file_prefix);

    info!("========== OCS AI 答题服务启动 ==========");
    info!(
        "模型提供商: {}，思考模式: {}",
        config.model.provider.as_str(),
        if config.reasoning.enabled { "开启" } else { "按需" }
    );

    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("服务初始化失败: {:?}", e);
            return Err(e);
        }
    };

    if let Err(e) = server::serve(state).await {
        tracing::error!("服务运行失败: {:?}", e);
        return Err(e);
    }
    info!("========== 服务已退出 ==========");

    Ok(())
}
