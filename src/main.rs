//! Parole 服务入口
//!
//! 加载配置、打开数据库、构建编排器，然后同时运行 HTTP 接口与实时对练网关，
//! Ctrl+C / SIGTERM 后依次停止并关闭连接池。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parole::api::{router, AppState};
use parole::config::load_config;
use parole::core::{
    CloseStore, DrainLiveReplies, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use parole::gateway::{HubConfig, LiveHub};
use parole::llm::create_generator;
use parole::{observability, Orchestrator, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let store = Store::connect(&cfg.app.database_url, cfg.app.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.app.database_url))?;
    let generator = create_generator(&cfg.llm);
    let orchestrator = Orchestrator::new(store.clone(), generator, &cfg);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let hub = LiveHub::new(
        HubConfig {
            bind_addr: cfg.server.live_addr.clone(),
            ..Default::default()
        },
        orchestrator.live().clone(),
        shutdown.token(),
    );
    let live_addr = hub
        .start()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to start live gateway")?;
    tracing::info!("Live gateway on ws://{}/live/<session_id>/stream", live_addr);

    let replies = orchestrator.live().workers().clone();
    let state = Arc::new(AppState { orchestrator });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.server.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.http_addr))?;
    tracing::info!("HTTP API on http://{}", cfg.server.http_addr);

    let token = shutdown.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = served {
        tracing::error!(error = %e, "http server exited");
        shutdown.shutdown(ShutdownReason::ServiceExited("http".into()));
    }

    hub.stop();
    // 单次回复最长就是一次 LLM 请求
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(cfg.llm.timeouts.request + 5));
    coordinator
        .register(DrainLiveReplies(replies))
        .register(CloseStore(store));
    coordinator.run().await;
    tracing::info!(reason = ?shutdown.reason(), "bye");
    Ok(())
}
