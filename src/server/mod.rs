//! REST 接口：下载队列和 Civitai 目录查询。

mod router;
mod routes;
mod state;

use std::net::SocketAddr;

use anyhow::Result;
use tracing::info;

pub use router::build_router;
pub use routes::ApiFailure;
pub use state::AppState;

pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🚀 服务已启动: http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭服务...");
}
