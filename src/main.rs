use anyhow::Result;
use clap::Parser;

use civitai_browser::cli::{Cli, Command};
use civitai_browser::common::logger;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Cli::parse();

    // 初始化日志
    logger::init_tracing(args.verbose);

    match args.command {
        Command::Serve { config, host, port } => serve(config, &host, port).await,
        Command::Status {
            server,
            watch,
            interval,
        } => civitai_browser::status::run(&server, watch, interval).await,
    }
}

#[cfg(feature = "http")]
async fn serve(config: Option<std::path::PathBuf>, host: &str, port: u16) -> Result<()> {
    use anyhow::Context;
    use civitai_browser::common::config::Settings;
    use civitai_browser::downloader::FolderResolver;
    use civitai_browser::server::{self, AppState};
    use tracing::info;

    let path = config.unwrap_or_else(Settings::default_path);
    let settings = Settings::load_or_default(&path);
    info!("模型目录: {}", settings.model_dir.display());

    // 准备模型目录
    FolderResolver::new(&settings.model_dir).ensure_dirs();

    let addr: std::net::SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("无效的监听地址: {}:{}", host, port))?;
    let state = AppState::from_settings(settings, path)?;
    server::serve(state, addr).await
}

#[cfg(not(feature = "http"))]
async fn serve(_config: Option<std::path::PathBuf>, _host: &str, _port: u16) -> Result<()> {
    anyhow::bail!("当前构建未启用 http 功能，无法启动服务")
}
