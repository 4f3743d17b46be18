use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Civitai 模型浏览与下载队列服务
#[derive(Parser, Debug)]
#[command(name = "civitai-browser")]
#[command(version)]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "本地 Civitai 模型浏览与下载队列服务", long_about = None)]
pub struct Cli {
    /// 输出调试日志
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 启动 HTTP 服务
    Serve {
        /// 配置文件路径 (默认读取 CIVITAI_CONFIG_PATH 或 ./config/settings.json)
        #[arg(long, value_name = "PATH")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,

        /// 监听地址
        #[arg(long, value_name = "HOST", default_value = "127.0.0.1")]
        host: String,

        /// 监听端口
        #[arg(long, value_name = "PORT", default_value_t = 8000)]
        port: u16,
    },

    /// 查看下载状态
    Status {
        /// 服务地址
        #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8000")]
        #[arg(value_hint = clap::ValueHint::Url)]
        server: String,

        /// 持续刷新
        #[arg(long, short)]
        watch: bool,

        /// 刷新间隔（秒）
        #[arg(long, value_name = "SECS", default_value_t = 2)]
        interval: u64,
    },
}
