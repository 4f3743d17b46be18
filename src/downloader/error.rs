use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("无法创建目标文件夹 {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("访问被拒绝: {0}")]
    AccessDenied(String),

    #[error("下载流中断: {0}")]
    Stream(String),

    #[error("aria2 RPC 错误: {0}")]
    Rpc(String),

    #[error("aria2 不可用: {0}")]
    Unavailable(String),
}
