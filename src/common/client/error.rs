use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),

    #[error("API 认证失败，请检查 API Key")]
    AuthRequired,

    #[error("服务暂时不可用，请稍后重试")]
    RetryLater,

    #[error("API限制访问: {0}")]
    AccessDenied(String),

    #[error("Civitai API 错误 ({0}): {1}")]
    Status(u16, String),

    #[error("客户端配置错误: {0}")]
    Config(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
