use std::sync::{Arc, PoisonError, RwLock};

use reqwest::{
    Client, Response, StatusCode,
    header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT},
};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::common::client::error::ApiError;
use crate::common::client::models::{Model, ModelVersion, SearchParams, SearchResults};
use crate::common::config::Settings;

const CLIENT_USER_AGENT: &str = "Civitai-Browser-Docker/1.0";

// Civitai 目录 API 客户端，API Key 可在运行时替换
#[derive(Debug, Clone)]
pub struct CivitaiClient {
    inner: Client,
    base_url: String,
    api_key: Arc<RwLock<String>>,
    show_nsfw: bool,
}

impl CivitaiClient {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let inner = settings
            .client_builder()
            .and_then(|builder| {
                builder
                    .timeout(settings.timeout())
                    .default_headers(Self::get_default_headers())
                    .build()
            })
            .map_err(|e| {
                error!("创建 Civitai 客户端失败: {}", e);
                ApiError::Config(e.to_string())
            })?;

        Ok(Self {
            inner,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            api_key: Arc::new(RwLock::new(settings.api_key.clone())),
            show_nsfw: settings.show_nsfw,
        })
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    pub fn set_api_key(&self, key: impl Into<String>) {
        *self.api_key.write().unwrap_or_else(PoisonError::into_inner) = key.into();
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let key = self.api_key.read().unwrap_or_else(PoisonError::into_inner);
        if !key.is_empty() {
            match HeaderValue::from_str(&format!("Bearer {}", key)) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => error!("API Key 含有非法字符，已忽略"),
            }
        }
        headers
    }

    // 通用 GET，404 返回 None
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, ApiError> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));
        debug!("请求 Civitai API: {} {:?}", url, query);

        let resp = self
            .inner
            .get(&url)
            .headers(self.auth_headers())
            .query(query)
            .send()
            .await
            .map_err(|e| {
                error!("请求失败: {}", e);
                e
            })?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("资源不存在: {}", url);
            return Ok(None);
        }
        Self::handle_response(resp).await.map(Some)
    }

    async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let status = resp.status();
        let url = resp.url().to_string();

        match status {
            StatusCode::UNAUTHORIZED => return Err(ApiError::AuthRequired),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                return Err(ApiError::AccessDenied(format!("{} ({})", url, status)));
            }
            s if s.is_server_error() => return Err(ApiError::RetryLater),
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApiError::Status(s.as_u16(), body));
            }
            _ => {}
        }

        let text = resp.text().await?;
        serde_json::from_str::<T>(&text).map_err(|e| {
            error!("失败的请求的URL: {}", url);
            error!("JSON 结构匹配失败: {}", e);
            error!("期望的结构 可能是: {}", std::any::type_name::<T>());
            ApiError::InvalidResponse(format!("结构匹配失败: {}", e))
        })
    }

    pub async fn search_models(&self, params: &SearchParams) -> Result<SearchResults, ApiError> {
        let query = params.to_query(self.show_nsfw);
        Ok(self
            .get::<SearchResults>("models", &query)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_model(&self, model_id: u64) -> Result<Option<Model>, ApiError> {
        let model = self.get::<Model>(&format!("models/{}", model_id), &[]).await?;
        Ok(model.map(|mut m| {
            m.fill_file_sizes();
            m
        }))
    }

    pub async fn get_model_versions(
        &self,
        model_id: u64,
    ) -> Result<Option<Vec<ModelVersion>>, ApiError> {
        Ok(self
            .get_model(model_id)
            .await?
            .map(|model| model.model_versions))
    }
}
