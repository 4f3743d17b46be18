use std::collections::HashSet;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::state::AppState;
use crate::common::client::ApiError;
use crate::common::client::models::{Model, ModelVersion, SearchParams, SearchResults, select_file};
use crate::common::config::{Settings, SettingsUpdate};
use crate::downloader::{DownloadTask, FolderResolver, QueueManager, TaskTarget};

/// 错误响应：`{"detail": ...}`
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    detail: String,
}

impl ApiFailure {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<ApiError> for ApiFailure {
    fn from(e: ApiError) -> Self {
        error!("Civitai API 请求失败: {}", e);
        let status = match e {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadRequest {
    pub(crate) model_id: u64,
    #[serde(default)]
    pub(crate) version_id: Option<u64>,
    #[serde(default)]
    pub(crate) file_id: Option<u64>,
    #[serde(default)]
    pub(crate) subfolder: Option<String>,
}

pub(crate) async fn create_download(
    State(state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadTask>, ApiFailure> {
    let model = state
        .catalog
        .get_model(req.model_id)
        .await?
        .ok_or_else(|| ApiFailure::not_found(format!("Model {} not found", req.model_id)))?;

    let (version, file) = select_file(&model, req.version_id, req.file_id)
        .map_err(|e| ApiFailure::not_found(e.to_string()))?;

    let url = file.download_url.clone().unwrap_or_else(|| {
        format!("https://civitai.com/api/download/models/{}", version.id)
    });

    let target = TaskTarget {
        model_id: model.id,
        version_id: version.id,
        file_id: file.id,
        model_name: model.name.clone(),
        filename: file.name.clone(),
        model_type: model.model_type.clone(),
        url,
        subfolder: req.subfolder.filter(|s| !s.trim().is_empty()),
        description: model.description.clone(),
    };

    let task = state.manager.enqueue(QueueManager::create_task(target));
    Ok(Json(task))
}

// 有未结束的 aria2 任务时查询 aria2 并同步到历史，返回 aria2 侧的全部任务
async fn sync_aria2(state: &AppState, known: &[DownloadTask]) -> Vec<DownloadTask> {
    let Some(bridge) = &state.aria2 else {
        return Vec::new();
    };
    let pending = known
        .iter()
        .any(|t| t.aria2_gid.is_some() && !t.is_terminal());
    if !pending {
        return Vec::new();
    }

    let reconciled = bridge.list_tasks(known).await;
    let updated = state.manager.sync_external(&reconciled);
    debug!("aria2 同步: {} 条记录, 更新 {} 个任务", reconciled.len(), updated);
    reconciled
}

pub(crate) async fn list_downloads(State(state): State<AppState>) -> Json<Vec<DownloadTask>> {
    let snapshot = state.manager.snapshot();
    let reconciled = sync_aria2(&state, &snapshot).await;
    if reconciled.is_empty() {
        return Json(snapshot);
    }

    // 本地没有记录的 aria2 任务也一并返回
    let mut tasks = state.manager.snapshot();
    let mut seen: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    tasks.extend(reconciled.into_iter().filter(|t| seen.insert(t.id.clone())));
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(tasks)
}

pub(crate) async fn get_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<DownloadTask>, ApiFailure> {
    let task = state
        .manager
        .status_of(&task_id)
        .ok_or_else(|| ApiFailure::not_found(format!("Download task {} not found", task_id)))?;

    if task.aria2_gid.is_some() && !task.is_terminal() {
        sync_aria2(&state, std::slice::from_ref(&task)).await;
        if let Some(updated) = state.manager.status_of(&task_id) {
            return Ok(Json(updated));
        }
    }
    Ok(Json(task))
}

pub(crate) async fn cancel_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiFailure> {
    if state.manager.dequeue(&task_id) {
        Ok(Json(json!({ "status": "canceled", "task_id": task_id })))
    } else {
        Err(ApiFailure::not_found(format!(
            "Download task {} not found or cannot be canceled",
            task_id
        )))
    }
}

pub(crate) async fn clear_history(State(state): State<AppState>) -> Json<Value> {
    state.manager.clear_history();
    Json(json!({ "status": "success", "message": "Download history cleared" }))
}

pub(crate) async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings().clone())
}

pub(crate) async fn update_settings(
    State(state): State<AppState>,
    Json(patch): Json<SettingsUpdate>,
) -> Result<Json<Settings>, ApiFailure> {
    let api_key = patch.api_key.clone();
    let updated = {
        let mut settings = state.settings();
        settings.update(patch);
        settings.clone()
    };

    if let Some(key) = api_key {
        state.catalog.set_api_key(key);
    }

    let to_save = updated.clone();
    let path = state.settings_path.clone();
    tokio::task::spawn_blocking(move || to_save.save(&path))
        .await
        .map_err(|e| ApiFailure::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| {
            warn!("⚠️ 保存配置失败: {}", e);
            ApiFailure::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    info!("⚙️ 配置已更新，下载相关设置将在重启后生效");
    Ok(Json(updated))
}

pub(crate) async fn search_models(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResults>, ApiFailure> {
    Ok(Json(state.catalog.search_models(&params).await?))
}

pub(crate) async fn get_model(
    State(state): State<AppState>,
    Path(model_id): Path<u64>,
) -> Result<Json<Model>, ApiFailure> {
    state
        .catalog
        .get_model(model_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiFailure::not_found(format!("Model {} not found", model_id)))
}

pub(crate) async fn get_model_versions(
    State(state): State<AppState>,
    Path(model_id): Path<u64>,
) -> Result<Json<Vec<ModelVersion>>, ApiFailure> {
    state
        .catalog
        .get_model_versions(model_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiFailure::not_found(format!("Model {} not found", model_id)))
}

pub(crate) async fn model_types() -> Json<Vec<&'static str>> {
    Json(FolderResolver::model_types())
}
