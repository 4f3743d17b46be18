use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

lazy_static! {
    static ref INVALID_FILENAME_CHARS: Regex = Regex::new(r#"[<>:"/\\|?*]"#).unwrap();
}

/// 替换文件名里的非法字符并去掉首尾空白
pub fn clean_filename(name: &str) -> String {
    INVALID_FILENAME_CHARS.replace_all(name, "_").trim().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub model_type: String,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub model_versions: Vec<ModelVersion>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVersion {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub files: Vec<ModelFile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(rename = "sizeKB", default, skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<f64>,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelFile {
    pub fn size_bytes(&self) -> u64 {
        self.size
            .or_else(|| self.size_kb.map(|kb| (kb * 1024.0) as u64))
            .unwrap_or(0)
    }

    pub fn is_primary(&self) -> bool {
        self.primary.unwrap_or(false)
    }
}

impl Model {
    /// 给缺少 size 的文件补上字节数
    pub fn fill_file_sizes(&mut self) {
        for version in &mut self.model_versions {
            version.fill_file_sizes();
        }
    }
}

impl ModelVersion {
    pub fn fill_file_sizes(&mut self) {
        for file in &mut self.files {
            if file.size.is_none() {
                file.size = Some(file.size_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub items: Vec<Model>,
    #[serde(default)]
    pub metadata: Value,
}

/// 模型搜索参数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub nsfw: Option<bool>,
}

fn default_sort() -> String {
    "Highest Rated".to_string()
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            query: None,
            types: None,
            base_model: None,
            sort: default_sort(),
            page: default_page(),
            page_size: default_page_size(),
            nsfw: None,
        }
    }
}

impl SearchParams {
    /// 转成目录 API 的查询参数
    pub fn to_query(&self, show_nsfw: bool) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("limit", self.page_size.clamp(1, 100).to_string()),
            ("page", self.page.max(1).to_string()),
            ("sort", self.sort.clone()),
            ("primaryFileOnly", "true".to_string()),
        ];
        if let Some(q) = self.query.as_deref().filter(|q| !q.trim().is_empty()) {
            query.push(("query", q.trim().to_string()));
        }
        if let Some(types) = self.types.as_deref().filter(|t| !t.is_empty()) {
            query.push(("types", types.to_string()));
        }
        if let Some(base) = self.base_model.as_deref().filter(|b| !b.is_empty()) {
            query.push(("baseModels", base.to_string()));
        }
        query.push(("nsfw", self.nsfw.unwrap_or(show_nsfw).to_string()));
        query
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Version {version_id} not found for model {model_id}")]
    VersionNotFound { model_id: u64, version_id: u64 },
    #[error("File {file_id} not found for version {version_id}")]
    FileNotFound { version_id: u64, file_id: u64 },
    #[error("No versions available for model {0}")]
    NoVersions(u64),
    #[error("No files available for version {0}")]
    NoFiles(u64),
}

/// 选择要下载的版本和文件：指定的优先，否则取最新版本的主文件
pub fn select_file(
    model: &Model,
    version_id: Option<u64>,
    file_id: Option<u64>,
) -> Result<(&ModelVersion, &ModelFile), SelectionError> {
    let version = match version_id {
        Some(vid) => model
            .model_versions
            .iter()
            .find(|v| v.id == vid)
            .ok_or(SelectionError::VersionNotFound {
                model_id: model.id,
                version_id: vid,
            })?,
        None => model
            .model_versions
            .first()
            .ok_or(SelectionError::NoVersions(model.id))?,
    };

    let file = match file_id {
        Some(fid) => version
            .files
            .iter()
            .find(|f| f.id == fid)
            .ok_or(SelectionError::FileNotFound {
                version_id: version.id,
                file_id: fid,
            })?,
        None => version
            .files
            .iter()
            .find(|f| f.is_primary())
            .or_else(|| version.files.first())
            .ok_or(SelectionError::NoFiles(version.id))?,
    };

    Ok((version, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Model {
        serde_json::from_value(json!({
            "id": 7,
            "name": "Sample",
            "type": "LORA",
            "stats": {"downloadCount": 3},
            "modelVersions": [
                {"id": 20, "name": "v2", "files": [
                    {"id": 201, "name": "a.pt", "sizeKB": 2.0},
                    {"id": 202, "name": "b.safetensors", "primary": true, "downloadUrl": "http://x/202"}
                ]},
                {"id": 10, "name": "v1", "files": []}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn cleans_reserved_characters() {
        assert_eq!(clean_filename("  a<b>c:d\"e/f\\g|h?i*j  "), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn selects_latest_primary_by_default() {
        let model = sample();
        let (version, file) = select_file(&model, None, None).unwrap();
        assert_eq!(version.id, 20);
        assert_eq!(file.id, 202);
        assert_eq!(model.extra["stats"]["downloadCount"], 3);
    }

    #[test]
    fn reports_missing_version_and_file() {
        let model = sample();
        assert_eq!(
            select_file(&model, Some(99), None).unwrap_err().to_string(),
            "Version 99 not found for model 7"
        );
        assert_eq!(
            select_file(&model, Some(20), Some(5)).unwrap_err(),
            SelectionError::FileNotFound {
                version_id: 20,
                file_id: 5
            }
        );
        assert_eq!(
            select_file(&model, Some(10), None).unwrap_err(),
            SelectionError::NoFiles(10)
        );
    }

    #[test]
    fn size_falls_back_to_kilobytes() {
        let mut model = sample();
        model.fill_file_sizes();
        assert_eq!(model.model_versions[0].files[0].size, Some(2048));
    }
}
