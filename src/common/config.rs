use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CONFIG_PATH_ENV: &str = "CIVITAI_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "config/settings.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败 {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置文件格式错误 {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("写入配置文件失败 {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("配置序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 应用配置，启动时读取一次并注入各组件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_key: String,
    pub api_base_url: String,
    pub model_dir: PathBuf,
    pub download_with_aria2: bool,
    pub aria2_binary: String,
    pub aria2_rpc_port: u16,
    pub aria2_secret: String,
    pub aria2_flags: String,
    pub show_nsfw: bool,
    pub use_proxy: bool,
    pub proxy_url: String,
    #[serde(alias = "disable_dns_lookup")]
    pub disable_cert_verify: bool,
    /// 请求超时（秒）
    pub timeout: u64,
    pub recent_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://civitai.com/api/v1".to_string(),
            model_dir: PathBuf::from("models"),
            download_with_aria2: true,
            aria2_binary: "aria2c".to_string(),
            aria2_rpc_port: 24000,
            aria2_secret: "civitai-browser".to_string(),
            aria2_flags: String::new(),
            show_nsfw: false,
            use_proxy: false,
            proxy_url: String::new(),
            disable_cert_verify: false,
            timeout: 30,
            recent_capacity: 20,
        }
    }
}

/// 设置接口的部分更新
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub api_key: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub download_with_aria2: Option<bool>,
    pub aria2_flags: Option<String>,
    pub show_nsfw: Option<bool>,
    pub use_proxy: Option<bool>,
    pub proxy_url: Option<String>,
    #[serde(alias = "disable_dns_lookup")]
    pub disable_cert_verify: Option<bool>,
    pub timeout: Option<u64>,
}

impl Settings {
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// 默认值 <- 环境变量 <- 配置文件。文件缺失或损坏时只记录警告。
    pub fn load_or_default(path: &Path) -> Self {
        let mut settings = Self::default();
        settings.apply_env();

        match Self::read_file(path) {
            Ok(Some(file)) => match settings.overlay(file) {
                Ok(merged) => {
                    info!("📄 已加载配置文件: {}", path.display());
                    return merged;
                }
                Err(e) => warn!("⚠️ 配置文件格式错误 {}: {}，使用默认配置", path.display(), e),
            },
            Ok(None) => debug!("配置文件不存在，使用默认配置: {}", path.display()),
            Err(e) => warn!("⚠️ {}，使用默认配置", e),
        }
        settings
    }

    /// 严格读取：文件必须存在且格式正确
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match Self::read_file(path)? {
            Some(file) => Self::default()
                .overlay(file)
                .map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }),
            None => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }

    fn read_file(path: &Path) -> Result<Option<Value>, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    // 文件里出现的字段覆盖当前值，其余保留
    fn overlay(&self, file: Value) -> Result<Self, serde_json::Error> {
        let mut base = serde_json::to_value(self)?;
        if let (Some(base_map), Value::Object(file_map)) = (base.as_object_mut(), file) {
            for (key, value) in file_map {
                let key = if key == "disable_dns_lookup" {
                    "disable_cert_verify".to_string()
                } else {
                    key
                };
                base_map.insert(key, value);
            }
        }
        serde_json::from_value(base)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("💾 配置已保存: {}", path.display());
        Ok(())
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CIVITAI_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = lookup("CIVITAI_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CIVITAI_USE_ARIA2") {
            self.download_with_aria2 = parse_bool(&v);
        }
        if let Some(v) = lookup("CIVITAI_ARIA2_SECRET") {
            self.aria2_secret = v;
        }
        if let Some(v) = lookup("CIVITAI_ARIA2_FLAGS") {
            self.aria2_flags = v;
        }
        if let Some(v) = lookup("CIVITAI_SHOW_NSFW") {
            self.show_nsfw = parse_bool(&v);
        }
        if let Some(v) = lookup("CIVITAI_USE_PROXY") {
            self.use_proxy = parse_bool(&v);
        }
        if let Some(v) = lookup("CIVITAI_PROXY_URL") {
            self.proxy_url = v;
        }
        if let Some(v) = lookup("CIVITAI_TIMEOUT") {
            match v.trim().parse() {
                Ok(secs) => self.timeout = secs,
                Err(_) => warn!("⚠️ CIVITAI_TIMEOUT 不是有效的秒数: {}", v),
            }
        }
    }

    pub fn update(&mut self, patch: SettingsUpdate) {
        if let Some(v) = patch.api_key {
            self.api_key = v;
        }
        if let Some(v) = patch.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = patch.download_with_aria2 {
            self.download_with_aria2 = v;
        }
        if let Some(v) = patch.aria2_flags {
            self.aria2_flags = v;
        }
        if let Some(v) = patch.show_nsfw {
            self.show_nsfw = v;
        }
        if let Some(v) = patch.use_proxy {
            self.use_proxy = v;
        }
        if let Some(v) = patch.proxy_url {
            self.proxy_url = v;
        }
        if let Some(v) = patch.disable_cert_verify {
            self.disable_cert_verify = v;
        }
        if let Some(v) = patch.timeout {
            self.timeout = v;
        }
    }

    /// 启用且非空时返回代理地址
    pub fn proxy(&self) -> Option<&str> {
        let url = self.proxy_url.trim();
        (self.use_proxy && !url.is_empty()).then_some(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    /// 共用的 HTTP 客户端配置：连接/读取超时、代理、证书校验
    pub fn client_builder(&self) -> Result<reqwest::ClientBuilder, reqwest::Error> {
        let mut builder = reqwest::ClientBuilder::new()
            .connect_timeout(self.timeout())
            .read_timeout(self.timeout())
            .danger_accept_invalid_certs(self.disable_cert_verify);

        if let Some(proxy) = self.proxy() {
            debug!("使用代理: {}", proxy);
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(builder)
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "y"
    )
}
