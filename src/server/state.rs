use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::common::client::CivitaiClient;
use crate::common::config::Settings;
use crate::downloader::{Aria2Bridge, ModelDownloader, QueueManager, QueueOptions};

#[derive(Clone)]
pub struct AppState {
    pub manager: QueueManager,
    pub catalog: CivitaiClient,
    pub aria2: Option<Arc<Aria2Bridge>>,
    pub settings: Arc<Mutex<Settings>>,
    pub settings_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(
        manager: QueueManager,
        catalog: CivitaiClient,
        aria2: Option<Arc<Aria2Bridge>>,
        settings: Settings,
        settings_path: PathBuf,
    ) -> Self {
        Self {
            manager,
            catalog,
            aria2,
            settings: Arc::new(Mutex::new(settings)),
            settings_path: Arc::new(settings_path),
        }
    }

    /// 按配置组装下载队列和目录客户端
    pub fn from_settings(settings: Settings, settings_path: PathBuf) -> Result<Self> {
        let downloader = ModelDownloader::from_settings(&settings)?;
        let aria2 = downloader.aria2().cloned();
        let manager = QueueManager::new(Arc::new(downloader), QueueOptions::from_settings(&settings));
        let catalog = CivitaiClient::new(&settings)?;
        Ok(Self::new(manager, catalog, aria2, settings, settings_path))
    }

    pub fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
