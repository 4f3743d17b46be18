use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use super::task::DownloadTask;

/// 模型类型 -> 子目录
const TYPE_FOLDERS: &[(&str, &str)] = &[
    ("Checkpoint", "Stable-diffusion"),
    ("Hypernetwork", "hypernetworks"),
    ("TextualInversion", "embeddings"),
    ("AestheticGradient", "aesthetic_embeddings"),
    ("LORA", "Lora"),
    ("DoRA", "Lora"),
    ("LoCon", "LyCORIS"),
    ("VAE", "VAE"),
    ("Controlnet", "ControlNet"),
    ("Poses", "Poses"),
    ("Upscaler", "ESRGAN"),
    ("MotionModule", "MotionModule"),
    ("Workflows", "Workflows"),
    ("Other", "Other"),
];

// 放大模型按描述里的关键字细分，顺序即优先级
const UPSCALER_HINTS: &[(&str, &str)] = &[
    ("SWINIR", "SwinIR"),
    ("REALESRGAN", "RealESRGAN"),
    ("GFPGAN", "GFPGAN"),
    ("BSRGAN", "BSRGAN"),
];

const FALLBACK_FOLDER: &str = "Other";

#[derive(Debug, Clone)]
pub struct FolderResolver {
    root: PathBuf,
}

impl FolderResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 根据模型类型和描述得到目标目录，不做任何 IO
    pub fn resolve(&self, model_type: &str, description: Option<&str>) -> PathBuf {
        self.root.join(Self::subdirectory(model_type, description))
    }

    fn subdirectory(model_type: &str, description: Option<&str>) -> &'static str {
        if model_type == "Upscaler" {
            if let Some(hint) = description {
                let hint = hint.to_uppercase();
                if let Some((_, folder)) = UPSCALER_HINTS.iter().find(|(key, _)| hint.contains(key)) {
                    return *folder;
                }
            }
        }

        TYPE_FOLDERS
            .iter()
            .find(|(tag, _)| *tag == model_type)
            .map(|(_, folder)| *folder)
            .unwrap_or(FALLBACK_FOLDER)
    }

    /// 任务的最终目录：类型目录 + 清理后的子目录
    pub fn target_folder(&self, task: &DownloadTask) -> PathBuf {
        let base = self.resolve(&task.target.model_type, task.target.description.as_deref());
        match task.target.subfolder.as_deref() {
            Some(sub) => base.join(sanitize_subfolder(sub)),
            None => base,
        }
    }

    /// 已知的模型类型
    pub fn model_types() -> Vec<&'static str> {
        TYPE_FOLDERS.iter().map(|(tag, _)| *tag).collect()
    }

    /// 创建所有类型目录，失败只记录警告
    pub fn ensure_dirs(&self) {
        let folders = TYPE_FOLDERS
            .iter()
            .map(|(_, folder)| *folder)
            .chain(UPSCALER_HINTS.iter().map(|(_, folder)| *folder));

        for folder in folders {
            let path = self.root.join(folder);
            match std::fs::create_dir_all(&path) {
                Ok(()) => debug!("目录已就绪: {}", path.display()),
                Err(e) => warn!("⚠️ 无法创建目录 {}: {}", path.display(), e),
            }
        }
    }
}

/// 只保留普通路径段，去掉根、盘符、`.` 和 `..`
pub fn sanitize_subfolder(sub: &str) -> PathBuf {
    Path::new(sub)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
