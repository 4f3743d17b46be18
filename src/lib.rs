pub mod cli;
pub mod common;
pub mod downloader;
#[cfg(feature = "http")]
pub mod server;
pub mod status;

pub use common::client::CivitaiClient;
pub use common::config::Settings;
pub use downloader::{DownloadTask, QueueManager, TaskStatus};
