use colored::*;
use indicatif::{HumanBytes, HumanDuration};
use std::time::Duration;

use crate::downloader::task::{DownloadTask, TaskStatus};

/// 初始化 tracing 输出，只在二进制入口调用一次
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// 状态查看器的终端输出
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示成功消息
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    pub fn error(message: impl AsRef<str>) {
        println!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(60).bright_black());
    }

    /// 显示标题
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(56);
        let padding = (56 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(56 - padding - width).bright_black()
        );
    }

    pub fn section(text: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), text.as_ref().bold());
    }

    /// 显示等待消息
    pub fn waiting(message: impl AsRef<str>) {
        println!("{} {}", "⏳".yellow().bold(), message.as_ref());
    }

    /// 正在下载的任务：进度条、速度、剩余时间
    pub fn current_task(task: &DownloadTask) {
        println!(
            "{} {} {}",
            "⬇".blue().bold(),
            task.target.model_name.bold(),
            format!("({})", task.target.filename).bright_black()
        );
        println!("   {}", progress_bar(task.progress));

        let speed = format!("{}/s", HumanBytes(task.download_speed as u64));
        let eta = task
            .eta
            .map(|secs| HumanDuration(Duration::from_secs_f64(secs.max(0.0))).to_string())
            .unwrap_or_else(|| "未知".to_string());
        println!("   速度: {}  剩余: {}", speed.cyan(), eta.cyan());
    }

    /// 队列或历史中的一行
    pub fn task_line(task: &DownloadTask) {
        let status = match &task.status {
            TaskStatus::Completed => "完成".green().bold(),
            TaskStatus::Failed { .. } => "失败".red().bold(),
            TaskStatus::Downloading => format!("{:.1}%", task.progress).blue().bold(),
            TaskStatus::Queued => "排队".yellow(),
        };
        println!(
            "  [{}] {} - {} {}",
            status,
            task.target.model_name,
            task.target.filename,
            task.created_at.format("%m-%d %H:%M").to_string().bright_black()
        );
        if let Some(error) = task.status.error() {
            println!("      {}", error.red());
        }
    }
}

/// 文本进度条，progress 取值 0-100
pub fn progress_bar(progress: f64) -> String {
    let bar_width = 30;
    let ratio = (progress / 100.0).clamp(0.0, 1.0);
    let filled = (ratio * bar_width as f64) as usize;
    let empty = bar_width - filled;

    format!(
        "[{}{}] {:.1}%",
        "█".repeat(filled).green(),
        "░".repeat(empty).bright_black(),
        ratio * 100.0
    )
}
