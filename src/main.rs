use anyhow::{bail, Context};
use chunk_upload_rust::{
    events::LoggingListener, logging, AppConfig, FileStatus, HttpUploadClient, LocalFile,
    StatusListener, SubmitOutcome, UploadCoordinator,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 命令行参数
#[derive(Parser, Debug)]
#[command(
    name = "chunk-upload-rust",
    version,
    about = "分片上传本地文件，支持断点续传"
)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 要上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_or_default(&args.config).await;

    // 🔥 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);
    info!("Chunk Upload Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));

    config.upload.validate().context("上传配置无效")?;
    let transport = Arc::new(HttpUploadClient::new(&config.upload)?);
    info!(
        "上传服务: {} (切片线程 {})",
        config.upload.server_url, config.upload.max_workers
    );

    let (tx, mut updates) = mpsc::unbounded_channel();
    let coordinator = UploadCoordinator::new(&config.upload, transport, Arc::new(tx));

    let mut accepted = 0;
    for path in &args.files {
        let source = match LocalFile::open(path).await {
            Ok(file) => file.into_shared(),
            Err(e) => {
                error!("无法打开文件 {}: {:#}", path.display(), e);
                continue;
            }
        };
        match coordinator.submit(source).await? {
            SubmitOutcome::Accepted(file) => {
                info!("已加入上传列表: {} -> {}", path.display(), file.id);
                accepted += 1;
            }
            SubmitOutcome::Duplicate { existing_id } => {
                warn!("跳过重复文件: {} (已有任务 {})", path.display(), existing_id);
            }
        }
    }

    if accepted == 0 {
        bail!("没有可上传的文件");
    }

    // 所有文件都进入需要用户操作的状态后退出
    let printer = LoggingListener;
    let files = loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    bail!("上传协调器已退出");
                };
                let done = update.files.len() == accepted
                    && update.files.iter().all(|f| f.status.is_settled());
                let files = update.files.clone();
                printer.on_status_changed(update);
                if done {
                    break files;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，退出");
                break coordinator.files().await?;
            }
        }
    };

    let failed: Vec<_> = files
        .iter()
        .filter(|f| f.status != FileStatus::Complete)
        .collect();
    for file in &failed {
        error!(
            "{} 未完成: {} {}",
            file.name,
            file.status,
            file.error.as_deref().unwrap_or("")
        );
    }
    info!("上传结束: 成功 {}/{}", files.len() - failed.len(), files.len());

    if !failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
