// Chunk Upload Rust Library
// 分片上传客户端核心库

// 配置管理模块
pub mod config;

// 状态通知模块
pub mod events;

// 日志模块
pub mod logging;

// 上传服务网络边界
pub mod transport;

// 分片上传模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, UploadConfig};
pub use events::{EventPriority, StatusListener, StatusUpdate};
pub use transport::{HttpUploadClient, UploadTransport};
pub use uploader::{
    FileSnapshot, FileStatus, LocalFile, SubmitOutcome, UploadCoordinator, UploadError,
    UploadResult,
};
