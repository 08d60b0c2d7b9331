// 配置管理模块

use crate::uploader::chunk::{ChunkingOptions, MB};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 上传服务地址
    pub server_url: String,
    /// 分片上传接口路径
    pub chunk_path: String,
    /// 未完成分片查询接口路径
    pub unfinished_path: String,
    /// 切片线程数（线程池大小）
    pub max_workers: usize,
    /// 基础分片大小 (MB)
    pub base_chunk_size_mb: u64,
    /// 分片数量上限，超过时分片大小翻倍
    pub max_chunk_count: u64,
    /// 是否计算完整内容 MD5
    pub compute_content_md5: bool,
    /// 单个分片请求超时（秒，默认 20 小时）
    pub request_timeout_secs: u64,
    /// 单个分片的网络错误重试次数
    pub max_retries: u32,
    /// 是否允许重复提交相同文件
    pub allow_duplicates: bool,
    /// 进度通知最小间隔（毫秒）
    pub progress_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:4000".to_string(),
            chunk_path: "/uploadChunck".to_string(),
            unfinished_path: "/unfinished".to_string(),
            max_workers: 5,
            base_chunk_size_mb: 100,
            max_chunk_count: 10_000,
            compute_content_md5: true,
            request_timeout_secs: 20 * 60 * 60,
            max_retries: 3,
            allow_duplicates: false,
            progress_interval_ms: 200,
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers 必须大于 0");
        }
        if self.base_chunk_size_mb == 0 {
            anyhow::bail!("base_chunk_size_mb 必须大于 0");
        }
        if self.max_chunk_count == 0 {
            anyhow::bail!("max_chunk_count 必须大于 0");
        }
        if self.server_url.trim().is_empty() {
            anyhow::bail!("server_url 不能为空");
        }
        Ok(())
    }

    /// 切片参数
    pub fn chunking_options(&self) -> ChunkingOptions {
        ChunkingOptions {
            base_chunk_size: self.base_chunk_size_mb * MB,
            max_chunk_count: self.max_chunk_count,
            compute_content_md5: self.compute_content_md5,
        }
    }

    /// 分片上传完整 URL
    pub fn chunk_url(&self) -> String {
        join_url(&self.server_url, &self.chunk_path)
    }

    /// 未完成分片查询完整 URL
    pub fn unfinished_url(&self) -> String {
        join_url(&self.server_url, &self.unfinished_path)
    }

    /// 分片请求超时
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// 进度通知间隔
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：写入默认配置，已存在但无效的文件保持不动
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_workers, 5);
        assert_eq!(config.upload.base_chunk_size_mb, 100);
        assert_eq!(config.upload.request_timeout(), Duration::from_secs(72_000));
        assert_eq!(config.upload.chunk_url(), "http://localhost:4000/uploadChunck");
        assert!(config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.max_workers = 2;
        config.upload.server_url = "http://upload.local:8080/".to_string();
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload, config.upload);
        assert_eq!(
            loaded.upload.unfinished_url(),
            "http://upload.local:8080/unfinished"
        );
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(path, "[upload]\nmax_workers = 3\n").unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.max_workers, 3);
        assert_eq!(loaded.upload.max_chunk_count, 10_000);
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.upload, UploadConfig::default());
        assert!(std::path::Path::new(path).exists());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = UploadConfig::default();
        assert!(config.validate().is_ok());

        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = UploadConfig {
            base_chunk_size_mb: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.base_chunk_size_mb = 1;
        config.max_chunk_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunking_options() {
        let config = UploadConfig {
            base_chunk_size_mb: 4,
            compute_content_md5: false,
            ..Default::default()
        };
        let options = config.chunking_options();
        assert_eq!(options.base_chunk_size, 4 * MB);
        assert_eq!(options.max_chunk_count, 10_000);
        assert!(!options.compute_content_md5);
    }
}
