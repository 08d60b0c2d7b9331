// 待上传文件的数据源
//
// 切片线程和上传循环只通过 FileSource 读取字节，
// 本地文件由 LocalFile 实现，测试中可以替换为内存数据源。

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 文件数据源（由文件选择边界提供的原始文件句柄）
#[async_trait]
pub trait FileSource: Send + Sync + std::fmt::Debug {
    /// 文件名
    fn name(&self) -> &str;

    /// 文件大小（字节）
    fn size(&self) -> u64;

    /// 修改时间（Unix 毫秒）
    fn modified_at(&self) -> Option<i64>;

    /// 读取指定字节范围
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>>;
}

/// 共享的数据源句柄
pub type SharedSource = Arc<dyn FileSource>;

/// 本地文件
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
    modified_at: Option<i64>,
}

impl LocalFile {
    /// 打开本地文件并读取元数据
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .context(format!("无法获取文件元数据: {:?}", path))?;

        if metadata.is_dir() {
            anyhow::bail!("不支持上传目录: {:?}", path);
        }

        let modified_at = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            modified_at,
        })
    }

    /// 包装为共享句柄
    pub fn into_shared(self) -> SharedSource {
        Arc::new(self)
    }
}

#[async_trait]
impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn modified_at(&self) -> Option<i64> {
        self.modified_at
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let start = range.start;
        let len = (range.end - range.start) as usize;

        // 在阻塞线程池中执行文件 I/O
        let buffer = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file =
                std::fs::File::open(&path).context(format!("无法打开文件: {:?}", path))?;
            file.seek(SeekFrom::Start(start)).context("文件定位失败")?;

            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer).context("读取分片数据失败")?;
            Ok(buffer)
        })
        .await
        .context("读取任务执行失败")??;

        debug!(
            "读取分片数据: file={}, bytes={}..{}, 大小={} bytes",
            self.name,
            range.start,
            range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_local_file_metadata_and_read() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789abcdef").unwrap();
        tmp.flush().unwrap();

        let file = LocalFile::open(tmp.path()).await.unwrap();
        assert_eq!(file.size(), 16);
        assert!(file.modified_at().is_some());
        assert_eq!(
            file.name(),
            tmp.path().file_name().unwrap().to_string_lossy()
        );

        assert_eq!(file.read_range(0..4).await.unwrap(), b"0123");
        assert_eq!(file.read_range(10..16).await.unwrap(), b"abcdef");
        assert!(file.read_range(0..0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_file_read_past_end_fails() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"short").unwrap();
        tmp.flush().unwrap();

        let file = LocalFile::open(tmp.path()).await.unwrap();
        assert!(file.read_range(0..64).await.is_err());
    }

    #[tokio::test]
    async fn test_open_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFile::open(dir.path()).await.is_err());
    }
}
