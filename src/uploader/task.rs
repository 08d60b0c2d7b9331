// 文件任务定义

use crate::uploader::chunk::Chunk;
use crate::uploader::identity::{file_extension, quick_fingerprint};
use crate::uploader::source::SharedSource;
use crate::uploader::worker::ChunkedFile;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// 文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// 等待切片线程
    CutPending,
    /// 切片中
    Cutting,
    /// 切片完成
    CutSuccess,
    /// 上传中
    Uploading,
    /// 合并中
    Merging,
    /// 上传完成
    Complete,
    /// 切片已暂停
    CutPause,
    /// 切片取消中
    CutCancel,
    /// 切片失败
    CutError,
    /// 上传已暂停
    UploadPause,
    /// 上传失败
    UploadError,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::CutPending => "CUT_PENDING",
            FileStatus::Cutting => "CUTTING",
            FileStatus::CutSuccess => "CUT_SUCCESS",
            FileStatus::Uploading => "UPLOADING",
            FileStatus::Merging => "MERGING",
            FileStatus::Complete => "COMPLETE",
            FileStatus::CutPause => "CUT_PAUSE",
            FileStatus::CutCancel => "CUT_CANCEL",
            FileStatus::CutError => "CUT_ERROR",
            FileStatus::UploadPause => "UPLOAD_PAUSE",
            FileStatus::UploadError => "UPLOAD_ERROR",
        }
    }

    /// 是否处于上传阶段（请求可能在途）
    pub fn is_uploading(&self) -> bool {
        matches!(self, FileStatus::Uploading | FileStatus::Merging)
    }

    /// 是否为需要用户操作才会继续的状态
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            FileStatus::Complete
                | FileStatus::CutPause
                | FileStatus::CutError
                | FileStatus::UploadPause
                | FileStatus::UploadError
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文件任务（协调器独占）
#[derive(Debug)]
pub struct FileTask {
    /// 任务ID
    pub id: String,
    /// 数据源
    pub source: SharedSource,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 文件后缀
    pub extension: String,
    /// 快速指纹
    pub quick_fingerprint: String,
    /// 完整内容 MD5
    pub content_fingerprint: Option<String>,
    /// 分片列表
    pub chunks: Vec<Chunk>,
    /// 分片总数（切片完成后等于 chunks.len()）
    pub total_chunks: usize,
    /// 分片大小
    pub chunk_size: u64,
    /// 切片游标：已切好的分片数
    pub chunk_cursor: usize,
    /// 上传游标：下一个要上传的分片
    pub upload_cursor: usize,
    /// 状态
    pub status: FileStatus,
    /// 进度 (0-100)
    pub progress: u8,
    /// 驻留切片任务的线程（暂停/失败后保留，用于重试和取消）
    pub unit_id: Option<usize>,
    /// 是否正在租用线程
    unit_leased: bool,
    /// 上传取消令牌（仅在上传请求在途时存在）
    cancel_token: Option<CancellationToken>,
    /// 创建时间（Unix 毫秒）
    pub created_at: i64,
    /// 切片完成时间
    pub chunked_at: Option<i64>,
    /// 完成时间
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl FileTask {
    pub fn new(id: String, source: SharedSource) -> Self {
        let name = source.name().to_string();
        Self {
            quick_fingerprint: quick_fingerprint(&name, source.size(), source.modified_at()),
            extension: file_extension(&name),
            size: source.size(),
            name,
            id,
            source,
            content_fingerprint: None,
            chunks: Vec::new(),
            total_chunks: 0,
            chunk_size: 0,
            chunk_cursor: 0,
            upload_cursor: 0,
            status: FileStatus::CutPending,
            progress: 0,
            unit_id: None,
            unit_leased: false,
            cancel_token: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            chunked_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 记录租用的线程
    pub fn attach_unit(&mut self, unit_id: usize) {
        debug_assert!(self.cancel_token.is_none(), "切片与上传不能同时进行");
        self.unit_id = Some(unit_id);
        self.unit_leased = true;
    }

    /// 归还线程后调用，返回之前租用的线程
    pub fn detach_unit(&mut self) -> Option<usize> {
        if std::mem::take(&mut self.unit_leased) {
            self.unit_id
        } else {
            None
        }
    }

    /// 当前租用的线程
    pub fn leased_unit(&self) -> Option<usize> {
        self.unit_leased.then_some(self.unit_id).flatten()
    }

    /// 开始上传，返回取消令牌
    pub fn begin_upload(&mut self) -> CancellationToken {
        debug_assert!(!self.unit_leased, "切片与上传不能同时进行");
        let token = CancellationToken::new();
        self.cancel_token = Some(token.clone());
        token
    }

    /// 上传结束（完成/失败/暂停）
    pub fn end_upload(&mut self) {
        self.cancel_token = None;
    }

    /// 中止在途的上传请求
    pub fn abort_upload(&mut self) -> bool {
        match self.cancel_token.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 写入切片结果，上传游标归零
    pub fn apply_chunked(&mut self, file: ChunkedFile) {
        self.content_fingerprint = file.content_md5;
        self.total_chunks = file.total;
        self.chunks = file.chunks;
        self.chunk_size = file.chunk_size;
        self.chunk_cursor = file.total;
        self.chunked_at = Some(file.chunked_at);
        self.upload_cursor = file.upload_cursor;
        // 切片完成后不再需要驻留线程
        self.unit_id = None;
    }

    /// 不可变快照
    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.size,
            extension: self.extension.clone(),
            quick_fingerprint: self.quick_fingerprint.clone(),
            content_fingerprint: self.content_fingerprint.clone(),
            status: self.status,
            progress: self.progress,
            total_chunks: self.total_chunks,
            chunk_cursor: self.chunk_cursor,
            upload_cursor: self.upload_cursor,
            chunk_size: self.chunk_size,
            created_at: self.created_at,
            chunked_at: self.chunked_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// 文件任务快照（推送给展示层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub extension: String,
    pub quick_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<String>,
    pub status: FileStatus,
    pub progress: u8,
    pub total_chunks: usize,
    pub chunk_cursor: usize,
    pub upload_cursor: usize,
    pub chunk_size: u64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunked_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::testing::TestFile;
    use std::sync::Arc;

    #[test]
    fn test_task_creation() {
        let source = Arc::new(TestFile::with_pattern("photo.jpg", 1024));
        let mut task = FileTask::new("task-1".to_string(), source);

        assert_eq!(task.status, FileStatus::CutPending);
        assert_eq!(task.extension, "jpg");
        assert_eq!(task.size, 1024);
        assert_eq!(task.quick_fingerprint.len(), 32);
        assert!(task.leased_unit().is_none());
        assert!(!task.abort_upload());
    }

    #[test]
    fn test_unit_lease_tracking() {
        let source = Arc::new(TestFile::with_pattern("a.bin", 10));
        let mut task = FileTask::new("t".to_string(), source);

        task.attach_unit(3);
        assert_eq!(task.leased_unit(), Some(3));
        assert_eq!(task.detach_unit(), Some(3));
        assert_eq!(task.detach_unit(), None);

        // 暂停后线程已归还，但驻留线程仍被记住
        assert_eq!(task.unit_id, Some(3));
        assert!(task.leased_unit().is_none());
    }

    #[test]
    fn test_upload_token() {
        let source = Arc::new(TestFile::with_pattern("a.bin", 10));
        let mut task = FileTask::new("t".to_string(), source);

        let token = task.begin_upload();
        assert!(!token.is_cancelled());
        assert!(task.abort_upload());
        assert!(token.is_cancelled());
        assert!(!task.abort_upload());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&FileStatus::UploadPause).unwrap();
        assert_eq!(json, "\"UPLOAD_PAUSE\"");
        assert_eq!(FileStatus::CutPending.to_string(), "CUT_PENDING");
        assert!(FileStatus::Merging.is_uploading());
        assert!(FileStatus::Complete.is_settled());
        assert!(!FileStatus::Cutting.is_settled());
    }
}
