// 上传错误分类
//
// - 重复提交 / 任务不存在 / 任务已存在 / 线程繁忙：本地拒绝，不影响其他文件
// - 分片读取失败：该文件进入 CUT_ERROR，需要用户手动重试
// - 网络错误 / 超时 / 服务端拒绝：该文件进入 UPLOAD_ERROR，重试时从已确认分片继续
// - 取消不是错误

use thiserror::Error;

/// 上传错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 快速指纹重复的文件已在列表中
    #[error("文件已存在于上传列表: {existing_id}")]
    DuplicateSubmission { existing_id: String },

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 任务已存在
    #[error("任务已存在: {0}")]
    TaskAlreadyExists(String),

    /// 切片线程正在执行其他任务
    #[error("切片线程繁忙，任务 {0} 需等待")]
    UnitBusy(String),

    /// 切片线程已退出
    #[error("切片线程 #{0} 已退出")]
    UnitClosed(usize),

    /// 读取分片数据失败
    #[error("读取分片失败: {0}")]
    ChunkRead(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// 请求超时
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 服务端返回了无法识别的响应码
    #[error("服务端拒绝: code={code}, msg={message}")]
    Rejected { code: String, message: String },

    /// 当前状态不支持该操作
    #[error("任务 {id} 当前状态 {status} 不支持该操作")]
    InvalidState { id: String, status: String },

    /// 请求被取消
    #[error("请求已取消")]
    Cancelled,

    /// 协调器已关闭
    #[error("上传协调器已关闭")]
    CoordinatorClosed,
}

impl UploadError {
    /// 是否可以在单个分片请求内自动重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::Network(_))
    }

    /// 是否为取消（取消不计入失败）
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

/// 上传结果类型
pub type UploadResult<T> = std::result::Result<T, UploadError>;
