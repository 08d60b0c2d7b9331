//! 状态更新定义
//!
//! 每次状态变化推送 `(文件ID, 当前文件状态, 完整文件列表, 提示信息)` 给展示层

use crate::uploader::task::FileSnapshot;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// 低优先级：进度更新（可被节流）
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、删除等关键事件
    High = 2,
}

/// 状态更新
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// 发生变化的文件
    pub file_id: String,
    /// 该文件当前（或删除前最后）的状态
    pub file: FileSnapshot,
    /// 全部文件（按提交顺序）
    pub files: Vec<FileSnapshot>,
    /// 提示信息
    pub message: String,
    /// 优先级
    pub priority: EventPriority,
}

/// 状态监听器（展示层实现）
pub trait StatusListener: Send + Sync {
    fn on_status_changed(&self, update: StatusUpdate);
}

impl StatusListener for mpsc::UnboundedSender<StatusUpdate> {
    fn on_status_changed(&self, update: StatusUpdate) {
        if self.send(update).is_err() {
            debug!("状态接收端已关闭");
        }
    }
}

/// 只写日志的监听器
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl StatusListener for LoggingListener {
    fn on_status_changed(&self, update: StatusUpdate) {
        match update.priority {
            EventPriority::Low => debug!(
                "[{}] {} {}% {}",
                update.file.name, update.file.status, update.file.progress, update.message
            ),
            _ => info!(
                "[{}] {} {}% {}",
                update.file.name, update.file.status, update.file.progress, update.message
            ),
        }
    }
}
