//! 进度通知节流器
//!
//! 协调器对每个文件独立节流，只节流低优先级的进度通知，
//! 状态变更总是立即推送（并刷新该文件的节流时间）。

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 按文件的进度节流器
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: HashMap<String, Instant>,
}

impl ProgressThrottler {
    /// 创建新的节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: HashMap::new(),
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离该文件上次推送超过间隔时返回 true 并记录时间
    pub fn should_emit(&mut self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_emit.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_emit.insert(key.to_string(), now);
                true
            }
        }
    }

    /// 强制推送（状态变更时调用）
    pub fn force_emit(&mut self, key: &str) {
        self.last_emit.insert(key.to_string(), Instant::now());
    }

    /// 文件移除后清理
    pub fn forget(&mut self, key: &str) {
        self.last_emit.remove(key);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
