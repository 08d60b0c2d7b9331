//! 状态通知模块
//!
//! - `types.rs`: 状态更新和监听器定义
//! - `throttle.rs`: 按文件节流进度通知

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
