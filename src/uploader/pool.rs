//! 切片线程池
//!
//! 固定数量的切片线程，启动时全部创建。
//! - lease: 取一个空闲线程并标记为忙碌，全部忙碌时返回 None
//! - release: 归还线程，之后该线程可以被再次租用
//!
//! 线程池由协调器独占持有，所有操作都在协调器的事件循环内执行，因此不需要加锁。

use crate::uploader::chunk::ChunkingOptions;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::worker::{ChunkingUnit, UnitCommand, UnitEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 切片线程句柄（用于发送命令）
#[derive(Debug, Clone)]
pub struct UnitHandle {
    id: usize,
    sender: mpsc::UnboundedSender<UnitCommand>,
}

impl UnitHandle {
    /// 线程ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// 发送命令
    pub fn send(&self, command: UnitCommand) -> UploadResult<()> {
        debug!(
            "发送命令到切片线程 #{}: task={}",
            self.id,
            command.task_id()
        );
        self.sender
            .send(command)
            .map_err(|_| UploadError::UnitClosed(self.id))
    }
}

/// 线程槽位
#[derive(Debug)]
struct UnitSlot {
    handle: UnitHandle,
    /// 当前租用此线程的文件ID
    file_id: Option<String>,
}

impl UnitSlot {
    fn is_idle(&self) -> bool {
        self.file_id.is_none()
    }
}

/// 切片线程池
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<UnitSlot>,
}

impl WorkerPool {
    /// 创建线程池并启动全部切片线程
    ///
    /// 所有线程的事件都发送到同一个 `events` 通道，事件中带有线程ID。
    pub fn new(
        size: usize,
        options: ChunkingOptions,
        events: mpsc::UnboundedSender<UnitEvent>,
    ) -> Self {
        let slots = (0..size)
            .map(|id| UnitSlot {
                handle: UnitHandle {
                    id,
                    sender: ChunkingUnit::spawn(id, options, events.clone()),
                },
                file_id: None,
            })
            .collect();

        info!("切片线程池已创建: {} 个线程", size);
        Self { slots }
    }

    /// 用外部通道代替切片线程，测试中可直接观察或关闭命令通道
    #[cfg(test)]
    pub(crate) fn from_senders(senders: Vec<mpsc::UnboundedSender<UnitCommand>>) -> Self {
        let slots = senders
            .into_iter()
            .enumerate()
            .map(|(id, sender)| UnitSlot {
                handle: UnitHandle { id, sender },
                file_id: None,
            })
            .collect();
        Self { slots }
    }

    /// 线程总数
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// 空闲线程数
    pub fn idle_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_idle()).count()
    }

    /// 租用任意一个空闲线程
    pub fn lease(&mut self, file_id: &str) -> Option<UnitHandle> {
        let slot = self.slots.iter_mut().find(|s| s.is_idle())?;
        slot.file_id = Some(file_id.to_string());
        info!("租用切片线程 #{} -> 文件 {}", slot.handle.id, file_id);
        Some(slot.handle.clone())
    }

    /// 租用指定线程（该线程上保留着文件的暂停/失败任务）
    pub fn lease_unit(&mut self, unit_id: usize, file_id: &str) -> Option<UnitHandle> {
        let slot = self.slots.get_mut(unit_id)?;
        if !slot.is_idle() {
            debug!(
                "切片线程 #{} 正被 {:?} 占用，文件 {} 需等待",
                unit_id, slot.file_id, file_id
            );
            return None;
        }
        slot.file_id = Some(file_id.to_string());
        info!("租用指定切片线程 #{} -> 文件 {}", unit_id, file_id);
        Some(slot.handle.clone())
    }

    /// 归还线程
    pub fn release(&mut self, unit_id: usize) {
        match self.slots.get_mut(unit_id) {
            Some(slot) => match slot.file_id.take() {
                Some(file_id) => info!("归还切片线程 #{} (文件 {})", unit_id, file_id),
                None => debug!("切片线程 #{} 已是空闲状态", unit_id),
            },
            None => warn!("归还未知切片线程 #{}", unit_id),
        }
    }

    /// 不租用而直接获取线程句柄（用于取消驻留在线程上的非运行任务）
    pub fn handle(&self, unit_id: usize) -> Option<UnitHandle> {
        self.slots.get(unit_id).map(|s| s.handle.clone())
    }

    /// 当前租用线程的文件
    pub fn holder(&self, unit_id: usize) -> Option<&str> {
        self.slots.get(unit_id)?.file_id.as_deref()
    }
}
