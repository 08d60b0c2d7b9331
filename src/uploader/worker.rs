// 切片线程
//
// 每个切片线程是一个独立的 tokio 任务（消息驱动的 actor）：
// - 维护自己的任务列表和当前任务指针，同一时刻最多执行一个任务
// - 接收命令 ADD / PAUSE / CANCEL / RETRY
// - 发出事件 PROGRESS / SUCCESS / PAUSE_ACK / CANCEL_ACK / ERROR / ALREADY_EXISTS / NOT_FOUND / BUSY
//
// 暂停与取消是协作式的：执行循环在每个分片边界检查取消令牌，
// 最坏延迟为一个分片的读取时间。暂停保留任务和已完成的分片，
// 重试时从上次的分片游标继续，而不是从 0 开始。

use crate::uploader::chunk::{Chunk, ChunkPlan, ChunkingOptions};
use crate::uploader::identity::file_extension;
use crate::uploader::source::SharedSource;
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 发送给切片线程的命令
#[derive(Debug, Clone)]
pub enum UnitCommand {
    /// 新增任务
    Add { id: String, source: SharedSource },
    /// 暂停任务
    Pause { id: String },
    /// 取消任务
    Cancel { id: String },
    /// 重试（恢复）任务
    Retry { id: String },
}

impl UnitCommand {
    /// 命令对应的任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            UnitCommand::Add { id, .. }
            | UnitCommand::Pause { id }
            | UnitCommand::Cancel { id }
            | UnitCommand::Retry { id } => id,
        }
    }
}

/// 切片完成后的文件描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedFile {
    /// 任务ID
    pub id: String,
    /// 文件名
    pub name: String,
    /// 后缀
    pub extension: String,
    /// 文件大小
    pub size: u64,
    /// 完整内容 MD5（未启用时为 None）
    pub content_md5: Option<String>,
    /// 分片列表
    pub chunks: Vec<Chunk>,
    /// 分片总数
    pub total: usize,
    /// 分片大小
    pub chunk_size: u64,
    /// 上传游标（切片完成时总是 0）
    pub upload_cursor: usize,
    /// 切片完成时间（Unix 毫秒）
    pub chunked_at: i64,
}

/// 切片线程发出的事件
#[derive(Debug, Clone)]
pub struct UnitEvent {
    /// 切片线程ID
    pub unit_id: usize,
    /// 任务ID
    pub task_id: String,
    /// 事件内容
    pub kind: UnitEventKind,
}

/// 事件类型
#[derive(Debug, Clone)]
pub enum UnitEventKind {
    /// 切片进度
    Progress {
        /// 0-100
        percent: u8,
        /// 已完成的分片数（切片游标）
        chunk_cursor: usize,
    },
    /// 切片完成
    Success(Box<ChunkedFile>),
    /// 错误（任务不存在或读取失败）
    Error(String),
    /// 已暂停
    PauseAck,
    /// 已取消并移除
    CancelAck,
    /// 任务已存在
    AlreadyExists,
    /// 任务不存在
    NotFound,
    /// 线程繁忙
    Busy,
}

/// 切片任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Paused,
    Cancelled,
    Error,
}

/// 已完成的切片进度（可在暂停后恢复）
struct ChunkProgress {
    chunks: Vec<Chunk>,
    cursor: usize,
    hasher: Option<Md5Context>,
}

impl ChunkProgress {
    fn new(compute_md5: bool) -> Self {
        Self {
            chunks: Vec::new(),
            cursor: 0,
            hasher: compute_md5.then(Md5Context::new),
        }
    }
}

/// 切片任务
struct ChunkTask {
    id: String,
    source: SharedSource,
    plan: ChunkPlan,
    run_state: RunState,
    /// 执行期间为 None（进度被移入执行循环）
    progress: Option<ChunkProgress>,
}

/// 执行循环的结束原因
enum ExecutionOutcome {
    Completed(ChunkProgress),
    Stopped(ChunkProgress),
    Failed(ChunkProgress, String),
}

/// 正在执行的任务
struct RunningTask {
    id: String,
    token: CancellationToken,
}

/// 切片线程
pub struct ChunkingUnit {
    id: usize,
    options: ChunkingOptions,
    tasks: Vec<ChunkTask>,
    current: Option<RunningTask>,
    events: mpsc::UnboundedSender<UnitEvent>,
    outcome_tx: mpsc::UnboundedSender<(String, ExecutionOutcome)>,
}

impl ChunkingUnit {
    /// 启动切片线程，返回命令发送端
    pub fn spawn(
        id: usize,
        options: ChunkingOptions,
        events: mpsc::UnboundedSender<UnitEvent>,
    ) -> mpsc::UnboundedSender<UnitCommand> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let unit = Self {
            id,
            options,
            tasks: Vec::new(),
            current: None,
            events,
            outcome_tx,
        };

        tokio::spawn(unit.run(cmd_rx, outcome_rx));
        cmd_tx
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UnitCommand>,
        mut outcomes: mpsc::UnboundedReceiver<(String, ExecutionOutcome)>,
    ) {
        debug!("切片线程 #{} 已启动", self.id);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some((task_id, outcome)) = outcomes.recv() => {
                    self.handle_outcome(task_id, outcome);
                }
            }
        }

        if let Some(running) = self.current.take() {
            running.token.cancel();
        }
        debug!("切片线程 #{} 已退出", self.id);
    }

    fn emit(&self, task_id: &str, kind: UnitEventKind) {
        let event = UnitEvent {
            unit_id: self.id,
            task_id: task_id.to_string(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("切片线程 #{} 事件接收端已关闭: task={}", self.id, task_id);
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    fn is_running(&self, id: &str) -> bool {
        self.current.as_ref().is_some_and(|r| r.id == id)
    }

    fn handle_command(&mut self, cmd: UnitCommand) {
        match cmd {
            UnitCommand::Add { id, source } => {
                if self.position(&id).is_some() {
                    warn!("切片线程 #{} 任务已存在: {}", self.id, id);
                    return self.emit(&id, UnitEventKind::AlreadyExists);
                }

                let plan = ChunkPlan::new(source.size(), &self.options);
                info!(
                    "切片线程 #{} 新增任务: id={}, file={}, size={}, chunks={}",
                    self.id,
                    id,
                    source.name(),
                    source.size(),
                    plan.chunk_count
                );
                self.tasks.push(ChunkTask {
                    id,
                    source,
                    plan,
                    run_state: RunState::Pending,
                    progress: Some(ChunkProgress::new(self.options.compute_content_md5)),
                });

                // 用户暂停的任务只能由用户重试，空闲时只取 PENDING 任务
                if self.current.is_none() {
                    self.promote_next();
                }
            }

            UnitCommand::Pause { id } => {
                let Some(idx) = self.position(&id) else {
                    return self.emit(&id, UnitEventKind::Error("任务不存在".to_string()));
                };

                let running = self.is_running(&id);
                let task = &mut self.tasks[idx];
                if task.run_state == RunState::Cancelled {
                    debug!("任务 {} 正在取消，忽略暂停", id);
                    return;
                }
                task.run_state = RunState::Paused;

                if running {
                    // 执行循环在下一个分片边界退出并回复 PAUSE_ACK
                    if let Some(r) = &self.current {
                        r.token.cancel();
                    }
                    info!("切片线程 #{} 请求暂停运行中的任务: {}", self.id, id);
                } else {
                    info!("切片线程 #{} 暂停任务: {}", self.id, id);
                    self.emit(&id, UnitEventKind::PauseAck);
                }
            }

            UnitCommand::Cancel { id } => {
                let Some(idx) = self.position(&id) else {
                    return self.emit(&id, UnitEventKind::Error("任务不存在".to_string()));
                };

                if self.is_running(&id) {
                    self.tasks[idx].run_state = RunState::Cancelled;
                    if let Some(r) = &self.current {
                        r.token.cancel();
                    }
                    info!("切片线程 #{} 请求取消运行中的任务: {}", self.id, id);
                } else {
                    self.tasks.remove(idx);
                    info!("切片线程 #{} 已移除任务: {}", self.id, id);
                    self.emit(&id, UnitEventKind::CancelAck);
                }
            }

            UnitCommand::Retry { id } => {
                let Some(idx) = self.position(&id) else {
                    return self.emit(&id, UnitEventKind::NotFound);
                };

                if self.current.is_some() {
                    warn!("切片线程 #{} 正在执行其他任务，拒绝重试: {}", self.id, id);
                    return self.emit(&id, UnitEventKind::Busy);
                }

                info!(
                    "切片线程 #{} 重试任务: {} (从分片 {} 继续)",
                    self.id,
                    id,
                    self.tasks[idx].progress.as_ref().map_or(0, |p| p.cursor)
                );
                self.start(idx);
            }
        }
    }

    /// 取第一个 PENDING 任务执行
    fn promote_next(&mut self) {
        if let Some(idx) = self
            .tasks
            .iter()
            .position(|t| t.run_state == RunState::Pending)
        {
            self.start(idx);
        }
    }

    fn start(&mut self, idx: usize) {
        let compute_md5 = self.options.compute_content_md5;
        let task = &mut self.tasks[idx];
        task.run_state = RunState::Running;

        let progress = task
            .progress
            .take()
            .unwrap_or_else(|| ChunkProgress::new(compute_md5));
        let token = CancellationToken::new();

        let id = task.id.clone();
        let source = task.source.clone();
        let plan = task.plan;
        let events = self.events.clone();
        let outcome_tx = self.outcome_tx.clone();
        let unit_id = self.id;
        let child_token = token.clone();

        tokio::spawn(async move {
            let outcome =
                execute(unit_id, &id, source, plan, progress, child_token, events).await;
            let _ = outcome_tx.send((id, outcome));
        });

        self.current = Some(RunningTask {
            id: self.tasks[idx].id.clone(),
            token,
        });
    }

    fn handle_outcome(&mut self, task_id: String, outcome: ExecutionOutcome) {
        if self.is_running(&task_id) {
            self.current = None;
        }

        let Some(idx) = self.position(&task_id) else {
            error!("切片线程 #{} 收到未知任务的执行结果: {}", self.id, task_id);
            self.promote_next_if_idle();
            return;
        };

        let cancelled = self.tasks[idx].run_state == RunState::Cancelled;
        match outcome {
            _ if cancelled => {
                self.tasks.remove(idx);
                info!("切片线程 #{} 任务已取消: {}", self.id, task_id);
                self.emit(&task_id, UnitEventKind::CancelAck);
            }
            ExecutionOutcome::Stopped(progress) => {
                let task = &mut self.tasks[idx];
                task.run_state = RunState::Paused;
                info!(
                    "切片线程 #{} 任务已暂停: {} (游标={})",
                    self.id, task_id, progress.cursor
                );
                task.progress = Some(progress);
                self.emit(&task_id, UnitEventKind::PauseAck);
            }
            ExecutionOutcome::Failed(progress, message) => {
                let task = &mut self.tasks[idx];
                task.run_state = RunState::Error;
                task.progress = Some(progress);
                error!("切片线程 #{} 任务失败: {}, 错误: {}", self.id, task_id, message);
                self.emit(&task_id, UnitEventKind::Error(message));
            }
            ExecutionOutcome::Completed(progress) => {
                let task = self.tasks.remove(idx);
                let name = task.source.name().to_string();
                let file = ChunkedFile {
                    id: task.id,
                    extension: file_extension(&name),
                    name,
                    size: task.plan.file_size,
                    content_md5: progress.hasher.map(|h| format!("{:x}", h.compute())),
                    total: progress.chunks.len(),
                    chunks: progress.chunks,
                    chunk_size: task.plan.chunk_size,
                    upload_cursor: 0,
                    chunked_at: chrono::Utc::now().timestamp_millis(),
                };
                info!(
                    "切片线程 #{} 任务完成: {}, 分片数={}, md5={:?}",
                    self.id, task_id, file.total, file.content_md5
                );
                self.emit(&task_id, UnitEventKind::Success(Box::new(file)));
            }
        }

        self.promote_next_if_idle();
    }

    fn promote_next_if_idle(&mut self) {
        if self.current.is_none() {
            self.promote_next();
        }
    }
}

/// 切片并计算 MD5
async fn execute(
    unit_id: usize,
    task_id: &str,
    source: SharedSource,
    plan: ChunkPlan,
    mut progress: ChunkProgress,
    token: CancellationToken,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> ExecutionOutcome {
    while progress.cursor < plan.chunk_count {
        // 分片边界：检查暂停/取消
        if token.is_cancelled() {
            return ExecutionOutcome::Stopped(progress);
        }

        let chunk = plan.chunk(progress.cursor);
        match source.read_range(chunk.range.clone()).await {
            Ok(bytes) => {
                if let Some(hasher) = progress.hasher.as_mut() {
                    hasher.consume(&bytes);
                }

                let percent = (progress.cursor * 100 / plan.chunk_count) as u8;
                progress.chunks.push(chunk);
                progress.cursor += 1;

                let _ = events.send(UnitEvent {
                    unit_id,
                    task_id: task_id.to_string(),
                    kind: UnitEventKind::Progress {
                        percent,
                        chunk_cursor: progress.cursor,
                    },
                });
            }
            Err(e) => {
                warn!(
                    "切片线程 #{} 读取分片失败: task={}, index={}, 错误: {:#}",
                    unit_id, task_id, chunk.index, e
                );
                return ExecutionOutcome::Failed(progress, format!("读取分片失败: {:#}", e));
            }
        }
    }

    ExecutionOutcome::Completed(progress)
}
