// 上传协调器
//
// 协调器是一个独立的 tokio 任务，独占文件注册表、切片线程池和租用队列。
// 外部通过 UploadCoordinator 句柄发送请求，切片线程和上传循环的事件
// 也都汇入同一个事件循环，因此文件状态只在一个地方被修改，不需要加锁。
//
// 文件生命周期：
//   CUT_PENDING → CUTTING → CUT_SUCCESS → UPLOADING → MERGING → COMPLETE
// 分支：CUT_PAUSE / CUT_CANCEL / CUT_ERROR / UPLOAD_PAUSE / UPLOAD_ERROR

use crate::config::UploadConfig;
use crate::events::{EventPriority, ProgressThrottler, StatusListener, StatusUpdate};
use crate::transport::UploadTransport;
use crate::uploader::engine::{UploadEngine, UploadEvent, UploadEventKind, UploadJob};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::identity::{generate_task_id, quick_fingerprint, TASK_ID_PREFIX};
use crate::uploader::pool::WorkerPool;
use crate::uploader::source::SharedSource;
use crate::uploader::task::{FileSnapshot, FileStatus, FileTask};
use crate::uploader::worker::{UnitCommand, UnitEvent, UnitEventKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 已加入上传列表
    Accepted(FileSnapshot),
    /// 快速指纹重复，未创建任务
    Duplicate { existing_id: String },
}

impl SubmitOutcome {
    /// 新任务ID（重复时为 None）
    pub fn file_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted(file) => Some(&file.id),
            SubmitOutcome::Duplicate { .. } => None,
        }
    }
}

/// 协调器请求
enum Request {
    Submit {
        source: SharedSource,
        allow_duplicate: bool,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Pause {
        id: String,
        reply: oneshot::Sender<UploadResult<()>>,
    },
    Retry {
        id: String,
        reply: oneshot::Sender<UploadResult<()>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<UploadResult<()>>,
    },
    Files {
        reply: oneshot::Sender<Vec<FileSnapshot>>,
    },
    File {
        id: String,
        reply: oneshot::Sender<Option<FileSnapshot>>,
    },
}

/// 等待切片线程的文件
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingLease {
    /// 新文件，租用任意空闲线程后发送 ADD
    Add(String),
    /// 暂停/失败的文件，必须租用驻留任务的线程后发送 RETRY
    Retry { file_id: String, unit_id: usize },
}

impl PendingLease {
    fn file_id(&self) -> &str {
        match self {
            PendingLease::Add(id) => id,
            PendingLease::Retry { file_id, .. } => file_id,
        }
    }
}

/// 上传协调器句柄
///
/// 可以克隆；所有句柄都被丢弃后协调器退出。
#[derive(Clone)]
pub struct UploadCoordinator {
    requests: mpsc::UnboundedSender<Request>,
}

impl UploadCoordinator {
    /// 创建协调器并启动切片线程池（必须在 tokio 运行时内调用）
    pub fn new(
        config: &UploadConfig,
        transport: Arc<dyn UploadTransport>,
        listener: Arc<dyn StatusListener>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        let pool = WorkerPool::new(config.max_workers, config.chunking_options(), unit_tx);
        let engine = UploadEngine::new(transport, config.max_retries, upload_tx);
        let actor = CoordinatorActor::new(config, pool, engine, listener);

        info!(
            "上传协调器已启动: 切片线程={}, 基础分片={}MB, 允许重复={}",
            config.max_workers, config.base_chunk_size_mb, config.allow_duplicates
        );
        tokio::spawn(actor.run(request_rx, unit_rx, upload_rx));

        Self {
            requests: request_tx,
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> UploadResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .map_err(|_| UploadError::CoordinatorClosed)?;
        rx.await.map_err(|_| UploadError::CoordinatorClosed)
    }

    /// 提交文件（快速指纹重复时按配置拒绝）
    pub async fn submit(&self, source: SharedSource) -> UploadResult<SubmitOutcome> {
        self.call(|reply| Request::Submit {
            source,
            allow_duplicate: false,
            reply,
        })
        .await
    }

    /// 提交文件并跳过重复检查
    pub async fn submit_with_override(&self, source: SharedSource) -> UploadResult<SubmitOutcome> {
        self.call(|reply| Request::Submit {
            source,
            allow_duplicate: true,
            reply,
        })
        .await
    }

    /// 批量提交，按顺序返回每个文件的结果
    pub async fn submit_many(
        &self,
        sources: Vec<SharedSource>,
    ) -> Vec<UploadResult<SubmitOutcome>> {
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            outcomes.push(self.submit(source).await);
        }
        outcomes
    }

    /// 暂停（切片中或上传中）
    pub async fn pause(&self, id: &str) -> UploadResult<()> {
        let id = id.to_string();
        self.call(|reply| Request::Pause { id, reply }).await?
    }

    /// 重试（从暂停或失败处继续）
    pub async fn retry(&self, id: &str) -> UploadResult<()> {
        let id = id.to_string();
        self.call(|reply| Request::Retry { id, reply }).await?
    }

    /// 取消并移除
    pub async fn remove(&self, id: &str) -> UploadResult<()> {
        let id = id.to_string();
        self.call(|reply| Request::Remove { id, reply }).await?
    }

    /// 全部文件快照（按提交顺序）
    pub async fn files(&self) -> UploadResult<Vec<FileSnapshot>> {
        self.call(|reply| Request::Files { reply }).await
    }

    /// 单个文件快照
    pub async fn file(&self, id: &str) -> UploadResult<Option<FileSnapshot>> {
        let id = id.to_string();
        self.call(|reply| Request::File { id, reply }).await
    }
}

struct CoordinatorActor {
    files: HashMap<String, FileTask>,
    /// 提交顺序
    order: Vec<String>,
    pool: WorkerPool,
    lease_queue: VecDeque<PendingLease>,
    engine: Arc<UploadEngine>,
    listener: Arc<dyn StatusListener>,
    throttler: ProgressThrottler,
    allow_duplicates: bool,
    /// 每个文件当前有效的上传批次
    upload_runs: HashMap<String, u64>,
    next_run: u64,
}

impl CoordinatorActor {
    fn new(
        config: &UploadConfig,
        pool: WorkerPool,
        engine: UploadEngine,
        listener: Arc<dyn StatusListener>,
    ) -> Self {
        Self {
            files: HashMap::new(),
            order: Vec::new(),
            pool,
            lease_queue: VecDeque::new(),
            engine: Arc::new(engine),
            listener,
            throttler: ProgressThrottler::new(config.progress_interval()),
            allow_duplicates: config.allow_duplicates,
            upload_runs: HashMap::new(),
            next_run: 0,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut unit_events: mpsc::UnboundedReceiver<UnitEvent>,
        mut upload_events: mpsc::UnboundedReceiver<UploadEvent>,
    ) {
        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                Some(event) = unit_events.recv() => self.handle_unit_event(event),
                Some(event) = upload_events.recv() => self.handle_upload_event(event),
            }
        }

        // 句柄全部丢弃：中止在途上传
        for task in self.files.values_mut() {
            task.abort_upload();
        }
        info!("上传协调器已退出");
    }

    // =====================================================
    // 状态通知
    // =====================================================

    fn snapshots(&self) -> Vec<FileSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.files.get(id))
            .map(FileTask::snapshot)
            .collect()
    }

    fn notify(&mut self, id: &str, message: impl Into<String>, priority: EventPriority) {
        let Some(task) = self.files.get(id) else {
            return;
        };

        if priority == EventPriority::Low {
            if !self.throttler.should_emit(id) {
                return;
            }
        } else {
            self.throttler.force_emit(id);
        }

        let update = StatusUpdate {
            file_id: id.to_string(),
            file: task.snapshot(),
            files: self.snapshots(),
            message: message.into(),
            priority,
        };
        self.listener.on_status_changed(update);
    }

    /// 从注册表删除并推送最后一次状态
    fn delete_file(&mut self, id: &str, message: &str) {
        let Some(task) = self.files.remove(id) else {
            return;
        };
        self.order.retain(|x| x != id);
        self.lease_queue.retain(|p| p.file_id() != id);
        self.upload_runs.remove(id);
        self.throttler.forget(id);

        info!("文件已移除: {} ({})", id, task.name);
        self.listener.on_status_changed(StatusUpdate {
            file_id: id.to_string(),
            file: task.snapshot(),
            files: self.snapshots(),
            message: message.to_string(),
            priority: EventPriority::High,
        });
    }

    // =====================================================
    // 外部请求
    // =====================================================

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Submit {
                source,
                allow_duplicate,
                reply,
            } => {
                let outcome = self.submit(source, allow_duplicate || self.allow_duplicates);
                let _ = reply.send(outcome);
            }
            Request::Pause { id, reply } => {
                let _ = reply.send(self.pause(&id));
            }
            Request::Retry { id, reply } => {
                let _ = reply.send(self.retry(&id));
            }
            Request::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id));
            }
            Request::Files { reply } => {
                let _ = reply.send(self.snapshots());
            }
            Request::File { id, reply } => {
                let _ = reply.send(self.files.get(&id).map(FileTask::snapshot));
            }
        }
    }

    fn submit(&mut self, source: SharedSource, allow_duplicate: bool) -> SubmitOutcome {
        let fingerprint = quick_fingerprint(source.name(), source.size(), source.modified_at());

        if !allow_duplicate {
            if let Some(existing) = self
                .files
                .values()
                .find(|t| t.quick_fingerprint == fingerprint)
            {
                let error = UploadError::DuplicateSubmission {
                    existing_id: existing.id.clone(),
                };
                warn!("忽略提交 {}: {}", source.name(), error);
                return SubmitOutcome::Duplicate {
                    existing_id: existing.id.clone(),
                };
            }
        }

        let id = generate_task_id(Some(TASK_ID_PREFIX));
        let task = FileTask::new(id.clone(), source);
        info!(
            "提交文件: id={}, name={}, size={}, simpleMD5={}",
            id, task.name, task.size, task.quick_fingerprint
        );

        // 返回登记时的快照，之后的状态变化通过监听器推送
        let snapshot = task.snapshot();
        self.files.insert(id.clone(), task);
        self.order.push(id.clone());
        self.notify(&id, "等待切片", EventPriority::Medium);

        self.lease_queue.push_back(PendingLease::Add(id));
        self.drain_lease_queue();

        SubmitOutcome::Accepted(snapshot)
    }

    fn pause(&mut self, id: &str) -> UploadResult<()> {
        let task = self
            .files
            .get_mut(id)
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))?;

        match task.status {
            FileStatus::Uploading | FileStatus::Merging | FileStatus::CutSuccess => {
                task.abort_upload();
                task.status = FileStatus::UploadPause;
                info!("暂停上传: {} (游标={})", id, task.upload_cursor);
                self.notify(id, "上传已暂停", EventPriority::Medium);
            }
            FileStatus::Cutting => {
                match task.leased_unit().and_then(|u| self.pool.handle(u)) {
                    Some(unit) => {
                        if let Err(e) = unit.send(UnitCommand::Pause { id: id.to_string() }) {
                            self.unit_send_failed(id, &e);
                            return Err(e);
                        }
                    }
                    None => warn!("文件 {} 切片中但没有租用线程", id),
                }
                if let Some(task) = self.files.get_mut(id) {
                    task.status = FileStatus::CutPause;
                }
                self.notify(id, "正在暂停切片", EventPriority::Medium);
            }
            FileStatus::CutPending => {
                self.lease_queue.retain(|p| p.file_id() != id);
                task.status = FileStatus::CutPause;
                info!("暂停等待中的文件: {}", id);
                self.notify(id, "切片已暂停", EventPriority::Medium);
            }
            FileStatus::CutPause | FileStatus::CutError => {
                // 撤销排队中的重试
                self.lease_queue.retain(|p| p.file_id() != id);
            }
            status => {
                return Err(UploadError::InvalidState {
                    id: id.to_string(),
                    status: status.to_string(),
                })
            }
        }
        Ok(())
    }

    fn retry(&mut self, id: &str) -> UploadResult<()> {
        let task = self
            .files
            .get_mut(id)
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))?;

        match task.status {
            FileStatus::CutPause | FileStatus::CutError => {
                if self.lease_queue.iter().any(|p| p.file_id() == id) {
                    debug!("文件 {} 已在等待切片线程", id);
                    return Ok(());
                }

                task.error = None;
                let pending = match task.unit_id {
                    Some(unit_id) => PendingLease::Retry {
                        file_id: id.to_string(),
                        unit_id,
                    },
                    // 从未开始切片
                    None => {
                        task.status = FileStatus::CutPending;
                        PendingLease::Add(id.to_string())
                    }
                };
                info!("重试切片: {} ({:?})", id, pending);
                self.lease_queue.push_back(pending);
                self.drain_lease_queue();
            }
            FileStatus::UploadPause | FileStatus::UploadError => {
                task.error = None;
                info!("重试上传: {} (从分片 {} 继续)", id, task.upload_cursor);
                self.start_upload(id);
            }
            status => {
                return Err(UploadError::InvalidState {
                    id: id.to_string(),
                    status: status.to_string(),
                })
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> UploadResult<()> {
        let task = self
            .files
            .get_mut(id)
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))?;

        match task.status {
            FileStatus::Cutting => {
                let Some(unit) = task.leased_unit().and_then(|u| self.pool.handle(u)) else {
                    self.delete_file(id, "任务文件移除成功");
                    return Ok(());
                };
                if let Err(e) = unit.send(UnitCommand::Cancel { id: id.to_string() }) {
                    self.unit_send_failed(id, &e);
                    return Err(e);
                }
                if let Some(task) = self.files.get_mut(id) {
                    task.status = FileStatus::CutCancel;
                }
                self.notify(id, "正在取消切片", EventPriority::Medium);
            }
            FileStatus::CutPause | FileStatus::CutError => {
                self.lease_queue.retain(|p| p.file_id() != id);
                // 驻留在线程上的非运行任务：直接发送 CANCEL，不需要租用
                let sent = match task.unit_id.and_then(|u| self.pool.handle(u)) {
                    Some(unit) => match unit.send(UnitCommand::Cancel { id: id.to_string() }) {
                        Ok(()) => true,
                        Err(e) => {
                            // 线程已退出，驻留的任务随之消失
                            warn!("文件 {} 的切片线程不可用，直接移除: {}", id, e);
                            false
                        }
                    },
                    None => false,
                };
                if sent {
                    task.status = FileStatus::CutCancel;
                    self.notify(id, "正在取消切片", EventPriority::Medium);
                } else {
                    self.delete_file(id, "任务文件移除成功");
                }
            }
            FileStatus::CutCancel => {
                debug!("文件 {} 正在取消", id);
            }
            _ => {
                // 上传中：中止请求后立即删除；其余状态没有关联的切片任务
                if task.abort_upload() {
                    info!("中止上传并移除: {}", id);
                }
                self.delete_file(id, "任务文件移除成功");
            }
        }
        Ok(())
    }

    // =====================================================
    // 线程租用
    // =====================================================

    /// 为排队的文件租用线程，线程每次被归还后调用
    fn drain_lease_queue(&mut self) {
        let mut waiting = VecDeque::new();

        while let Some(pending) = self.lease_queue.pop_front() {
            let file_id = pending.file_id().to_string();
            let Some(task) = self.files.get(&file_id) else {
                continue;
            };

            let (unit, command) = match &pending {
                PendingLease::Add(_) => {
                    if task.status != FileStatus::CutPending {
                        continue;
                    }
                    let unit = self.pool.lease(&file_id);
                    let command = UnitCommand::Add {
                        id: file_id.clone(),
                        source: task.source.clone(),
                    };
                    (unit, command)
                }
                PendingLease::Retry { unit_id, .. } => {
                    if !matches!(task.status, FileStatus::CutPause | FileStatus::CutError) {
                        continue;
                    }
                    let unit = self.pool.lease_unit(*unit_id, &file_id);
                    (unit, UnitCommand::Retry { id: file_id.clone() })
                }
            };

            let Some(unit) = unit else {
                waiting.push_back(pending);
                continue;
            };

            let unit_id = unit.id();
            if let Some(task) = self.files.get_mut(&file_id) {
                task.attach_unit(unit_id);
                task.status = FileStatus::Cutting;
            }

            match unit.send(command) {
                Ok(()) => self.notify(&file_id, "正在计算MD5与切片", EventPriority::Medium),
                Err(e) => {
                    error!("派发切片任务失败: {}, 错误: {}", file_id, e);
                    self.pool.release(unit_id);
                    if let Some(task) = self.files.get_mut(&file_id) {
                        task.detach_unit();
                        task.status = FileStatus::CutError;
                        task.error = Some(e.to_string());
                    }
                    self.notify(&file_id, format!("切片失败: {}", e), EventPriority::High);
                }
            }
        }

        if !waiting.is_empty() {
            debug!(
                "{} 个文件等待切片线程 (空闲线程 {}/{})",
                waiting.len(),
                self.pool.idle_count(),
                self.pool.size()
            );
        }
        self.lease_queue = waiting;
    }

    /// 归还文件租用的线程
    fn release_unit(&mut self, file_id: &str) -> bool {
        let unit_id = self.files.get_mut(file_id).and_then(FileTask::detach_unit);
        match unit_id {
            Some(unit_id) => {
                self.pool.release(unit_id);
                true
            }
            None => false,
        }
    }

    // =====================================================
    // 切片线程事件
    // =====================================================

    fn handle_unit_event(&mut self, event: UnitEvent) {
        let UnitEvent {
            unit_id,
            task_id: id,
            kind,
        } = event;

        if !self.files.contains_key(&id) {
            // 文件已被移除：只需要确保线程被归还
            if !matches!(kind, UnitEventKind::Progress { .. })
                && self.pool.holder(unit_id) == Some(id.as_str())
            {
                self.pool.release(unit_id);
                self.drain_lease_queue();
            }
            debug!("忽略已移除文件的切片事件: {} ({:?})", id, kind);
            return;
        }

        match kind {
            UnitEventKind::Progress {
                percent,
                chunk_cursor,
            } => {
                let Some(task) = self.files.get_mut(&id) else {
                    return;
                };
                task.chunk_cursor = chunk_cursor;
                if task.status == FileStatus::Cutting {
                    task.progress = percent;
                    self.notify(&id, "正在计算MD5与切片", EventPriority::Low);
                }
            }

            UnitEventKind::Success(file) => {
                self.release_unit(&id);
                let Some(task) = self.files.get_mut(&id) else {
                    return;
                };
                task.apply_chunked(*file);
                info!(
                    "文件 {} 切片完成: 分片数={}, md5={:?}",
                    id, task.total_chunks, task.content_fingerprint
                );

                match task.status {
                    FileStatus::CutCancel => self.delete_file(&id, "任务文件移除成功"),
                    FileStatus::CutPause => {
                        // 暂停请求到达前切片已完成
                        task.status = FileStatus::UploadPause;
                        task.progress = 0;
                        self.notify(&id, "切片完成，上传已暂停", EventPriority::Medium);
                    }
                    _ => {
                        task.status = FileStatus::CutSuccess;
                        task.progress = 0;
                        self.notify(&id, "切片完成", EventPriority::Medium);
                        self.start_upload(&id);
                    }
                }
                self.drain_lease_queue();
            }

            UnitEventKind::PauseAck => {
                self.release_unit(&id);
                let Some(task) = self.files.get_mut(&id) else {
                    return;
                };
                if matches!(task.status, FileStatus::Cutting | FileStatus::CutPause) {
                    task.status = FileStatus::CutPause;
                    info!("文件 {} 切片已暂停 (游标={})", id, task.chunk_cursor);
                    self.notify(&id, "切片已暂停", EventPriority::Medium);
                }
                self.drain_lease_queue();
            }

            UnitEventKind::CancelAck => {
                self.release_unit(&id);
                self.delete_file(&id, "任务文件移除成功");
                self.drain_lease_queue();
            }

            UnitEventKind::Error(message) => {
                self.release_unit(&id);
                let Some(task) = self.files.get_mut(&id) else {
                    return;
                };
                match task.status {
                    // 线程上已没有该任务
                    FileStatus::CutCancel => self.delete_file(&id, "任务文件移除成功"),
                    FileStatus::Cutting | FileStatus::CutPause => {
                        let error = UploadError::ChunkRead(message);
                        error!("文件 {} 切片失败: {}", id, error);
                        task.status = FileStatus::CutError;
                        task.error = Some(error.to_string());
                        self.notify(&id, format!("切片失败: {}", error), EventPriority::High);
                    }
                    // 切片已完成后才到达的暂停/取消回复
                    status => debug!("忽略文件 {} 的切片错误 (状态 {}): {}", id, status, message),
                }
                self.drain_lease_queue();
            }

            UnitEventKind::NotFound => {
                // 线程上的任务已丢失，重新切片
                self.release_unit(&id);
                if let Some(task) = self.files.get_mut(&id) {
                    warn!("切片线程 #{} 上没有文件 {} 的任务，重新切片", unit_id, id);
                    task.unit_id = None;
                    task.chunk_cursor = 0;
                    task.status = FileStatus::CutPending;
                    self.lease_queue.push_back(PendingLease::Add(id.clone()));
                }
                self.notify(&id, "等待切片", EventPriority::Medium);
                self.drain_lease_queue();
            }

            UnitEventKind::AlreadyExists => {
                let error = UploadError::TaskAlreadyExists(id.clone());
                self.unit_rejected(&id, unit_id, error);
            }

            UnitEventKind::Busy => {
                let error = UploadError::UnitBusy(id.clone());
                self.unit_rejected(&id, unit_id, error);
            }
        }
    }

    /// 切片线程拒绝了命令：归还线程，文件进入 CUT_ERROR 等待用户重试
    fn unit_rejected(&mut self, id: &str, unit_id: usize, error: UploadError) {
        self.release_unit(id);
        warn!("切片线程 #{} 拒绝文件 {}: {}", unit_id, id, error);
        if let Some(task) = self.files.get_mut(id) {
            task.status = FileStatus::CutError;
            task.error = Some(error.to_string());
        }
        self.notify(id, error.to_string(), EventPriority::High);
        self.drain_lease_queue();
    }

    /// 向租用的线程发送命令失败：归还线程，文件进入 CUT_ERROR
    fn unit_send_failed(&mut self, id: &str, error: &UploadError) {
        self.release_unit(id);
        error!("文件 {} 的切片线程不可用: {}", id, error);
        if let Some(task) = self.files.get_mut(id) {
            task.status = FileStatus::CutError;
            task.error = Some(error.to_string());
        }
        self.notify(id, format!("切片失败: {}", error), EventPriority::High);
        self.drain_lease_queue();
    }

    // =====================================================
    // 上传循环
    // =====================================================

    fn start_upload(&mut self, id: &str) {
        self.next_run += 1;
        let run = self.next_run;

        let Some(task) = self.files.get_mut(id) else {
            return;
        };

        let token = task.begin_upload();
        task.status = FileStatus::Uploading;
        task.progress = percent_of(task.upload_cursor, task.total_chunks);

        let job = UploadJob {
            file_id: id.to_string(),
            run,
            source: task.source.clone(),
            chunks: task.chunks.clone(),
            cursor: task.upload_cursor,
            content_md5: task.content_fingerprint.clone(),
            simple_md5: task.quick_fingerprint.clone(),
            extension: task.extension.clone(),
        };
        self.upload_runs.insert(id.to_string(), run);

        info!(
            "开始上传: {} (分片 {}/{}, run={})",
            id, job.cursor, task.total_chunks, run
        );
        self.notify(id, "正在上传", EventPriority::Medium);

        let engine = self.engine.clone();
        tokio::spawn(async move { engine.run(job, token).await });
    }

    fn handle_upload_event(&mut self, event: UploadEvent) {
        let UploadEvent { file_id: id, run, kind } = event;

        if self.upload_runs.get(&id) != Some(&run) {
            debug!("忽略过期的上传事件: {} run={} ({:?})", id, run, kind);
            return;
        }
        let Some(task) = self.files.get_mut(&id) else {
            return;
        };

        match kind {
            UploadEventKind::Started { cursor } => {
                if cursor != task.upload_cursor {
                    task.upload_cursor = cursor;
                    task.progress = percent_of(cursor, task.total_chunks);
                    self.notify(&id, format!("从分片 {} 续传", cursor), EventPriority::Medium);
                }
            }
            UploadEventKind::Progress { progress, merging } => {
                if !task.status.is_uploading() {
                    return;
                }
                if merging && task.status == FileStatus::Uploading {
                    task.status = FileStatus::Merging;
                    task.progress = progress;
                    self.notify(&id, "正在合并", EventPriority::Medium);
                } else if task.status == FileStatus::Uploading {
                    task.progress = progress;
                    self.notify(&id, "正在上传", EventPriority::Low);
                }
            }
            UploadEventKind::ChunkDone { next } => {
                task.upload_cursor = next;
                if task.status == FileStatus::Uploading {
                    task.progress = percent_of(next, task.total_chunks);
                    self.notify(&id, "正在上传", EventPriority::Low);
                }
            }
            UploadEventKind::Complete => {
                task.end_upload();
                task.status = FileStatus::Complete;
                task.progress = 100;
                task.upload_cursor = task.total_chunks;
                task.completed_at = Some(chrono::Utc::now().timestamp_millis());
                self.upload_runs.remove(&id);
                info!("文件上传完成: {} ({})", id, task.name);
                self.notify(&id, "上传完成", EventPriority::High);
            }
            UploadEventKind::Failed { cursor, error } => {
                task.end_upload();
                task.upload_cursor = cursor;
                task.status = FileStatus::UploadError;
                task.error = Some(error.to_string());
                self.upload_runs.remove(&id);
                self.notify(&id, format!("上传失败: {}", error), EventPriority::High);
            }
            UploadEventKind::Aborted { cursor } => {
                task.end_upload();
                task.upload_cursor = cursor;
                if task.status.is_uploading() {
                    task.status = FileStatus::UploadPause;
                }
                self.upload_runs.remove(&id);
                debug!("文件 {} 上传已中止 (游标={})", id, cursor);
            }
        }
    }
}

fn percent_of(cursor: usize, total: usize) -> u8 {
    if total == 0 {
        0
    } else {
        (cursor * 100 / total).min(100) as u8
    }
}
