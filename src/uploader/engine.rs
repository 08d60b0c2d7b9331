// 分片上传循环
//
// 每个文件一个上传循环，按索引升序、一次一个分片：
// 1. 查询服务端未完成分片，计算续传游标
// 2. 读取分片数据并上传，请求可被取消令牌中止（中止不推进游标）
// 3. SUCCESS 推进游标，COMPLETE（或最后一个分片的 SUCCESS）结束
// 4. 网络错误按指数退避重试，超过次数后交给协调器进入 UPLOAD_ERROR

use crate::transport::{
    ChunkUploadRequest, ChunkUploadResponse, ProgressCallback, ResponseCode, UploadTransport,
};
use crate::uploader::chunk::Chunk;
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::source::SharedSource;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试策略常量
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - ...
/// - 最大: 5000ms
fn calculate_backoff_delay(retry_count: u32) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    base_delay.min(MAX_BACKOFF_MS)
}

/// 计算上传进度
///
/// `已完成分片/总数*100 + floor(100 * (1/总数) * 当前分片已发送比例)`，
/// 超过 99 时进入合并阶段并把显示进度限制在 99。
///
/// 返回 `(进度, 是否进入合并阶段)`
pub fn upload_progress(cursor: usize, total: usize, loaded: u64, len: u64) -> (u8, bool) {
    if total == 0 {
        return (0, false);
    }
    let total_f = total as f64;
    let fraction = if len == 0 {
        1.0
    } else {
        (loaded as f64 / len as f64).min(1.0)
    };

    let completed = cursor as f64 / total_f * 100.0;
    let current = (100.0 * (1.0 / total_f) * fraction).floor();
    let progress = completed + current;

    if progress > 99.0 {
        (99, true)
    } else {
        (progress.floor() as u8, false)
    }
}

/// 服务端第一个缺失的分片索引
pub fn first_missing_index(indices: &[usize]) -> usize {
    let present: HashSet<usize> = indices.iter().copied().collect();
    (0..).find(|i| !present.contains(i)).unwrap_or(0)
}

/// 上传任务参数（从文件任务复制）
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub file_id: String,
    /// 上传批次（每次开始/重试上传递增，用于丢弃旧批次的事件）
    pub run: u64,
    pub source: SharedSource,
    pub chunks: Vec<Chunk>,
    pub cursor: usize,
    pub content_md5: Option<String>,
    pub simple_md5: String,
    pub extension: String,
}

/// 上传循环发给协调器的事件
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub file_id: String,
    pub run: u64,
    pub kind: UploadEventKind,
}

#[derive(Debug, Clone)]
pub enum UploadEventKind {
    /// 续传游标已确定
    Started { cursor: usize },
    /// 当前分片发送进度
    Progress { progress: u8, merging: bool },
    /// 分片已被服务端接收，游标前进到 `next`
    ChunkDone { next: usize },
    /// 服务端完成合并
    Complete,
    /// 上传失败，游标停留在 `cursor`
    Failed { cursor: usize, error: UploadError },
    /// 请求被取消令牌中止
    Aborted { cursor: usize },
}

/// 上传引擎
pub struct UploadEngine {
    transport: Arc<dyn UploadTransport>,
    max_retries: u32,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        max_retries: u32,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        Self {
            transport,
            max_retries,
            events,
        }
    }

    fn emit(&self, job: &UploadJob, kind: UploadEventKind) {
        let _ = self.events.send(UploadEvent {
            file_id: job.file_id.clone(),
            run: job.run,
            kind,
        });
    }

    /// 执行上传循环直到完成、失败或被中止
    pub async fn run(&self, job: UploadJob, token: CancellationToken) {
        let total = job.chunks.len();
        let mut cursor = job.cursor;

        // 1. 续传：跳过服务端已有的分片
        let listing = tokio::select! {
            _ = token.cancelled() => {
                return self.emit(&job, UploadEventKind::Aborted { cursor });
            }
            r = self.transport.list_unfinished() => r,
        };
        match listing {
            Ok(map) => {
                if let Some(indices) = map.get(&job.simple_md5) {
                    // 服务端已有全部分片时重发最后一个分片触发合并
                    let server_cursor = first_missing_index(indices).min(total.saturating_sub(1));
                    if server_cursor > cursor {
                        info!(
                            "文件 {} 服务端已有 {} 个分片，从分片 {} 续传",
                            job.file_id,
                            indices.len(),
                            server_cursor
                        );
                        cursor = server_cursor;
                    }
                }
            }
            Err(e) => warn!("查询未完成分片失败，从本地游标继续: {}", e),
        }
        self.emit(&job, UploadEventKind::Started { cursor });

        // 2. 逐个上传
        while cursor < total {
            let chunk = &job.chunks[cursor];

            let data = tokio::select! {
                _ = token.cancelled() => {
                    return self.emit(&job, UploadEventKind::Aborted { cursor });
                }
                r = job.source.read_range(chunk.range.clone()) => r,
            };
            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    let error = UploadError::ChunkRead(format!("{:#}", e));
                    error!("文件 {} 读取分片 #{} 失败: {}", job.file_id, cursor, error);
                    return self.emit(&job, UploadEventKind::Failed { cursor, error });
                }
            };

            let request = ChunkUploadRequest {
                data,
                index: chunk.index,
                total,
                md5: job.content_md5.clone().unwrap_or_default(),
                simple_md5: job.simple_md5.clone(),
                extension: job.extension.clone(),
            };

            let response = match self
                .upload_with_retry(&job, request, cursor, &token)
                .await
            {
                Ok(response) => response,
                Err(error) if error.is_cancelled() => {
                    info!("文件 {} 分片 #{} 上传已中止", job.file_id, cursor);
                    return self.emit(&job, UploadEventKind::Aborted { cursor });
                }
                Err(error) => {
                    error!("文件 {} 分片 #{} 上传失败: {}", job.file_id, cursor, error);
                    return self.emit(&job, UploadEventKind::Failed { cursor, error });
                }
            };

            match response.code() {
                ResponseCode::Complete => {
                    info!("文件 {} 服务端已完成合并: {}", job.file_id, response.msg);
                    return self.emit(&job, UploadEventKind::Complete);
                }
                ResponseCode::Success => {
                    cursor += 1;
                    if cursor == total {
                        info!("文件 {} 最后一个分片上传成功", job.file_id);
                        return self.emit(&job, UploadEventKind::Complete);
                    }
                    debug!("文件 {} 分片 #{} 上传成功", job.file_id, cursor - 1);
                    self.emit(&job, UploadEventKind::ChunkDone { next: cursor });
                }
                ResponseCode::Other(code) => {
                    let error = UploadError::Rejected {
                        code,
                        message: response.msg,
                    };
                    error!("文件 {} 分片 #{} 被服务端拒绝: {}", job.file_id, cursor, error);
                    return self.emit(&job, UploadEventKind::Failed { cursor, error });
                }
            }
        }

        // 切片列表为空（不会发生：空文件也有一个分片）
        self.emit(&job, UploadEventKind::Complete);
    }

    /// 上传单个分片，网络错误时按指数退避重试
    async fn upload_with_retry(
        &self,
        job: &UploadJob,
        request: ChunkUploadRequest,
        cursor: usize,
        token: &CancellationToken,
    ) -> UploadResult<ChunkUploadResponse> {
        let file_id = job.file_id.as_str();
        let total = request.total;
        let mut retry_count = 0u32;

        loop {
            let events = self.events.clone();
            let id = job.file_id.clone();
            let run = job.run;
            let on_progress: ProgressCallback = Arc::new(move |loaded, len| {
                let (progress, merging) = upload_progress(cursor, total, loaded, len);
                let _ = events.send(UploadEvent {
                    file_id: id.clone(),
                    run,
                    kind: UploadEventKind::Progress { progress, merging },
                });
            });

            let result = tokio::select! {
                _ = token.cancelled() => return Err(UploadError::Cancelled),
                r = self.transport.upload_chunk(request.clone(), on_progress) => r,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && retry_count < self.max_retries => {
                    let delay = calculate_backoff_delay(retry_count);
                    retry_count += 1;
                    warn!(
                        "文件 {} 分片 #{} 上传失败，{}ms 后重试 ({}/{}): {}",
                        file_id, cursor, delay, retry_count, self.max_retries, e
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::{ChunkPlan, ChunkingOptions};
    use crate::uploader::source::FileSource;
    use crate::uploader::testing::{recv_until, MockReply, MockTransport, TestFile};

    #[test]
    fn test_backoff_delay() {
        assert_eq!(calculate_backoff_delay(0), 100);
        assert_eq!(calculate_backoff_delay(1), 200);
        assert_eq!(calculate_backoff_delay(2), 400);
        assert_eq!(calculate_backoff_delay(6), 5000);
        assert_eq!(calculate_backoff_delay(40), 5000);
    }

    #[test]
    fn test_upload_progress() {
        // 3 个分片，第 0 个发送一半
        assert_eq!(upload_progress(0, 3, 50, 100), (16, false));
        // 第 1 个完成 1/3 已有进度 33.3
        assert_eq!(upload_progress(1, 3, 0, 100), (33, false));
        // 最后一个分片发送完成 -> 合并
        assert_eq!(upload_progress(2, 3, 100, 100), (99, true));
        // 单分片文件
        assert_eq!(upload_progress(0, 1, 99, 100), (99, false));
        assert_eq!(upload_progress(0, 1, 100, 100), (99, true));
        // 空分片视为已发送
        assert_eq!(upload_progress(0, 1, 0, 0), (99, true));
    }

    #[test]
    fn test_first_missing_index() {
        assert_eq!(first_missing_index(&[]), 0);
        assert_eq!(first_missing_index(&[0, 1]), 2);
        assert_eq!(first_missing_index(&[1, 0, 4]), 2);
        assert_eq!(first_missing_index(&[3]), 0);
    }

    fn job(file: Arc<TestFile>, chunk_size: u64) -> UploadJob {
        let options = ChunkingOptions {
            base_chunk_size: chunk_size,
            max_chunk_count: 10_000,
            compute_content_md5: false,
        };
        let plan = ChunkPlan::new(file.size(), &options);
        UploadJob {
            file_id: "f1".to_string(),
            run: 1,
            source: file,
            chunks: plan.chunks(),
            cursor: 0,
            content_md5: Some("abc".to_string()),
            simple_md5: "quick".to_string(),
            extension: "bin".to_string(),
        }
    }

    fn engine(
        transport: Arc<MockTransport>,
        max_retries: u32,
    ) -> (UploadEngine, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UploadEngine::new(transport, max_retries, tx), rx)
    }

    #[tokio::test]
    async fn test_uploads_all_chunks_in_order() {
        let transport = Arc::new(MockTransport::new());
        let (engine, mut events) = engine(transport.clone(), 0);
        let file = Arc::new(TestFile::with_pattern("a.bin", 35));

        engine.run(job(file, 10), CancellationToken::new()).await;

        assert_eq!(transport.indices(), vec![0, 1, 2, 3]);
        let req = &transport.requests()[3];
        assert_eq!(req.len, 5);
        assert_eq!(req.total, 4);
        assert_eq!(req.md5, "abc");
        assert_eq!(req.simple_md5, "quick");
        assert_eq!(req.extension, "bin");

        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Complete)).await;
    }

    #[tokio::test]
    async fn test_resume_from_server_listing() {
        let transport = Arc::new(MockTransport::new());
        transport.set_unfinished("quick", vec![0, 1]);
        let (engine, mut events) = engine(transport.clone(), 0);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 30)), 10), CancellationToken::new())
            .await;

        let started = recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Started { .. })).await;
        assert!(matches!(started.kind, UploadEventKind::Started { cursor: 2 }));
        assert_eq!(transport.indices(), vec![2]);
    }

    #[tokio::test]
    async fn test_server_has_all_chunks_resends_last() {
        let transport = Arc::new(MockTransport::new());
        transport.set_unfinished("quick", vec![0, 1, 2]);
        let (engine, _events) = engine(transport.clone(), 0);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 30)), 10), CancellationToken::new())
            .await;
        assert_eq!(transport.indices(), vec![2]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_not_fatal() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_unfinished_listing();
        let (engine, mut events) = engine(transport.clone(), 0);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 20)), 10), CancellationToken::new())
            .await;
        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Complete)).await;
        assert_eq!(transport.indices(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_complete_code_ends_early() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(MockReply::Respond(ChunkUploadResponse::complete()));
        let (engine, mut events) = engine(transport.clone(), 0);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 30)), 10), CancellationToken::new())
            .await;
        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Complete)).await;
        assert_eq!(transport.indices(), vec![0]);
    }

    #[tokio::test]
    async fn test_success_on_last_chunk_completes() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(MockReply::Respond(ChunkUploadResponse::success()));
        transport.push_reply(MockReply::Respond(ChunkUploadResponse::success()));
        let (engine, mut events) = engine(transport.clone(), 0);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 20)), 10), CancellationToken::new())
            .await;
        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Complete)).await;
    }

    #[tokio::test]
    async fn test_unknown_code_rejected() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(MockReply::Respond(ChunkUploadResponse {
            code: "FAIL".to_string(),
            msg: "bad chunk".to_string(),
        }));
        let (engine, mut events) = engine(transport.clone(), 3);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 20)), 10), CancellationToken::new())
            .await;
        let ev = recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Failed { .. })).await;
        match ev.kind {
            UploadEventKind::Failed { cursor, error } => {
                assert_eq!(cursor, 0);
                assert!(matches!(error, UploadError::Rejected { ref code, .. } if code == "FAIL"));
            }
            _ => unreachable!(),
        }
        // 拒绝不重试
        assert_eq!(transport.indices(), vec![0]);
    }

    #[tokio::test]
    async fn test_network_error_retried_with_backoff() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(MockReply::Fail(UploadError::Network("reset".into())));
        transport.push_reply(MockReply::Fail(UploadError::Network("reset".into())));
        let (engine, mut events) = engine(transport.clone(), 3);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 20)), 10), CancellationToken::new())
            .await;
        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Complete)).await;
        assert_eq!(transport.indices(), vec![0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = Arc::new(MockTransport::new());
        for _ in 0..3 {
            transport.push_reply(MockReply::Fail(UploadError::Network("reset".into())));
        }
        let (engine, mut events) = engine(transport.clone(), 2);

        engine
            .run(job(Arc::new(TestFile::with_pattern("a", 20)), 10), CancellationToken::new())
            .await;
        let ev = recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Failed { .. })).await;
        assert!(matches!(
            ev.kind,
            UploadEventKind::Failed { cursor: 0, error: UploadError::Network(_) }
        ));
        assert_eq!(transport.indices(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_abort_does_not_advance_cursor() {
        let transport = Arc::new(MockTransport::new());
        transport.push_reply(MockReply::Respond(ChunkUploadResponse::success()));
        transport.push_reply(MockReply::Hang);
        let (engine, mut events) = engine(transport.clone(), 0);
        let token = CancellationToken::new();

        let run = {
            let token = token.clone();
            let job = job(Arc::new(TestFile::with_pattern("a", 30)), 10);
            async move { engine.run(job, token).await }
        };
        let handle = tokio::spawn(run);

        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::ChunkDone { next: 1 })).await;
        // 等待第二个请求发出
        recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Progress { .. })).await;
        token.cancel();
        handle.await.unwrap();

        let ev = recv_until(&mut events, |e| matches!(e.kind, UploadEventKind::Aborted { .. })).await;
        assert!(matches!(ev.kind, UploadEventKind::Aborted { cursor: 1 }));
    }
}
