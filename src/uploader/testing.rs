// 测试用的内存数据源和模拟传输层

use crate::transport::{ChunkUploadRequest, ChunkUploadResponse, ProgressCallback, UploadTransport};
use crate::uploader::error::{UploadError, UploadResult};
use crate::uploader::source::FileSource;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::time::Duration;
use tokio::sync::mpsc;

fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// 内存数据源
#[derive(Debug)]
pub struct TestFile {
    name: String,
    size: u64,
    modified_at: Option<i64>,
    /// false 时内容全为 0，用于大文件
    patterned: bool,
    delay: Duration,
    fail_once_at: Mutex<Option<u64>>,
    reads: Mutex<Vec<Range<u64>>>,
}

impl TestFile {
    /// 内容为固定模式的小文件
    pub fn with_pattern(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            modified_at: Some(1_700_000_000_000),
            patterned: true,
            delay: Duration::ZERO,
            fail_once_at: Mutex::new(None),
            reads: Mutex::new(Vec::new()),
        }
    }

    /// 内容全为 0 的大文件
    pub fn zeroed(name: &str, size: u64) -> Self {
        Self {
            patterned: false,
            ..Self::with_pattern(name, size)
        }
    }

    /// 每次读取前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 第一次读取从 `offset` 开始的范围时失败
    pub fn fail_once_at(self, offset: u64) -> Self {
        *self.fail_once_at.lock() = Some(offset);
        self
    }

    pub fn with_modified_at(mut self, modified_at: i64) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// 完整内容
    pub fn bytes(&self) -> Vec<u8> {
        self.generate(0..self.size)
    }

    /// 成功读取过的范围（按顺序）
    pub fn reads(&self) -> Vec<Range<u64>> {
        self.reads.lock().clone()
    }

    fn generate(&self, range: Range<u64>) -> Vec<u8> {
        if self.patterned {
            range.map(pattern_byte).collect()
        } else {
            vec![0u8; (range.end - range.start) as usize]
        }
    }
}

#[async_trait]
impl FileSource for TestFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn modified_at(&self) -> Option<i64> {
        self.modified_at
    }

    async fn read_range(&self, range: Range<u64>) -> anyhow::Result<Vec<u8>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut fail = self.fail_once_at.lock();
            if *fail == Some(range.start) {
                *fail = None;
                anyhow::bail!("模拟读取失败: offset={}", range.start);
            }
        }

        if range.end > self.size {
            anyhow::bail!("读取越界: {:?}", range);
        }

        self.reads.lock().push(range.clone());
        Ok(self.generate(range))
    }
}

/// 等待满足条件的消息，超时则测试失败
pub async fn recv_until<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> T {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let item = rx.recv().await.expect("channel closed");
            if pred(&item) {
                return item;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

/// 模拟传输层记录的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub index: usize,
    pub total: usize,
    pub len: usize,
    pub md5: String,
    pub simple_md5: String,
    pub extension: String,
}

/// 模拟传输层的预设回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Respond(ChunkUploadResponse),
    Fail(UploadError),
    /// 永不返回（等待取消）
    Hang,
}

/// 模拟传输层
///
/// 没有预设回复时：最后一个分片返回 COMPLETE，其余返回 SUCCESS。
#[derive(Debug, Default)]
pub struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    replies: Mutex<VecDeque<MockReply>>,
    unfinished: Mutex<HashMap<String, Vec<usize>>>,
    unfinished_fails: Mutex<bool>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个请求的处理耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// 按顺序为后续请求预设回复
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// 设置服务端已保存的分片
    pub fn set_unfinished(&self, simple_md5: &str, indices: Vec<usize>) {
        self.unfinished
            .lock()
            .insert(simple_md5.to_string(), indices);
    }

    pub fn fail_unfinished_listing(&self) {
        *self.unfinished_fails.lock() = true;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.requests.lock().iter().map(|r| r.index).collect()
    }
}

#[async_trait]
impl UploadTransport for MockTransport {
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        on_progress: ProgressCallback,
    ) -> UploadResult<ChunkUploadResponse> {
        let len = request.data.len() as u64;
        self.requests.lock().push(RecordedRequest {
            index: request.index,
            total: request.total,
            len: request.data.len(),
            md5: request.md5.clone(),
            simple_md5: request.simple_md5.clone(),
            extension: request.extension.clone(),
        });

        let reply = self.replies.lock().pop_front();

        on_progress(len / 2, len);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            Some(MockReply::Respond(resp)) => {
                on_progress(len, len);
                Ok(resp)
            }
            Some(MockReply::Fail(e)) => Err(e),
            Some(MockReply::Hang) => std::future::pending().await,
            None => {
                on_progress(len, len);
                if request.index + 1 == request.total {
                    Ok(ChunkUploadResponse::complete())
                } else {
                    Ok(ChunkUploadResponse::success())
                }
            }
        }
    }

    async fn list_unfinished(&self) -> UploadResult<HashMap<String, Vec<usize>>> {
        if *self.unfinished_fails.lock() {
            return Err(UploadError::Network("listing unavailable".to_string()));
        }
        Ok(self.unfinished.lock().clone())
    }
}
