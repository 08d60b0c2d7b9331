// 上传服务网络边界

pub mod client;
pub mod types;

pub use client::HttpUploadClient;
pub use types::{
    ChunkUploadRequest, ChunkUploadResponse, ProgressCallback, ResponseCode, UnfinishedResponse,
};

use crate::uploader::error::UploadResult;
use async_trait::async_trait;
use std::collections::HashMap;

/// 分片上传传输层
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 上传单个分片，发送过程中通过 `on_progress` 上报进度
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        on_progress: ProgressCallback,
    ) -> UploadResult<ChunkUploadResponse>;

    /// 查询服务端已保存的分片（快速指纹 -> 分片索引）
    async fn list_unfinished(&self) -> UploadResult<HashMap<String, Vec<usize>>>;
}
