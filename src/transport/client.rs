// HTTP 上传客户端

use crate::config::UploadConfig;
use crate::transport::types::{
    ChunkUploadRequest, ChunkUploadResponse, ProgressCallback, UnfinishedResponse,
};
use crate::transport::UploadTransport;
use crate::uploader::error::{UploadError, UploadResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Body, Client};
use std::collections::HashMap;
use tracing::{debug, error, info};

/// 分片数据按此大小分段写入请求体，用于上报发送进度
const UPLOAD_PIECE_SIZE: usize = 256 * 1024;

/// 基于 reqwest 的上传客户端
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    client: Client,
    chunk_url: String,
    unfinished_url: String,
}

impl HttpUploadClient {
    pub fn new(config: &UploadConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化上传客户端: chunk_url={}, 超时={}s",
            config.chunk_url(),
            config.request_timeout_secs
        );

        Ok(Self {
            client,
            chunk_url: config.chunk_url(),
            unfinished_url: config.unfinished_url(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> UploadError {
    if e.is_timeout() {
        UploadError::Timeout(e.to_string())
    } else {
        UploadError::Network(e.to_string())
    }
}

/// 把分片数据切成小段，每段被取走时上报累计发送字节
fn progress_pieces(
    data: Vec<u8>,
    on_progress: ProgressCallback,
) -> impl futures::Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    let total = data.len() as u64;
    let piece_count = data.len().div_ceil(UPLOAD_PIECE_SIZE);
    let mut sent = 0u64;

    futures::stream::iter((0..piece_count).map(move |i| {
        let start = i * UPLOAD_PIECE_SIZE;
        let end = (start + UPLOAD_PIECE_SIZE).min(data.len());
        let piece = data[start..end].to_vec();
        sent += piece.len() as u64;
        on_progress(sent, total);
        Ok::<_, std::io::Error>(piece)
    }))
}

#[async_trait]
impl UploadTransport for HttpUploadClient {
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        on_progress: ProgressCallback,
    ) -> UploadResult<ChunkUploadResponse> {
        let ChunkUploadRequest {
            data,
            index,
            total,
            md5,
            simple_md5,
            extension,
        } = request;

        info!(
            "上传分片: index={}/{}, size={}, simpleMD5={}",
            index,
            total,
            data.len(),
            simple_md5
        );

        let len = data.len() as u64;
        let part = multipart::Part::stream_with_length(
            Body::wrap_stream(progress_pieces(data, on_progress)),
            len,
        )
        .file_name("blob")
        .mime_str("application/octet-stream")
        .map_err(map_reqwest_error)?;

        let form = multipart::Form::new()
            .part("data", part)
            .text("index", index.to_string())
            .text("total", total.to_string())
            .text("md5", md5)
            .text("simpleMD5", simple_md5)
            .text("extension", extension);

        let response = self
            .client
            .post(&self.chunk_url)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(map_reqwest_error)?;

        debug!(
            "上传分片响应: index={}, status={}, body={}",
            index, status, response_text
        );

        if status.is_server_error() {
            return Err(UploadError::Network(format!(
                "HTTP {}: {}",
                status, response_text
            )));
        }

        serde_json::from_str::<ChunkUploadResponse>(&response_text).map_err(|e| {
            error!(
                "解析上传分片响应失败: status={}, body={}, 错误: {}",
                status, response_text, e
            );
            UploadError::Rejected {
                code: status.as_u16().to_string(),
                message: response_text,
            }
        })
    }

    async fn list_unfinished(&self) -> UploadResult<HashMap<String, Vec<usize>>> {
        let response = self
            .client
            .get(&self.unfinished_url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Network(format!("HTTP {}", status)));
        }

        let body: UnfinishedResponse = response.json().await.map_err(map_reqwest_error)?;
        debug!("未完成分片列表: {} 个文件", body.data.len());
        Ok(body.data)
    }
}
