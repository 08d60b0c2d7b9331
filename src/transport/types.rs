// 上传服务的请求/响应类型

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 分片上传进度回调 `(已发送字节, 分片总字节)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 单个分片的上传请求
#[derive(Debug, Clone)]
pub struct ChunkUploadRequest {
    /// 分片数据
    pub data: Vec<u8>,
    /// 分片索引
    pub index: usize,
    /// 分片总数
    pub total: usize,
    /// 完整内容 MD5（未计算时为空字符串）
    pub md5: String,
    /// 快速指纹
    pub simple_md5: String,
    /// 文件后缀
    pub extension: String,
}

/// 服务端响应码
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// 分片已接收，继续下一个
    Success,
    /// 整个文件已合并完成
    Complete,
    /// 其他（视为拒绝）
    Other(String),
}

impl ResponseCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "SUCCESS" => ResponseCode::Success,
            // UPLOADED 为旧版服务端的完成码
            "COMPLETE" | "UPLOADED" => ResponseCode::Complete,
            other => ResponseCode::Other(other.to_string()),
        }
    }
}

/// 分片上传响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    /// 响应码
    pub code: String,
    /// 响应消息
    #[serde(default)]
    pub msg: String,
}

impl ChunkUploadResponse {
    pub fn success() -> Self {
        Self {
            code: "SUCCESS".to_string(),
            msg: String::new(),
        }
    }

    pub fn complete() -> Self {
        Self {
            code: "COMPLETE".to_string(),
            msg: String::new(),
        }
    }

    pub fn code(&self) -> ResponseCode {
        ResponseCode::parse(&self.code)
    }
}

/// 未完成分片查询响应
///
/// `data` 为 `快速指纹 -> 服务端已保存的分片索引`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnfinishedResponse {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub data: HashMap<String, Vec<usize>>,
}
