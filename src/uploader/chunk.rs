// 分片规划
//
// 分片规则：
// - 基础分片大小 100MB，文件小于基础大小时整个文件作为一个分片
// - 分片数量上限 10000，超过时分片大小不断翻倍直到满足上限
// - 最后一个分片吸收余数
// - 空文件也生成一个长度为 0 的分片，保证服务端能收到 index=0,total=1 并完成合并

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// 1MB 的字节数
pub const MB: u64 = 1024 * 1024;

/// 默认基础分片大小: 100MB
pub const DEFAULT_BASE_CHUNK_SIZE: u64 = 100 * MB;

/// 默认分片数量上限
pub const DEFAULT_MAX_CHUNK_COUNT: u64 = 10_000;

/// 切片参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    /// 基础分片大小（字节）
    pub base_chunk_size: u64,
    /// 分片数量上限
    pub max_chunk_count: u64,
    /// 是否计算完整内容 MD5
    pub compute_content_md5: bool,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            base_chunk_size: DEFAULT_BASE_CHUNK_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
            compute_content_md5: true,
        }
    }
}

/// 计算分片大小
///
/// # 参数
/// * `file_size` - 文件大小
/// * `base_chunk_size` - 基础分片大小
/// * `max_chunk_count` - 分片数量上限
pub fn calculate_chunk_size(file_size: u64, base_chunk_size: u64, max_chunk_count: u64) -> u64 {
    // 文件比基础分片小，直接取文件大小
    if base_chunk_size > file_size {
        return file_size;
    }

    let mut chunk_size = base_chunk_size.max(1);
    let max_chunk_count = max_chunk_count.max(1);
    while file_size > chunk_size.saturating_mul(max_chunk_count) {
        chunk_size = chunk_size.saturating_mul(2);
    }
    chunk_size
}

/// 分片信息（创建后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 单个文件的分片规划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// 文件大小
    pub file_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 分片数量
    pub chunk_count: usize,
}

impl ChunkPlan {
    /// 按切片参数生成规划
    pub fn new(file_size: u64, options: &ChunkingOptions) -> Self {
        let chunk_size =
            calculate_chunk_size(file_size, options.base_chunk_size, options.max_chunk_count);
        let chunk_count = if chunk_size == 0 {
            1
        } else {
            file_size.div_ceil(chunk_size) as usize
        };

        debug!(
            "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_size, chunk_size, chunk_count
        );

        Self {
            file_size,
            chunk_size,
            chunk_count,
        }
    }

    /// 指定索引的字节范围 `[index*chunk_size, min((index+1)*chunk_size, file_size))`
    pub fn range(&self, index: usize) -> Range<u64> {
        let begin = (self.chunk_size * index as u64).min(self.file_size);
        let end = if index + 1 >= self.chunk_count {
            self.file_size
        } else {
            (self.chunk_size * (index as u64 + 1)).min(self.file_size)
        };
        begin..end
    }

    /// 指定索引的分片
    pub fn chunk(&self, index: usize) -> Chunk {
        Chunk::new(index, self.range(index))
    }

    /// 全部分片
    pub fn chunks(&self) -> Vec<Chunk> {
        (0..self.chunk_count).map(|i| self.chunk(i)).collect()
    }
}
