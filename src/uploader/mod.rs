// 分片上传模块
//
// - 切片线程池：固定数量的切片线程，计算完整 MD5 并生成分片列表
// - 上传协调器：文件注册表、线程租用、状态通知
// - 上传循环：断点续传、逐片上传、失败重试

pub mod chunk;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod identity;
pub mod pool;
pub mod source;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{calculate_chunk_size, Chunk, ChunkPlan, ChunkingOptions, MB};
pub use coordinator::{SubmitOutcome, UploadCoordinator};
pub use engine::{UploadEngine, UploadEvent, UploadEventKind, UploadJob};
pub use error::{UploadError, UploadResult};
pub use identity::{file_extension, generate_task_id, quick_fingerprint};
pub use pool::{UnitHandle, WorkerPool};
pub use source::{FileSource, LocalFile, SharedSource};
pub use task::{FileSnapshot, FileStatus, FileTask};
pub use worker::{ChunkedFile, ChunkingUnit, UnitCommand, UnitEvent, UnitEventKind};
