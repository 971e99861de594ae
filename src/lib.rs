// Resumable Transfer Library
// 可恢复分片传输引擎

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 存储后端
pub mod backend;

// 传输状态与持久化
pub mod state;

// 分片调度器（并发控制 + 单飞去重）
pub mod scheduler;

// 公共模块（自适应分片、进度上报、重试退避）
pub mod common;

// 传输引擎与流适配
pub mod transfer;

// 导出常用类型
pub use backend::{BackendStat, LocalBackend, MemoryBackend, StorageBackend};
pub use common::{AdaptiveSizer, ProgressCallback, ProgressEvent, ProgressReporter, ProgressSample};
pub use config::TransferConfig;
pub use error::{BackendError, Result, TransferError};
pub use scheduler::ChunkScheduler;
pub use state::{Chunk, ChunkStatus, Direction, FileState, StateStore, StateSummary};
pub use transfer::{
    open_resumable, with_resumable, ChunkReadResult, ChunkTarget, ChunkWriteResult, CopyResult,
    FinalizeResult, MultiChunkResult, OpenMode, OpenOptions, ReadOptions, ResumableStream,
    ResumeResult, TransferEngine, WriteOptions,
};
