// 可恢复传输模块
//
// 分片读写引擎 + 类文件流适配

pub mod engine;
mod session;
pub mod stream;
pub mod types;

pub use engine::TransferEngine;
pub use stream::{open_resumable, with_resumable, OpenMode, OpenOptions, ResumableStream};
pub use types::{
    ChunkReadResult, ChunkTarget, ChunkWriteResult, CopyResult, FinalizeResult, MultiChunkResult,
    ReadOptions, ResumeResult, WriteOptions,
};
