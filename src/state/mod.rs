//! 传输状态模块
//!
//! - 分片与 `FileState` 数据模型
//! - `StateStore`：按 file_id 原子持久化

pub mod store;
pub mod types;

pub use store::StateStore;
pub use types::{
    partition, Chunk, ChunkStatus, Direction, FileState, StateSummary, STATE_SCHEMA_VERSION,
};
