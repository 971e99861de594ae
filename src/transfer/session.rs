// 单个操作在引擎中的运行时状态
//
// 引擎为每个已附着的 file_id 持有一个 TransferSession：
// - 内存中的 FileState（唯一可变副本，每次变更后整体持久化）
// - 分片调度器（并发控制 + 单飞去重）
// - 进度统计器与可选的自适应分片计算器

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use crate::common::{AdaptiveSizer, ProgressEvent, ProgressReporter, ProgressSample};
use crate::config::AdaptiveConfig;
use crate::error::Result;
use crate::scheduler::ChunkScheduler;
use crate::state::{Direction, FileState, StateStore};
use crate::transfer::types::{ChunkReadResult, ChunkWriteResult, FinalizeResult};

/// 一次分片操作的结果（同一在途操作的所有等待者共享）
#[derive(Debug, Clone)]
pub(crate) struct ChunkDone {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub success: bool,
    /// 读取到的数据
    pub data: Option<Arc<Vec<u8>>>,
    pub error: Option<String>,
    pub completion_percentage: f64,
}

pub(crate) type ChunkOutcome = Result<ChunkDone>;

impl ChunkDone {
    pub fn into_write_result(self) -> ChunkWriteResult {
        ChunkWriteResult {
            chunk_index: self.index,
            success: self.success,
            chunk_start: self.start,
            chunk_end: self.end,
            completion_percentage: self.completion_percentage,
            error: self.error,
        }
    }

    pub fn into_read_result(self) -> ChunkReadResult {
        let chunk_data = self
            .data
            .map(|data| Arc::try_unwrap(data).unwrap_or_else(|shared| shared.as_ref().clone()))
            .unwrap_or_default();
        ChunkReadResult {
            chunk_index: self.index,
            success: self.success,
            chunk_data,
            completion_percentage: self.completion_percentage,
            error: self.error,
        }
    }
}

/// 已附着操作的运行时状态
pub(crate) struct TransferSession {
    pub file_id: String,
    direction: Direction,
    state: Mutex<FileState>,
    /// 串行化持久化，保证后保存的快照不会被先拍的快照覆盖
    persist_lock: Mutex<()>,
    /// 串行化 finalize
    pub finalize_lock: tokio::sync::Mutex<()>,
    pub scheduler: ChunkScheduler<ChunkOutcome>,
    reporter: Mutex<ProgressReporter>,
    sizer: Option<Mutex<AdaptiveSizer>>,
    finalized: Mutex<Option<FinalizeResult>>,
}

impl TransferSession {
    pub fn new(state: FileState, adaptive: &AdaptiveConfig) -> Self {
        let sizer = state
            .adaptive_chunking
            .then(|| Mutex::new(AdaptiveSizer::new(adaptive.clone(), state.optimal_chunk_size)));

        Self {
            file_id: state.file_id.clone(),
            direction: state.direction,
            scheduler: ChunkScheduler::new(state.file_id.clone(), state.max_parallel_chunks),
            reporter: Mutex::new(ProgressReporter::new(state.file_id.clone())),
            state: Mutex::new(state),
            persist_lock: Mutex::new(()),
            finalize_lock: tokio::sync::Mutex::new(()),
            sizer,
            finalized: Mutex::new(None),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 当前状态快照
    pub fn snapshot(&self) -> FileState {
        self.state.lock().clone()
    }

    /// 在锁内读写状态（闭包内不得 await）
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FileState) -> R) -> R {
        let mut guard = self.state.lock();
        f(&mut *guard)
    }

    /// 替换整个状态
    pub fn replace_state(&self, state: FileState) {
        *self.state.lock() = state;
    }

    /// 持久化当前状态
    pub fn persist(&self, store: &StateStore) -> Result<()> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.snapshot();
        store.save(&self.file_id, &snapshot).map_err(|e| {
            error!("状态持久化失败: file_id={}, 错误: {}", self.file_id, e);
            e
        })
    }

    /// 喂给自适应计算器，返回新的推荐分片大小
    pub fn record_throughput(&self, bytes: u64, transfer_time: Duration) -> Option<u64> {
        self.sizer
            .as_ref()
            .map(|sizer| sizer.lock().record(bytes, transfer_time))
    }

    pub fn report(
        &self,
        sample: ProgressSample,
        completion_percentage: f64,
        bytes_remaining: u64,
    ) -> ProgressEvent {
        self.reporter
            .lock()
            .record(sample, completion_percentage, bytes_remaining)
    }

    pub fn resumed_event(
        &self,
        completion_percentage: f64,
        remaining_chunks: Vec<usize>,
    ) -> ProgressEvent {
        self.reporter
            .lock()
            .resumed(completion_percentage, remaining_chunks)
    }

    pub fn finalized(&self) -> Option<FinalizeResult> {
        self.finalized.lock().clone()
    }

    pub fn set_finalized(&self, result: FinalizeResult) {
        *self.finalized.lock() = Some(result);
    }
}
