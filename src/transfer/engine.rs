// 可恢复传输引擎
//
// 负责协调单个 file_id 的整个生命周期：
// - 开始读/写操作，切分分片并持久化初始状态
// - 分片 I/O（经调度器做并发控制和单飞去重），失败重试与超时
// - 每次状态变更后整体持久化，崩溃后通过 resume 恢复
// - 收尾（校验完成、获取内容哈希、清理状态）
// - 进度回调、自适应分片、断点复制

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{normalize_path, parent_path, StorageBackend};
use crate::common::{calculate_backoff_delay, ProgressCallback, ProgressEvent, ProgressSample};
use crate::config::TransferConfig;
use crate::error::{BackendError, Result, TransferError};
use crate::state::{Chunk, ChunkStatus, Direction, FileState, StateStore, StateSummary};
use crate::transfer::session::{ChunkDone, TransferSession};
use crate::transfer::types::{
    ChunkReadResult, ChunkTarget, ChunkWriteResult, CopyResult, FinalizeResult, MultiChunkResult,
    ReadOptions, ResumeResult, WriteOptions,
};

/// 分片 I/O 类型
enum ChunkIo {
    Write(Vec<u8>),
    Read,
}

/// 带超时的后端调用
async fn call_with_timeout<T, F>(limit: Duration, fut: F) -> std::result::Result<T, BackendError>
where
    F: Future<Output = std::result::Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

/// 后端路径不存在时转为 NotFound，其余原样包装
fn map_missing(e: BackendError) -> TransferError {
    match e {
        BackendError::NotFound(path) => TransferError::NotFound(path),
        other => TransferError::Backend(other),
    }
}

/// 可恢复传输引擎
///
/// 克隆开销很小，所有克隆共享同一组会话
#[derive(Clone)]
pub struct TransferEngine {
    backend: Arc<dyn StorageBackend>,
    store: Arc<StateStore>,
    config: Arc<TransferConfig>,
    /// 已附着的操作（file_id -> 会话）
    sessions: Arc<DashMap<String, Arc<TransferSession>>>,
    /// 进度回调（file_id -> 回调），每个 file_id 一个
    callbacks: Arc<DashMap<String, ProgressCallback>>,
    /// 已完成的写入（file_id -> 结果），会话释放后用于重复 finalize 和拒绝继续写入
    finalized: Arc<DashMap<String, FinalizeResult>>,
}

impl TransferEngine {
    /// 创建引擎
    pub fn new(backend: Arc<dyn StorageBackend>, config: TransferConfig) -> Self {
        let store = StateStore::new(config.persistence.state_dir.clone());
        info!(
            "传输引擎已创建: 状态目录={:?}, 超时={}s, 最大重试={}",
            store.state_dir(),
            config.engine.chunk_timeout_secs,
            config.engine.max_retries
        );
        Self {
            backend,
            store: Arc::new(store),
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
            callbacks: Arc::new(DashMap::new()),
            finalized: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// 操作是否已附着到本引擎
    pub fn is_attached(&self, file_id: &str) -> bool {
        self.sessions.contains_key(file_id)
    }

    /// 指定操作当前在途的分片数
    pub fn in_flight_count(&self, file_id: &str) -> usize {
        self.sessions
            .get(file_id)
            .map(|s| s.scheduler.in_flight_count())
            .unwrap_or(0)
    }

    /// 已完成的写入不再接受分片
    fn ensure_not_finalized(&self, file_id: &str) -> Result<()> {
        if self.finalized.contains_key(file_id) {
            return Err(TransferError::Concurrency(format!(
                "操作 {} 已完成，不能继续写入",
                file_id
            )));
        }
        Ok(())
    }

    async fn call_backend<T, F>(&self, fut: F) -> std::result::Result<T, BackendError>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        call_with_timeout(self.config.engine.chunk_timeout(), fut).await
    }

    fn resolve_chunk_size(&self, chunk_size: Option<u64>) -> Result<u64> {
        let chunk_size = chunk_size.unwrap_or(self.config.engine.default_chunk_size);
        if chunk_size == 0 {
            return Err(TransferError::validation("chunk_size 必须大于 0"));
        }
        Ok(chunk_size)
    }

    /// 创建会话并登记
    fn register_session(&self, state: FileState) -> Arc<TransferSession> {
        let session = Arc::new(TransferSession::new(state, &self.config.adaptive));
        self.sessions
            .insert(session.file_id.clone(), session.clone());
        session
    }

    /// 获取会话，未附着时从状态存储加载
    ///
    /// 加载时 InProgress 分片一律回退为 Pending
    fn attach(&self, file_id: &str) -> Result<Arc<TransferSession>> {
        if let Some(session) = self.sessions.get(file_id) {
            return Ok(session.value().clone());
        }

        let mut state = self.store.load(file_id)?;
        let reset = state.reset_in_progress();
        if reset > 0 {
            warn!(
                "操作 {} 有 {} 个分片停留在进行中，已回退为待传输",
                file_id, reset
            );
            self.store.save(file_id, &state)?;
        }

        let session = Arc::new(TransferSession::new(state, &self.config.adaptive));
        let session = self
            .sessions
            .entry(file_id.to_string())
            .or_insert(session)
            .value()
            .clone();

        info!("已附着操作: {}", file_id);
        Ok(session)
    }

    // =====================================================
    // 开始操作
    // =====================================================

    /// 开始可恢复写入
    ///
    /// 创建（或截断）目标对象，切分分片并持久化初始状态，返回新的 file_id
    pub async fn start_resumable_write(
        &self,
        file_path: &str,
        total_size: u64,
        options: WriteOptions,
    ) -> Result<String> {
        let chunk_size = self.resolve_chunk_size(options.chunk_size)?;
        let path = normalize_path(file_path).map_err(|e| TransferError::validation(e.to_string()))?;

        let file_id = Uuid::new_v4().to_string();
        let mut state = FileState::new(
            file_id.clone(),
            path.clone(),
            Direction::Write,
            total_size,
            chunk_size,
        )?;
        state.metadata = options.metadata.clone();
        state.adaptive_chunking = options.adaptive_chunking;
        state.max_parallel_chunks = options.effective_parallelism();

        if let Some(parent) = parent_path(&path) {
            self.call_backend(self.backend.mkdir(&parent, true)).await?;
        }
        self.call_backend(self.backend.write(&path, &[], 0, true))
            .await?;

        self.store.save(&file_id, &state)?;

        info!(
            "开始可恢复写入: file_id={}, 路径={}, 大小={}, 分片大小={}, 分片数={}, 并发={}",
            file_id,
            path,
            total_size,
            chunk_size,
            state.chunk_count(),
            state.max_parallel_chunks
        );

        self.register_session(state);
        Ok(file_id)
    }

    /// 开始可恢复读取
    ///
    /// 通过 stat 获取对象大小，路径不存在时返回 NotFound
    pub async fn start_resumable_read(
        &self,
        file_path: &str,
        options: ReadOptions,
    ) -> Result<String> {
        let chunk_size = self.resolve_chunk_size(options.chunk_size)?;
        let path = normalize_path(file_path).map_err(|e| TransferError::validation(e.to_string()))?;

        let stat = self
            .call_backend(self.backend.stat(&path))
            .await
            .map_err(map_missing)?;

        let file_id = Uuid::new_v4().to_string();
        let mut state = FileState::new(
            file_id.clone(),
            path.clone(),
            Direction::Read,
            stat.size,
            chunk_size,
        )?;
        state.metadata = options.metadata.clone();
        state.max_parallel_chunks = options.effective_parallelism();

        self.store.save(&file_id, &state)?;

        info!(
            "开始可恢复读取: file_id={}, 路径={}, 大小={}, 分片数={}",
            file_id,
            path,
            stat.size,
            state.chunk_count()
        );

        self.register_session(state);
        Ok(file_id)
    }

    // =====================================================
    // 分片 I/O
    // =====================================================

    /// 写入一个分片（按索引）
    pub async fn write_chunk(
        &self,
        file_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<ChunkWriteResult> {
        self.write_chunk_at(file_id, ChunkTarget::Index(chunk_index), data)
            .await
    }

    /// 写入一个分片（按索引或偏移定位）
    ///
    /// 数据长度必须等于分片大小；后端失败不会返回 Err，而是 `success == false`
    pub async fn write_chunk_at(
        &self,
        file_id: &str,
        target: ChunkTarget,
        data: &[u8],
    ) -> Result<ChunkWriteResult> {
        self.ensure_not_finalized(file_id)?;
        let session = self.attach(file_id)?;
        let chunk = prepare_write(&session, target, data.len())?;
        let done = self
            .submit(&session, chunk, || ChunkIo::Write(data.to_vec()))
            .await?;
        Ok(done.into_write_result())
    }

    /// 读取一个分片
    pub async fn read_chunk(&self, file_id: &str, chunk_index: usize) -> Result<ChunkReadResult> {
        let session = self.attach(file_id)?;
        let chunk = prepare_read(&session, chunk_index)?;
        let done = self.submit(&session, chunk, || ChunkIo::Read).await?;
        Ok(done.into_read_result())
    }

    /// 批量写入分片
    ///
    /// 先校验全部参数，再并发提交（受 max_parallel_chunks 限制）；
    /// 单个分片失败不影响其他分片。同一批次中索引不能重复
    pub async fn write_multiple_chunks(
        &self,
        file_id: &str,
        chunks: Vec<(usize, Vec<u8>)>,
    ) -> Result<MultiChunkResult<ChunkWriteResult>> {
        self.ensure_not_finalized(file_id)?;
        reject_duplicates(chunks.iter().map(|(index, _)| *index))?;
        let session = self.attach(file_id)?;

        let mut prepared = Vec::with_capacity(chunks.len());
        for (index, data) in chunks {
            let chunk = prepare_write(&session, ChunkTarget::Index(index), data.len())?;
            prepared.push((chunk, data));
        }

        let outcomes = join_all(
            prepared
                .into_iter()
                .map(|(chunk, data)| self.submit(&session, chunk, move || ChunkIo::Write(data))),
        )
        .await;

        let mut results = BTreeMap::new();
        for outcome in outcomes {
            let done = outcome?;
            results.insert(done.index, done.into_write_result());
        }
        let completed_chunks = results.values().filter(|r| r.success).count();

        Ok(MultiChunkResult {
            failed_chunks: results.len() - completed_chunks,
            completed_chunks,
            completion_percentage: session.with_state(|s| s.completion_percentage()),
            results,
        })
    }

    /// 批量读取分片（索引不能重复）
    pub async fn read_multiple_chunks(
        &self,
        file_id: &str,
        indices: &[usize],
    ) -> Result<MultiChunkResult<ChunkReadResult>> {
        reject_duplicates(indices.iter().copied())?;
        let session = self.attach(file_id)?;

        let prepared = indices
            .iter()
            .map(|&index| prepare_read(&session, index))
            .collect::<Result<Vec<_>>>()?;

        let outcomes = join_all(
            prepared
                .into_iter()
                .map(|chunk| self.submit(&session, chunk, || ChunkIo::Read)),
        )
        .await;

        let mut results = BTreeMap::new();
        for outcome in outcomes {
            let done = outcome?;
            results.insert(done.index, done.into_read_result());
        }
        let completed_chunks = results.values().filter(|r| r.success).count();

        Ok(MultiChunkResult {
            failed_chunks: results.len() - completed_chunks,
            completed_chunks,
            completion_percentage: session.with_state(|s| s.completion_percentage()),
            results,
        })
    }

    /// 经调度器提交分片操作
    ///
    /// 同一分片已在途时直接共享其结果，`make_io` 不会被调用
    async fn submit<F>(
        &self,
        session: &Arc<TransferSession>,
        chunk: Chunk,
        make_io: F,
    ) -> Result<ChunkDone>
    where
        F: FnOnce() -> ChunkIo,
    {
        let index = chunk.index;
        let engine = self.clone();
        let owner = session.clone();

        session
            .scheduler
            .run(index, move || engine.execute_chunk(owner, chunk, make_io()))
            .await
            .unwrap_or_else(|| {
                Err(TransferError::Concurrency(format!(
                    "分片 #{} 执行任务异常退出",
                    index
                )))
            })
    }

    /// 执行一次分片操作（在调度器的独立任务中运行）
    ///
    /// 1. 标记进行中并持久化（已完成的分片重写时保持已完成）
    /// 2. 执行后端 I/O，可重试错误按指数退避重试
    /// 3. 标记完成/失败并持久化
    /// 4. 更新自适应分片、生成进度事件
    async fn execute_chunk(
        self,
        session: Arc<TransferSession>,
        chunk: Chunk,
        io: ChunkIo,
    ) -> Result<ChunkDone> {
        let index = chunk.index;
        let path = session.with_state(|s| -> Result<String> {
            if !s.chunk(index)?.status.is_completed() {
                s.mark_chunk(index, ChunkStatus::InProgress, None)?;
            }
            Ok(s.file_path.clone())
        })?;
        session.persist(&self.store)?;

        let max_retries = self.config.engine.max_retries;
        let mut retry = 0;
        let result = loop {
            let attempt = session.with_state(|s| s.record_attempt(index))?;
            let started = Instant::now();

            let outcome = match &io {
                ChunkIo::Write(data) => self
                    .call_backend(self.backend.write(&path, data, chunk.start, false))
                    .await
                    .map(|_| None),
                ChunkIo::Read => self
                    .call_backend(self.backend.read(&path, chunk.start, chunk.size))
                    .await
                    .and_then(|data| {
                        if data.len() as u64 == chunk.size {
                            Ok(Some(data))
                        } else {
                            Err(BackendError::Io(format!(
                                "读取长度不足: 期望 {} bytes, 实际 {} bytes",
                                chunk.size,
                                data.len()
                            )))
                        }
                    }),
            };

            match outcome {
                Ok(data) => break Ok((data, started.elapsed())),
                Err(e) if e.is_retryable() && retry < max_retries => {
                    let delay = calculate_backoff_delay(retry);
                    warn!(
                        "分片 #{} 第 {} 次尝试失败: {}，{}ms 后重试 (file_id={})",
                        index,
                        attempt,
                        e,
                        delay.as_millis(),
                        session.file_id
                    );
                    retry += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok((data, elapsed)) => {
                let optimal = session.record_throughput(chunk.size, elapsed);
                let (completion_percentage, bytes_remaining) =
                    session.with_state(|s| -> Result<(f64, u64)> {
                        s.mark_chunk(index, ChunkStatus::Completed, None)?;
                        if let Some(optimal) = optimal {
                            s.optimal_chunk_size = optimal;
                        }
                        Ok((s.completion_percentage(), s.bytes_remaining()))
                    })?;
                session.persist(&self.store)?;

                debug!(
                    "分片 #{} 完成: bytes={}-{}, 耗时={:?}, 进度={:.1}% (file_id={})",
                    index,
                    chunk.start,
                    chunk.end(),
                    elapsed,
                    completion_percentage,
                    session.file_id
                );

                let sample = ProgressSample::new(index, chunk.start, chunk.end(), elapsed);
                let event = session.report(sample, completion_percentage, bytes_remaining);
                self.emit(&session.file_id, &event);

                Ok(ChunkDone {
                    index,
                    start: chunk.start,
                    end: chunk.end(),
                    success: true,
                    data: data.map(Arc::new),
                    error: None,
                    completion_percentage,
                })
            }
            Err(e) => {
                let message = e.to_string();
                let completion_percentage = session.with_state(|s| -> Result<f64> {
                    s.mark_chunk(index, ChunkStatus::Failed, Some(message.clone()))?;
                    Ok(s.completion_percentage())
                })?;
                session.persist(&self.store)?;

                warn!(
                    "分片 #{} 失败: {} (file_id={})",
                    index, message, session.file_id
                );

                Ok(ChunkDone {
                    index,
                    start: chunk.start,
                    end: chunk.end(),
                    success: false,
                    data: None,
                    error: Some(message),
                    completion_percentage,
                })
            }
        }
    }

    // =====================================================
    // 恢复与收尾
    // =====================================================

    /// 恢复操作
    ///
    /// 未附着时从状态存储加载（InProgress 回退为 Pending）；
    /// 已附着时以内存状态为准。返回所有未完成分片
    pub async fn resume_operation(&self, file_id: &str) -> Result<ResumeResult> {
        let session = self.attach(file_id)?;
        let (completion_percentage, remaining_chunks) =
            session.with_state(|s| (s.completion_percentage(), s.remaining_chunks()));

        info!(
            "恢复操作: file_id={}, 进度={:.1}%, 剩余分片={}",
            file_id,
            completion_percentage,
            remaining_chunks.len()
        );

        let event = session.resumed_event(completion_percentage, remaining_chunks.clone());
        self.emit(file_id, &event);

        Ok(ResumeResult {
            file_id: file_id.to_string(),
            success: true,
            completion_percentage,
            remaining_chunks,
        })
    }

    /// 完成写入
    ///
    /// 等待在途分片结束，要求全部分片完成，从后端获取内容哈希。
    /// 成功后释放会话，重复调用直接返回同一结果
    pub async fn finalize_write(&self, file_id: &str) -> Result<FinalizeResult> {
        if let Some(result) = self.finalized.get(file_id) {
            debug!("操作 {} 已完成，直接返回", file_id);
            return Ok(result.value().clone());
        }

        let session = self.attach(file_id)?;
        if session.direction() != Direction::Write {
            return Err(TransferError::validation(format!(
                "操作 {} 不是写入操作",
                file_id
            )));
        }

        let _guard = session.finalize_lock.lock().await;
        if let Some(result) = session.finalized() {
            debug!("操作 {} 已完成，直接返回", file_id);
            return Ok(result);
        }

        session.scheduler.drain().await;

        let (remaining, path, total_size) = session.with_state(|s| {
            (s.remaining_chunks(), s.file_path.clone(), s.total_size)
        });
        if !remaining.is_empty() {
            return Err(TransferError::Incomplete { remaining });
        }

        let stat = self
            .call_backend(self.backend.stat(&path))
            .await
            .map_err(map_missing)?;
        if stat.size != total_size {
            return Err(TransferError::Backend(BackendError::Io(format!(
                "对象大小 {} 与期望 {} 不一致",
                stat.size, total_size
            ))));
        }

        session.with_state(|s| {
            s.content_hash = Some(stat.content_hash.clone());
            s.touch();
        });
        self.retire_state(&session)?;

        let result = FinalizeResult {
            success: true,
            hash: Some(stat.content_hash),
        };
        // 先登记结果再释放会话，并发写入总能看到其中之一
        session.set_finalized(result.clone());
        self.finalized.insert(file_id.to_string(), result.clone());
        self.sessions.remove(file_id);
        self.callbacks.remove(file_id);

        info!(
            "写入完成: file_id={}, 路径={}, 大小={}",
            file_id, path, total_size
        );
        Ok(result)
    }

    /// 完成读取
    ///
    /// 要求全部分片完成，释放该操作的调度与去重资源
    pub async fn finalize_read(&self, file_id: &str) -> Result<FinalizeResult> {
        let session = self.attach(file_id)?;
        if session.direction() != Direction::Read {
            return Err(TransferError::validation(format!(
                "操作 {} 不是读取操作",
                file_id
            )));
        }

        let _guard = session.finalize_lock.lock().await;
        session.scheduler.drain().await;

        let remaining = session.with_state(|s| s.remaining_chunks());
        if !remaining.is_empty() {
            return Err(TransferError::Incomplete { remaining });
        }

        self.retire_state(&session)?;
        self.sessions.remove(file_id);
        self.callbacks.remove(file_id);

        info!("读取完成: file_id={}", file_id);
        Ok(FinalizeResult {
            success: true,
            hash: None,
        })
    }

    /// 按配置保留或删除已完成操作的状态
    fn retire_state(&self, session: &TransferSession) -> Result<()> {
        if self.config.engine.retain_completed_state {
            session.persist(&self.store)
        } else {
            self.store.delete(&session.file_id).map(|_| ())
        }
    }

    /// 放弃操作
    ///
    /// 等待在途分片结束后删除状态；`remove_data` 时一并删除写入目标
    pub async fn abort_operation(&self, file_id: &str, remove_data: bool) -> Result<()> {
        let state = match self.sessions.remove(file_id) {
            Some((_, session)) => {
                session.scheduler.drain().await;
                Some(session.snapshot())
            }
            None => match self.store.load(file_id) {
                Ok(state) => Some(state),
                Err(TransferError::CorruptState { .. }) => None,
                Err(e) => return Err(e),
            },
        };

        self.store.delete(file_id)?;
        self.callbacks.remove(file_id);
        self.finalized.remove(file_id);

        if let Some(state) = state.filter(|s| remove_data && s.direction == Direction::Write) {
            match self.call_backend(self.backend.remove(&state.file_path)).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("已放弃操作: file_id={}, 删除数据={}", file_id, remove_data);
        Ok(())
    }

    // =====================================================
    // 列表、复制与状态访问
    // =====================================================

    /// 列出所有持久化的操作
    pub fn list_resumable_operations(&self) -> Result<Vec<StateSummary>> {
        self.store.list()
    }

    /// 断点复制
    ///
    /// 新 file_id 继承源状态，只复制已完成分片的数据，其余分片保持待传输，
    /// 复制出的操作本身可继续写入完成。源操作全部完成时整体复制对象
    pub async fn copy_resumable(
        &self,
        source_id: &str,
        destination_path: &str,
    ) -> Result<CopyResult> {
        let source = self.attach(source_id)?.snapshot();
        let destination =
            normalize_path(destination_path).map_err(|e| TransferError::validation(e.to_string()))?;

        let file_id = Uuid::new_v4().to_string();
        let mut state = source.clone();
        state.file_id = file_id.clone();
        state.file_path = destination.clone();
        state.direction = Direction::Write;
        state.content_hash = None;
        state.created_at = chrono::Utc::now();
        state.touch();
        for chunk in &mut state.chunks {
            if !chunk.status.is_completed() {
                chunk.status = ChunkStatus::Pending;
            }
            chunk.attempt_count = 0;
            chunk.last_error = None;
        }

        if let Some(parent) = parent_path(&destination) {
            self.call_backend(self.backend.mkdir(&parent, true)).await?;
        }

        if source.completed {
            self.call_backend(self.backend.copy(&source.file_path, &destination))
                .await
                .map_err(map_missing)?;
        } else {
            self.call_backend(self.backend.write(&destination, &[], 0, true))
                .await?;

            for chunk in source.chunks.iter().filter(|c| c.status.is_completed()) {
                let data = self
                    .call_backend(self.backend.read(&source.file_path, chunk.start, chunk.size))
                    .await
                    .map_err(map_missing)?;
                if data.len() as u64 != chunk.size {
                    return Err(TransferError::Backend(BackendError::Io(format!(
                        "源分片 #{} 长度不足: 期望 {} bytes, 实际 {} bytes",
                        chunk.index,
                        chunk.size,
                        data.len()
                    ))));
                }
                self.call_backend(self.backend.write(&destination, &data, chunk.start, false))
                    .await?;
            }

            if source.adaptive_chunking && source.optimal_chunk_size != source.chunk_size {
                debug!(
                    "按推荐分片大小重新规划: {} -> {}",
                    source.chunk_size, source.optimal_chunk_size
                );
                state.replan_pending(source.optimal_chunk_size)?;
            }
        }

        self.store.save(&file_id, &state)?;
        let completion_percentage = state.completion_percentage();
        self.register_session(state);

        info!(
            "断点复制: {} -> {} (新 file_id={}, 进度={:.1}%)",
            source_id, destination, file_id, completion_percentage
        );

        Ok(CopyResult {
            success: true,
            file_id,
            completion_percentage,
        })
    }

    /// 读取操作状态（已附着时返回内存快照）
    pub fn load_state(&self, file_id: &str) -> Result<FileState> {
        match self.sessions.get(file_id) {
            Some(session) => Ok(session.snapshot()),
            None => self.store.load(file_id),
        }
    }

    /// 覆盖保存操作状态
    ///
    /// 已附着且有在途分片时拒绝
    pub fn save_state(&self, state: FileState) -> Result<()> {
        state
            .validate()
            .map_err(|reason| TransferError::validation(format!("状态无效: {}", reason)))?;

        let file_id = state.file_id.clone();
        let session = self.sessions.get(&file_id).map(|s| s.value().clone());
        match session {
            Some(session) => {
                if session.scheduler.in_flight_count() > 0 {
                    return Err(TransferError::Concurrency(format!(
                        "操作 {} 有在途分片，不能覆盖状态",
                        file_id
                    )));
                }
                session.replace_state(state);
                session.persist(&self.store)
            }
            None => self.store.save(&file_id, &state),
        }
    }

    /// 清理超过保留期未更新的状态
    pub fn cleanup_expired_states(&self) -> Result<Vec<String>> {
        let removed = self
            .store
            .cleanup_expired(self.config.persistence.retention_days)?;
        for file_id in &removed {
            self.sessions.remove(file_id);
            self.callbacks.remove(file_id);
            self.finalized.remove(file_id);
        }
        Ok(removed)
    }

    // =====================================================
    // 进度回调
    // =====================================================

    /// 注册进度回调（替换已有回调）
    pub fn register_progress_callback<F>(&self, file_id: &str, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .insert(file_id.to_string(), Arc::new(callback));
    }

    /// 注销进度回调，返回之前是否存在
    pub fn unregister_progress_callback(&self, file_id: &str) -> bool {
        self.callbacks.remove(file_id).is_some()
    }

    /// 触发回调（先取出回调再调用，不持有任何内部锁）
    fn emit(&self, file_id: &str, event: &ProgressEvent) {
        let callback = self
            .callbacks
            .get(file_id)
            .map(|entry| entry.value().clone());
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

/// 校验写入参数，返回目标分片
fn prepare_write(session: &TransferSession, target: ChunkTarget, len: usize) -> Result<Chunk> {
    if session.direction() != Direction::Write {
        return Err(TransferError::validation(format!(
            "操作 {} 不是写入操作",
            session.file_id
        )));
    }
    if session.finalized().is_some() {
        return Err(TransferError::Concurrency(format!(
            "操作 {} 已完成，不能继续写入",
            session.file_id
        )));
    }

    session.with_state(|s| {
        let index = match target {
            ChunkTarget::Index(index) => index,
            ChunkTarget::Offset(offset) => s.chunk_index_for_offset(offset)?,
        };
        let chunk = s.chunk(index)?.clone();
        if len as u64 != chunk.size {
            return Err(TransferError::SizeMismatch {
                index,
                expected: chunk.size,
                actual: len as u64,
            });
        }
        Ok(chunk)
    })
}

/// 批量操作中同一分片只能出现一次
fn reject_duplicates(indices: impl IntoIterator<Item = usize>) -> Result<()> {
    let mut seen = HashSet::new();
    for index in indices {
        if !seen.insert(index) {
            return Err(TransferError::validation(format!(
                "批量操作中分片 #{} 重复出现",
                index
            )));
        }
    }
    Ok(())
}

/// 校验读取参数，返回目标分片
fn prepare_read(session: &TransferSession, index: usize) -> Result<Chunk> {
    if session.direction() != Direction::Read {
        return Err(TransferError::validation(format!(
            "操作 {} 不是读取操作",
            session.file_id
        )));
    }
    session.with_state(|s| s.chunk(index).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, MemoryBackend};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn setup_with(
        adjust: impl FnOnce(&mut TransferConfig),
    ) -> (TempDir, Arc<MemoryBackend>, TransferEngine) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = TransferConfig::with_state_dir(temp_dir.path().join("state"));
        adjust(&mut config);
        let backend = Arc::new(MemoryBackend::new());
        let engine = TransferEngine::new(backend.clone(), config);
        (temp_dir, backend, engine)
    }

    fn setup() -> (TempDir, Arc<MemoryBackend>, TransferEngine) {
        setup_with(|_| {})
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_start_write_creates_object_and_state() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("/data/out.bin", 10, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        assert_eq!(backend.object("data/out.bin"), Some(Vec::new()));
        let state = engine.store().load(&file_id).unwrap();
        assert_eq!(state.chunk_count(), 3);
        assert_eq!(state.chunks[2].size, 2);
        assert_eq!(state.direction, Direction::Write);
        assert!(!state.completed);
    }

    #[tokio::test]
    async fn test_start_write_rejects_zero_chunk_size() {
        let (_dir, _backend, engine) = setup();
        let result = engine
            .start_resumable_write("f", 10, WriteOptions::with_chunk_size(0))
            .await;
        assert!(matches!(result, Err(TransferError::Validation(_))));
    }

    #[tokio::test]
    async fn test_empty_file_is_complete_immediately() {
        let (_dir, _backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("empty", 0, WriteOptions::with_chunk_size(65536))
            .await
            .unwrap();

        let state = engine.load_state(&file_id).unwrap();
        assert!(state.completed);
        assert!(state.chunks.is_empty());
        assert_eq!(state.completion_percentage(), 100.0);

        let result = engine.finalize_write(&file_id).await.unwrap();
        assert!(result.success);
        assert_eq!(
            result.hash.as_deref(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[tokio::test]
    async fn test_write_chunk_size_mismatch_keeps_pending() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        let result = engine.write_chunk(&file_id, 0, b"abc").await;
        assert!(matches!(
            result,
            Err(TransferError::SizeMismatch {
                index: 0,
                expected: 4,
                actual: 3
            })
        ));
        let state = engine.load_state(&file_id).unwrap();
        assert_eq!(state.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(backend.chunk_write_count("f", 0), 0);
    }

    #[tokio::test]
    async fn test_write_chunk_by_offset() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        let result = engine
            .write_chunk_at(&file_id, ChunkTarget::Offset(6), b"efgh")
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.chunk_index, 1);
        assert_eq!((result.chunk_start, result.chunk_end), (4, 8));
        assert_eq!(result.completion_percentage, 50.0);
        assert_eq!(backend.object("f").unwrap(), b"\0\0\0\0efgh");
    }

    #[tokio::test]
    async fn test_unknown_file_id_and_bad_index() {
        let (_dir, _backend, engine) = setup();
        assert!(matches!(
            engine.write_chunk("missing", 0, b"x").await,
            Err(TransferError::NotFound(_))
        ));

        let file_id = engine
            .start_resumable_write("f", 4, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        assert!(matches!(
            engine.write_chunk(&file_id, 5, b"abcd").await,
            Err(TransferError::Validation(_))
        ));
        assert!(matches!(
            engine.read_chunk(&file_id, 0).await,
            Err(TransferError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotent_rewrite() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        let first = engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
        let content = backend.object("f").unwrap();
        let second = engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();

        assert_eq!(first.completion_percentage, second.completion_percentage);
        assert_eq!(backend.object("f").unwrap(), content);
        let state = engine.load_state(&file_id).unwrap();
        assert_eq!(state.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(state.chunks[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_chunk_single_physical_write() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4).parallel(4))
            .await
            .unwrap();
        backend.inject_delay(BackendOp::Write, "f", 0, Duration::from_millis(100));

        let (a, b) = tokio::join!(
            engine.write_chunk(&file_id, 0, b"abcd"),
            engine.write_chunk(&file_id, 0, b"abcd")
        );

        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        assert_eq!(backend.chunk_write_count("f", 0), 1);
    }

    #[tokio::test]
    async fn test_failure_isolated_in_multi_write() {
        let (_dir, backend, engine) = setup_with(|c| c.engine.max_retries = 0);
        let file_id = engine
            .start_resumable_write("f", 12, WriteOptions::with_chunk_size(4).parallel(3))
            .await
            .unwrap();
        backend.inject_failure(
            BackendOp::Write,
            "f",
            4,
            1,
            BackendError::Io("connection reset".to_string()),
        );

        let result = engine
            .write_multiple_chunks(
                &file_id,
                vec![(0, payload(4, 0)), (1, payload(4, 4)), (2, payload(4, 8))],
            )
            .await
            .unwrap();

        assert_eq!(result.completed_chunks, 2);
        assert_eq!(result.failed_chunks, 1);
        let failed = &result.results[&1];
        assert!(!failed.success);
        assert!(failed.error.as_deref().unwrap().contains("connection reset"));

        let state = engine.load_state(&file_id).unwrap();
        assert_eq!(state.chunks[1].status, ChunkStatus::Failed);
        assert!(state.chunks[1].last_error.is_some());
        assert_eq!(state.remaining_chunks(), vec![1]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 4, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        backend.inject_failure(
            BackendOp::Write,
            "f",
            0,
            2,
            BackendError::Io("flaky".to_string()),
        );

        let result = engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
        assert!(result.success);
        let state = engine.load_state(&file_id).unwrap();
        assert_eq!(state.chunks[0].attempt_count, 3);
        assert_eq!(state.chunks[0].status, ChunkStatus::Completed);
    }

    #[tokio::test]
    async fn test_chunk_timeout_marks_failed() {
        let (_dir, backend, engine) = setup_with(|c| {
            c.engine.chunk_timeout_secs = 1;
            c.engine.max_retries = 0;
        });
        let file_id = engine
            .start_resumable_write("f", 4, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        backend.inject_delay(BackendOp::Write, "f", 0, Duration::from_secs(3));

        let result = engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
        assert!(!result.success);

        let state = engine.load_state(&file_id).unwrap();
        assert_eq!(state.chunks[0].status, ChunkStatus::Failed);
        assert_eq!(
            state.chunks[0].last_error,
            Some(BackendError::Timeout(Duration::from_secs(1)).to_string())
        );

        // 超时可重试
        backend.clear_faults();
        assert!(engine.write_chunk(&file_id, 0, b"abcd").await.unwrap().success);
    }

    #[tokio::test]
    async fn test_finalize_guard_and_idempotence() {
        let (_dir, _backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();

        match engine.finalize_write(&file_id).await {
            Err(TransferError::Incomplete { remaining }) => assert_eq!(remaining, vec![1]),
            other => panic!("unexpected: {:?}", other),
        }

        engine.write_chunk(&file_id, 1, b"efgh").await.unwrap();
        let first = engine.finalize_write(&file_id).await.unwrap();
        let second = engine.finalize_write(&file_id).await.unwrap();
        assert!(first.success);
        assert!(!first.hash.as_deref().unwrap().is_empty());
        assert_eq!(first, second);

        // 默认不保留状态，会话已释放
        assert!(!engine.store().exists(&file_id));
        assert!(!engine.is_attached(&file_id));

        assert!(matches!(
            engine.write_chunk(&file_id, 0, b"abcd").await,
            Err(TransferError::Concurrency(_))
        ));
        assert!(matches!(
            engine
                .write_multiple_chunks(&file_id, vec![(1, b"efgh".to_vec())])
                .await,
            Err(TransferError::Concurrency(_))
        ));
        assert_eq!(engine.finalize_write(&file_id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_finalized_writes_release_sessions() {
        let (_dir, _backend, engine) = setup();

        let mut file_ids = Vec::new();
        for n in 0..20 {
            let path = format!("out/{}.bin", n);
            let file_id = engine
                .start_resumable_write(&path, 4, WriteOptions::with_chunk_size(4))
                .await
                .unwrap();
            engine.register_progress_callback(&file_id, |_| {});
            engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
            engine.finalize_write(&file_id).await.unwrap();
            file_ids.push(file_id);
        }

        assert!(file_ids.iter().all(|id| !engine.is_attached(id)));
        assert!(file_ids
            .iter()
            .all(|id| !engine.unregister_progress_callback(id)));
        assert!(engine.list_resumable_operations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_and_operation_resumes() {
        let (dir, backend, engine) = setup_with(|c| c.engine.max_retries = 0);
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();

        // 状态文件的位置被目录占据，原子重命名失败
        let state_path = engine.store().state_path(&file_id);
        let saved = std::fs::read(&state_path).unwrap();
        std::fs::remove_file(&state_path).unwrap();
        std::fs::create_dir(&state_path).unwrap();

        match engine.write_chunk(&file_id, 1, b"efgh").await {
            Err(TransferError::Persistence { file_id: failed, .. }) => {
                assert_eq!(failed, file_id)
            }
            other => panic!("unexpected: {:?}", other),
        }
        drop(engine);

        std::fs::remove_dir(&state_path).unwrap();
        std::fs::write(&state_path, saved).unwrap();

        let config = TransferConfig::with_state_dir(dir.path().join("state"));
        let engine = TransferEngine::new(backend.clone(), config);
        let resumed = engine.resume_operation(&file_id).await.unwrap();
        assert_eq!(resumed.remaining_chunks, vec![1]);

        assert!(engine.write_chunk(&file_id, 1, b"efgh").await.unwrap().success);
        assert!(engine.finalize_write(&file_id).await.unwrap().success);
        assert_eq!(backend.object("f").unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_duplicate_indices_in_batch_rejected() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        let batch = vec![(0, b"abcd".to_vec()), (1, b"efgh".to_vec()), (0, b"wxyz".to_vec())];
        assert!(matches!(
            engine.write_multiple_chunks(&file_id, batch).await,
            Err(TransferError::Validation(_))
        ));
        // 校验在提交之前，没有任何分片写出
        assert_eq!(backend.chunk_write_count("f", 0), 0);
        assert_eq!(backend.chunk_write_count("f", 4), 0);

        backend.put_object("r", vec![7; 8]);
        let read_id = engine
            .start_resumable_read("r", ReadOptions::with_chunk_size(4))
            .await
            .unwrap();
        assert!(matches!(
            engine.read_multiple_chunks(&read_id, &[1, 1]).await,
            Err(TransferError::Validation(_))
        ));
        assert_eq!(backend.read_count("r", 4), 0);
    }

    #[tokio::test]
    async fn test_finalize_retains_state_when_configured() {
        let (_dir, _backend, engine) = setup_with(|c| c.engine.retain_completed_state = true);
        let file_id = engine
            .start_resumable_write("f", 4, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
        let result = engine.finalize_write(&file_id).await.unwrap();

        let state = engine.store().load(&file_id).unwrap();
        assert!(state.completed);
        assert_eq!(state.content_hash, result.hash);
    }

    #[tokio::test]
    async fn test_resume_after_restart_resets_in_progress() {
        let (dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 12, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();

        // 模拟崩溃：分片 1 停留在进行中
        let mut state = engine.store().load(&file_id).unwrap();
        state.mark_chunk(1, ChunkStatus::InProgress, None).unwrap();
        engine.store().save(&file_id, &state).unwrap();
        drop(engine);

        let config = TransferConfig::with_state_dir(dir.path().join("state"));
        let engine = TransferEngine::new(backend.clone(), config);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.register_progress_callback(&file_id, move |e| sink.lock().push(e.clone()));

        let resumed = engine.resume_operation(&file_id).await.unwrap();
        assert_eq!(resumed.remaining_chunks, vec![1, 2]);
        assert!((resumed.completion_percentage - 100.0 / 3.0).abs() < 1e-9);

        let persisted = engine.store().load(&file_id).unwrap();
        assert_eq!(persisted.chunks[1].status, ChunkStatus::Pending);

        let events = events.lock();
        assert!(matches!(
            &events[0],
            ProgressEvent::OperationResumed { remaining_chunks, .. } if remaining_chunks == &vec![1, 2]
        ));
    }

    #[tokio::test]
    async fn test_progress_callback_replaced_and_unregistered() {
        let (_dir, _backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();

        let first = Arc::new(Mutex::new(0usize));
        let second = Arc::new(Mutex::new(Vec::new()));
        let counter = first.clone();
        engine.register_progress_callback(&file_id, move |_| *counter.lock() += 1);
        let sink = second.clone();
        engine.register_progress_callback(&file_id, move |e| sink.lock().push(e.clone()));

        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();
        assert_eq!(*first.lock(), 0);
        match &second.lock()[0] {
            ProgressEvent::ChunkCompleted {
                chunk_index,
                completion_percentage,
                bytes_remaining,
                chunk_start,
                chunk_end,
                ..
            } => {
                assert_eq!(*chunk_index, 0);
                assert_eq!(*completion_percentage, 50.0);
                assert_eq!(*bytes_remaining, 4);
                assert_eq!((*chunk_start, *chunk_end), (0, 4));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(engine.unregister_progress_callback(&file_id));
        engine.write_chunk(&file_id, 1, b"efgh").await.unwrap();
        assert_eq!(second.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_read_chunks_out_of_order_and_finalize_read() {
        let (_dir, backend, engine) = setup();
        backend.put_object("src.bin", payload(10, 0));

        let file_id = engine
            .start_resumable_read("src.bin", ReadOptions::with_chunk_size(4).parallel(2))
            .await
            .unwrap();

        let last = engine.read_chunk(&file_id, 2).await.unwrap();
        assert_eq!(last.chunk_data, payload(10, 0)[8..]);

        assert!(matches!(
            engine.finalize_read(&file_id).await,
            Err(TransferError::Incomplete { .. })
        ));

        let rest = engine.read_multiple_chunks(&file_id, &[1, 0]).await.unwrap();
        assert_eq!(rest.completed_chunks, 2);
        assert_eq!(rest.results[&0].chunk_data, payload(10, 0)[..4]);
        assert_eq!(rest.completion_percentage, 100.0);

        let result = engine.finalize_read(&file_id).await.unwrap();
        assert!(result.success);
        assert!(!engine.is_attached(&file_id));
        assert!(!engine.store().exists(&file_id));
    }

    #[tokio::test]
    async fn test_start_read_missing_path() {
        let (_dir, _backend, engine) = setup();
        assert!(matches!(
            engine
                .start_resumable_read("nope", ReadOptions::with_chunk_size(4))
                .await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_partial_only_completed_chunks() {
        let (_dir, backend, engine) = setup();
        let source = engine
            .start_resumable_write("src", 12, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&source, 0, b"aaaa").await.unwrap();
        engine.write_chunk(&source, 2, b"cccc").await.unwrap();

        let copy = engine.copy_resumable(&source, "dst").await.unwrap();
        assert!(copy.success);
        assert_ne!(copy.file_id, source);
        assert!((copy.completion_percentage - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(backend.object("dst").unwrap(), b"aaaa\0\0\0\0cccc");

        let state = engine.load_state(&copy.file_id).unwrap();
        assert_eq!(state.file_path, "dst");
        assert_eq!(state.remaining_chunks(), vec![1]);

        // 复制出的操作可以继续完成
        engine.write_chunk(&copy.file_id, 1, b"bbbb").await.unwrap();
        let done = engine.finalize_write(&copy.file_id).await.unwrap();
        assert!(done.success);
        assert_eq!(backend.object("dst").unwrap(), b"aaaabbbbcccc");
    }

    #[tokio::test]
    async fn test_copy_completed_uses_whole_object_copy() {
        let (_dir, backend, engine) = setup();
        let source = engine
            .start_resumable_write("src", 4, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&source, 0, b"abcd").await.unwrap();

        let copy = engine.copy_resumable(&source, "nested/dst").await.unwrap();
        assert_eq!(copy.completion_percentage, 100.0);
        assert_eq!(backend.object("nested/dst").unwrap(), b"abcd");
        assert_eq!(backend.read_count("src", 0), 0);
    }

    #[tokio::test]
    async fn test_copy_replans_with_optimal_size() {
        let (_dir, _backend, engine) = setup();
        let source = engine
            .start_resumable_write("src", 10, WriteOptions::with_chunk_size(2).adaptive())
            .await
            .unwrap();
        engine.write_chunk(&source, 0, b"ab").await.unwrap();

        let mut state = engine.load_state(&source).unwrap();
        state.optimal_chunk_size = 4;
        engine.save_state(state).unwrap();

        let copy = engine.copy_resumable(&source, "dst").await.unwrap();
        let state = engine.load_state(&copy.file_id).unwrap();
        let ranges: Vec<(u64, u64)> = state.chunks.iter().map(|c| (c.start, c.size)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (6, 4)]);
        assert_eq!(state.chunk_size, 4);
        assert_eq!(state.chunks[0].status, ChunkStatus::Completed);
    }

    #[tokio::test]
    async fn test_abort_operation_removes_state_and_data() {
        let (_dir, backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        engine.write_chunk(&file_id, 0, b"abcd").await.unwrap();

        engine.abort_operation(&file_id, true).await.unwrap();
        assert!(!engine.is_attached(&file_id));
        assert!(!engine.store().exists(&file_id));
        assert!(backend.object("f").is_none());
        assert!(matches!(
            engine.resume_operation(&file_id).await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_resumable_operations() {
        let (_dir, backend, engine) = setup();
        backend.put_object("r", vec![1; 6]);
        let write_id = engine
            .start_resumable_write("w", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        let read_id = engine
            .start_resumable_read("r", ReadOptions::with_chunk_size(4))
            .await
            .unwrap();

        let list = engine.list_resumable_operations().unwrap();
        let ids: Vec<&str> = list.iter().map(|s| s.file_id.as_str()).collect();
        assert_eq!(list.len(), 2);
        assert!(ids.contains(&write_id.as_str()));
        assert!(ids.contains(&read_id.as_str()));
    }

    #[tokio::test]
    async fn test_save_state_rejects_invalid() {
        let (_dir, _backend, engine) = setup();
        let file_id = engine
            .start_resumable_write("f", 8, WriteOptions::with_chunk_size(4))
            .await
            .unwrap();
        let mut state = engine.load_state(&file_id).unwrap();
        state.chunks.pop();
        assert!(matches!(
            engine.save_state(state),
            Err(TransferError::Validation(_))
        ));
    }
}
