//! 传输状态核心类型
//!
//! 定义分片、分片状态以及可持久化的 `FileState`
//!
//! ## 分片规则
//!
//! - 分片连续覆盖 `[0, total_size)`，互不重叠，按起始偏移排序
//! - 最后一个分片截断为余数
//! - `total_size == 0` 时没有分片，状态直接视为已完成

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{Result, TransferError};

/// 当前状态文件格式版本
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// 等待传输
    Pending,
    /// 传输中（崩溃恢复时一律回退为 Pending）
    InProgress,
    /// 已完成
    Completed,
    /// 失败（可重试）
    Failed,
}

impl ChunkStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// 从后端读取
    Read,
    /// 写入后端
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// 分片信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 起始偏移
    pub start: u64,
    /// 分片大小
    pub size: u64,
    /// 分片状态
    pub status: ChunkStatus,
    /// 物理 I/O 尝试次数
    #[serde(default)]
    pub attempt_count: u32,
    /// 最近一次失败原因
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn new(index: usize, start: u64, size: u64) -> Self {
        Self {
            index,
            start,
            size,
            status: ChunkStatus::Pending,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// 结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.start..self.end()
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// 计算分片
///
/// 产生 ⌈total_size / chunk_size⌉ 个分片，最后一个截断为余数
pub fn partition(total_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(TransferError::validation("chunk_size 必须大于 0"));
    }

    Ok(partition_range(0, total_size, chunk_size, 0))
}

/// 把 `[start, end)` 切成分片，索引从 `first_index` 开始
fn partition_range(start: u64, end: u64, chunk_size: u64, first_index: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut offset = start;
    let mut index = first_index;

    while offset < end {
        let chunk_end = std::cmp::min(offset.saturating_add(chunk_size), end);
        chunks.push(Chunk::new(index, offset, chunk_end - offset));
        offset = chunk_end;
        index += 1;
    }

    chunks
}

/// 文件传输状态
///
/// 每个 file_id 一条记录，每次变更后整体原子覆盖写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// 状态格式版本
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// 操作句柄（跨进程恢复的唯一凭据）
    pub file_id: String,

    /// 后端对象路径
    pub file_path: String,

    /// 传输方向
    pub direction: Direction,

    /// 文件总大小
    pub total_size: u64,

    /// 分片大小
    pub chunk_size: u64,

    /// 自适应建议的分片大小（仅用于观测和重新规划）
    pub optimal_chunk_size: u64,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,

    /// 是否全部分片完成
    pub completed: bool,

    /// 调用方附带的元数据
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// 是否开启自适应分片
    #[serde(default)]
    pub adaptive_chunking: bool,

    /// 最大并发分片数（未开启并行时为 1）
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// 写入完成后的内容哈希（finalize_write 成功后设置）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// 所有分片
    pub chunks: Vec<Chunk>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

fn default_max_parallel_chunks() -> usize {
    1
}

impl FileState {
    /// 创建新的传输状态
    pub fn new(
        file_id: String,
        file_path: String,
        direction: Direction,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        let chunks = partition(total_size, chunk_size)?;
        let now = Utc::now();

        Ok(Self {
            schema_version: STATE_SCHEMA_VERSION,
            file_id,
            file_path,
            direction,
            total_size,
            chunk_size,
            optimal_chunk_size: chunk_size,
            created_at: now,
            updated_at: now,
            completed: chunks.is_empty(),
            metadata: BTreeMap::new(),
            adaptive_chunking: false,
            max_parallel_chunks: 1,
            content_hash: None,
            chunks,
        })
    }

    /// 分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 已完成分片数量
    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.status.is_completed()).count()
    }

    /// 已完成的字节数
    pub fn completed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status.is_completed())
            .map(|c| c.size)
            .sum()
    }

    /// 剩余字节数
    pub fn bytes_remaining(&self) -> u64 {
        self.total_size - self.completed_bytes()
    }

    /// 完成百分比（按分片数计算，没有分片时为 100）
    pub fn completion_percentage(&self) -> f64 {
        if self.chunks.is_empty() {
            return 100.0;
        }
        100.0 * self.completed_count() as f64 / self.chunks.len() as f64
    }

    /// 未完成分片的索引
    pub fn remaining_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| !c.status.is_completed())
            .map(|c| c.index)
            .collect()
    }

    /// 获取分片
    pub fn chunk(&self, index: usize) -> Result<&Chunk> {
        self.chunks.get(index).ok_or_else(|| {
            TransferError::validation(format!(
                "分片索引越界: {} (共 {} 个分片)",
                index,
                self.chunks.len()
            ))
        })
    }

    /// 根据字节偏移定位分片
    pub fn chunk_index_for_offset(&self, offset: u64) -> Result<usize> {
        if offset >= self.total_size {
            return Err(TransferError::validation(format!(
                "偏移越界: {} (文件大小 {})",
                offset, self.total_size
            )));
        }

        // 分片按 start 有序，二分查找最后一个 start <= offset 的分片
        let pos = self.chunks.partition_point(|c| c.start <= offset);
        match pos.checked_sub(1).and_then(|i| self.chunks.get(i)) {
            Some(chunk) if chunk.contains(offset) => Ok(chunk.index),
            _ => Err(TransferError::validation(format!(
                "偏移 {} 不属于任何分片",
                offset
            ))),
        }
    }

    /// 变更单个分片状态
    ///
    /// 更新 `updated_at` 并重新计算 `completed`
    pub fn mark_chunk(
        &mut self,
        index: usize,
        status: ChunkStatus,
        error: Option<String>,
    ) -> Result<()> {
        let count = self.chunks.len();
        let chunk = self.chunks.get_mut(index).ok_or_else(|| {
            TransferError::validation(format!("分片索引越界: {} (共 {} 个分片)", index, count))
        })?;

        chunk.status = status;
        match status {
            ChunkStatus::Completed => chunk.last_error = None,
            ChunkStatus::Failed => chunk.last_error = error,
            ChunkStatus::Pending | ChunkStatus::InProgress => {
                if error.is_some() {
                    chunk.last_error = error;
                }
            }
        }

        self.touch();
        self.recompute_completed();
        Ok(())
    }

    /// 记录一次物理 I/O 尝试
    pub fn record_attempt(&mut self, index: usize) -> Result<u32> {
        let count = self.chunks.len();
        let chunk = self.chunks.get_mut(index).ok_or_else(|| {
            TransferError::validation(format!("分片索引越界: {} (共 {} 个分片)", index, count))
        })?;
        chunk.attempt_count += 1;
        Ok(chunk.attempt_count)
    }

    /// 崩溃恢复：InProgress 一律回退为 Pending
    ///
    /// 返回被回退的分片数
    pub fn reset_in_progress(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::InProgress {
                chunk.status = ChunkStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            self.touch();
            self.recompute_completed();
        }
        reset
    }

    /// 重新规划未完成区间
    ///
    /// 已完成分片保持原范围，其余连续的未完成区间按 `chunk_size` 重新切分，
    /// 所有分片重新连续编号
    pub fn replan_pending(&mut self, chunk_size: u64) -> Result<()> {
        if chunk_size == 0 {
            return Err(TransferError::validation("chunk_size 必须大于 0"));
        }

        let mut replanned: Vec<Chunk> = Vec::with_capacity(self.chunks.len());
        let mut pending_run: Option<Range<u64>> = None;

        for chunk in self.chunks.drain(..) {
            if chunk.status.is_completed() {
                if let Some(run) = pending_run.take() {
                    let next = replanned.len();
                    replanned.extend(partition_range(run.start, run.end, chunk_size, next));
                }
                let mut kept = chunk;
                kept.index = replanned.len();
                replanned.push(kept);
            } else {
                pending_run = Some(match pending_run {
                    Some(run) => run.start..chunk.end(),
                    None => chunk.range(),
                });
            }
        }

        if let Some(run) = pending_run {
            let next = replanned.len();
            replanned.extend(partition_range(run.start, run.end, chunk_size, next));
        }

        self.chunks = replanned;
        self.chunk_size = chunk_size;
        self.touch();
        self.recompute_completed();
        Ok(())
    }

    /// 校验分片不变量
    ///
    /// 分片大小之和等于总大小，连续、不重叠、有序
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut expected_start = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.index != i {
                return Err(format!("分片 #{} 的索引字段为 {}", i, chunk.index));
            }
            if chunk.start != expected_start {
                return Err(format!(
                    "分片 #{} 起始偏移 {} 与期望 {} 不一致",
                    i, chunk.start, expected_start
                ));
            }
            if chunk.size == 0 {
                return Err(format!("分片 #{} 大小为 0", i));
            }
            expected_start = chunk.end();
        }
        if expected_start != self.total_size {
            return Err(format!(
                "分片总大小 {} 与文件大小 {} 不一致",
                expected_start, self.total_size
            ));
        }
        if self.completed != self.chunks.iter().all(|c| c.status.is_completed()) {
            return Err("completed 标志与分片状态不一致".to_string());
        }
        Ok(())
    }

    /// 生成列表摘要
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            file_id: self.file_id.clone(),
            file_path: self.file_path.clone(),
            direction: self.direction,
            total_size: self.total_size,
            completion_percentage: self.completion_percentage(),
            completed: self.completed,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// 更新时间戳
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn recompute_completed(&mut self) {
        self.completed = self.chunks.iter().all(|c| c.status.is_completed());
    }
}

/// 持久化状态摘要（列表用，不需要挂载到引擎）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub file_id: String,
    pub file_path: String,
    pub direction: Direction,
    pub total_size: u64,
    pub completion_percentage: f64,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
